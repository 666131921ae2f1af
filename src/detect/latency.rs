//! Latency spikes, jitter spikes, and peer latency outliers for ping measurements.

use tracing::debug;

use crate::config::ThresholdConfig;
use crate::detect::anomaly::{jitter, TimeSeries};
use crate::detect::baseline::BaselineStore;
use crate::detect::engine::PingObservation;
use crate::detect::{AnomalyEvent, AnomalyKind, EventContext, Finding, Severity};

pub struct LatencyDetector<'a> {
    thresholds: &'a ThresholdConfig,
}

impl<'a> LatencyDetector<'a> {
    pub fn new(thresholds: &'a ThresholdConfig) -> Self {
        Self { thresholds }
    }

    /// Evaluate every observation, then fold its latency into the probe's
    /// baseline. Each sample is judged against the prior baseline only.
    pub(crate) fn detect(
        &self,
        ctx: &EventContext<'_>,
        observations: &[PingObservation<'_>],
        store: &BaselineStore,
    ) -> Vec<AnomalyEvent> {
        let peer_median = self.peer_median(observations);
        let mut events = Vec::new();

        for obs in observations {
            if let Some(avg) = obs.avg_rtt {
                let spike = store.with_entry(ctx.target, obs.probe_id, |slot| {
                    let prior = slot.as_ref().and_then(|b| b.avg_latency);
                    let finding = self.check_spike(obs.probe_id, avg, prior);
                    store.apply(slot, Some(avg), None, obs.observed_at);
                    finding
                });
                if let Some(finding) = spike {
                    events.push(ctx.event(finding));
                }
            }

            if let Some(finding) = self.check_jitter(obs) {
                events.push(ctx.event(finding));
            }

            if let (Some(median), Some(avg)) = (peer_median, obs.avg_rtt) {
                if let Some(finding) = self.check_outlier(obs.probe_id, avg, median) {
                    events.push(ctx.event(finding));
                }
            }
        }

        events
    }

    /// Median of reachable probes' average RTT, or `None` with too few peers.
    fn peer_median(&self, observations: &[PingObservation<'_>]) -> Option<f64> {
        let reporting: Vec<f64> = observations.iter().filter_map(|o| o.avg_rtt).collect();
        match TimeSeries::new(reporting).peer_median() {
            Ok(median) => Some(median),
            Err(e) => {
                debug!(error = %e, "Skipping peer latency comparison");
                None
            }
        }
    }

    fn check_spike(&self, probe_id: u64, avg: f64, baseline: Option<f64>) -> Option<Finding> {
        let ceiling = self.thresholds.latency_spike_ms;
        let adaptive = baseline.map(|b| b * self.thresholds.outlier_factor);

        let (threshold, reason) = if avg > ceiling {
            (ceiling, format!("exceeds the {:.1}ms ceiling", ceiling))
        } else {
            match (adaptive, baseline) {
                (Some(limit), Some(base)) if avg > limit => (
                    limit,
                    format!(
                        "is more than {}x the {:.1}ms baseline",
                        self.thresholds.outlier_factor, base
                    ),
                ),
                _ => return None,
            }
        };

        let severity = if avg > 2.0 * ceiling {
            Severity::Critical
        } else {
            Severity::Warning
        };

        Some(Finding {
            kind: AnomalyKind::LatencySpike,
            probe_id,
            metric: "ping_rtt_ms",
            units: "ms",
            value: avg,
            threshold,
            severity,
            description: format!("Average RTT {:.1}ms {}", avg, reason),
            route: None,
        })
    }

    fn check_jitter(&self, obs: &PingObservation<'_>) -> Option<Finding> {
        let value = jitter(obs.rtts, obs.min_rtt, obs.max_rtt)?;
        if value <= self.thresholds.jitter_spike_ms {
            return None;
        }
        Some(Finding {
            kind: AnomalyKind::JitterSpike,
            probe_id: obs.probe_id,
            metric: "ping_jitter_ms",
            units: "ms",
            value,
            threshold: self.thresholds.jitter_spike_ms,
            severity: Severity::Warning,
            description: format!(
                "RTT variation {:.1}ms exceeds {:.1}ms",
                value, self.thresholds.jitter_spike_ms
            ),
            route: None,
        })
    }

    fn check_outlier(&self, probe_id: u64, avg: f64, median: f64) -> Option<Finding> {
        let limit = median * self.thresholds.outlier_factor;
        if avg <= limit {
            return None;
        }
        Some(Finding {
            kind: AnomalyKind::OutlierProbeLatency,
            probe_id,
            metric: "ping_rtt_ms",
            units: "ms",
            value: avg,
            threshold: limit,
            severity: Severity::Warning,
            description: format!(
                "Average RTT {:.1}ms is more than {}x the peer median of {:.1}ms",
                avg, self.thresholds.outlier_factor, median
            ),
            route: None,
        })
    }
}
