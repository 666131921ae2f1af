//! Packet loss, unreachable hosts, and peer loss outliers for ping measurements.

use tracing::debug;

use crate::config::ThresholdConfig;
use crate::detect::anomaly::TimeSeries;
use crate::detect::engine::PingObservation;
use crate::detect::{AnomalyEvent, AnomalyKind, EventContext, Finding, Severity};

pub struct ConnectivityDetector<'a> {
    thresholds: &'a ThresholdConfig,
}

impl<'a> ConnectivityDetector<'a> {
    pub fn new(thresholds: &'a ThresholdConfig) -> Self {
        Self { thresholds }
    }

    pub(crate) fn detect(
        &self,
        ctx: &EventContext<'_>,
        observations: &[PingObservation<'_>],
    ) -> Vec<AnomalyEvent> {
        let losses: Vec<f64> = observations.iter().map(|o| o.packet_loss).collect();
        let peer_median = match TimeSeries::new(losses).peer_median() {
            Ok(median) => Some(median),
            Err(e) => {
                debug!(error = %e, "Skipping peer loss comparison");
                None
            }
        };

        let mut events = Vec::new();
        for obs in observations {
            // A fully lost probe is reported once, as unreachable.
            if let Some(finding) = self
                .check_unreachable(obs)
                .or_else(|| self.check_loss(obs))
            {
                events.push(ctx.event(finding));
            }
            if let Some(median) = peer_median {
                if let Some(finding) = self.check_outlier(obs, median) {
                    events.push(ctx.event(finding));
                }
            }
        }
        events
    }

    fn check_unreachable(&self, obs: &PingObservation<'_>) -> Option<Finding> {
        if obs.packet_loss < 100.0 {
            return None;
        }
        Some(Finding {
            kind: AnomalyKind::UnreachableHost,
            probe_id: obs.probe_id,
            metric: "ping_loss_pct",
            units: "%",
            value: obs.packet_loss,
            threshold: 100.0,
            severity: Severity::Critical,
            description: "No replies received (100% packet loss)".to_string(),
            route: None,
        })
    }

    fn check_loss(&self, obs: &PingObservation<'_>) -> Option<Finding> {
        let ceiling = self.thresholds.packet_loss_percentage;
        let loss = obs.packet_loss;
        if !(loss > 0.0 && loss < 100.0 && loss > ceiling) {
            return None;
        }
        let severity = if loss > 2.0 * ceiling {
            Severity::Critical
        } else {
            Severity::Warning
        };
        Some(Finding {
            kind: AnomalyKind::PacketLoss,
            probe_id: obs.probe_id,
            metric: "ping_loss_pct",
            units: "%",
            value: loss,
            threshold: ceiling,
            severity,
            description: format!("Packet loss {:.1}% exceeds {:.1}%", loss, ceiling),
            route: None,
        })
    }

    fn check_outlier(&self, obs: &PingObservation<'_>, median: f64) -> Option<Finding> {
        let limit = median * self.thresholds.outlier_factor;
        let floor = self.thresholds.outlier_loss_floor_percentage;
        if obs.packet_loss <= limit || obs.packet_loss <= floor {
            return None;
        }
        Some(Finding {
            kind: AnomalyKind::OutlierProbeLoss,
            probe_id: obs.probe_id,
            metric: "ping_loss_pct",
            units: "%",
            value: obs.packet_loss,
            threshold: limit.max(floor),
            severity: Severity::Warning,
            description: format!(
                "Packet loss {:.1}% is more than {}x the peer median of {:.1}%",
                obs.packet_loss, self.thresholds.outlier_factor, median
            ),
            route: None,
        })
    }
}
