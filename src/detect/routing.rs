//! Route changes, path flapping, destination reachability, and geographic
//! anomalies.

use crate::config::RoutingConfig;
use crate::detect::baseline::BaselineStore;
use crate::detect::engine::TraceObservation;
use crate::detect::{AnomalyEvent, AnomalyKind, EventContext, Finding, RouteDelta, Severity};

/// A probe's distance to the target paired with the latency it observed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub probe_id: u64,
    pub distance_km: f64,
    pub latency_ms: f64,
}

impl GeoPoint {
    /// `None` when either the distance or the latency is unknown; such
    /// probes are left out of the geographic check.
    pub fn new(probe_id: u64, distance_km: Option<f64>, latency_ms: Option<f64>) -> Option<Self> {
        match (distance_km, latency_ms) {
            (Some(d), Some(l)) if d.is_finite() && l.is_finite() => Some(Self {
                probe_id,
                distance_km: d,
                latency_ms: l,
            }),
            _ => None,
        }
    }
}

pub struct RoutingDetector<'a> {
    config: &'a RoutingConfig,
}

impl<'a> RoutingDetector<'a> {
    pub fn new(config: &'a RoutingConfig) -> Self {
        Self { config }
    }

    /// Compare each probe's path with its stored route and commit the new one.
    pub(crate) fn detect_routes(
        &self,
        ctx: &EventContext<'_>,
        observations: &[TraceObservation<'_>],
        store: &BaselineStore,
    ) -> Vec<AnomalyEvent> {
        let mut events = Vec::new();

        for obs in observations {
            let (previous, update) = store.with_entry(ctx.target, obs.probe_id, |slot| {
                let previous = slot.as_ref().and_then(|b| b.route.clone());
                let update = store.apply(slot, None, Some(obs.hops), obs.observed_at);
                (previous, update)
            });

            if update.route_changed {
                let previous = previous.unwrap_or_default();
                events.push(ctx.event(Finding {
                    kind: AnomalyKind::RouteChange,
                    probe_id: obs.probe_id,
                    metric: "traceroute_hops",
                    units: "hops",
                    value: obs.hops.len() as f64,
                    threshold: previous.len() as f64,
                    severity: Severity::Warning,
                    description: format!(
                        "Path changed from {} to {} hops",
                        previous.len(),
                        obs.hops.len()
                    ),
                    route: Some(RouteDelta {
                        previous,
                        current: obs.hops.to_vec(),
                    }),
                }));

                if update.route_changes_in_window > self.config.flap_threshold {
                    events.push(ctx.event(Finding {
                        kind: AnomalyKind::PathFlapping,
                        probe_id: obs.probe_id,
                        metric: "route_changes",
                        units: "changes",
                        value: update.route_changes_in_window as f64,
                        threshold: self.config.flap_threshold as f64,
                        severity: Severity::Critical,
                        description: format!(
                            "{} route changes within the window (limit {})",
                            update.route_changes_in_window, self.config.flap_threshold
                        ),
                        route: None,
                    }));
                }
            }

            if let Some(finding) = self.check_destination(obs) {
                events.push(ctx.event(finding));
            }
        }

        events
    }

    fn check_destination(&self, obs: &TraceObservation<'_>) -> Option<Finding> {
        if !self.config.verify_destination {
            return None;
        }
        let destination = obs.target_address?;
        let last = obs.hops.last()?;
        if last == destination {
            return None;
        }
        Some(Finding {
            kind: AnomalyKind::UnreachableHost,
            probe_id: obs.probe_id,
            metric: "reachability",
            units: "reachable_flag",
            value: 0.0,
            threshold: 1.0,
            severity: Severity::Critical,
            description: format!("Traceroute ended at {} without reaching {}", last, destination),
            route: None,
        })
    }

    /// Flag probes that are farther from the target yet report clearly lower
    /// latency than a nearer probe. Each far probe is compared with the nearer
    /// probe showing the widest disagreement, so it yields at most one event.
    pub(crate) fn detect_geographic(
        &self,
        ctx: &EventContext<'_>,
        points: &[GeoPoint],
    ) -> Vec<AnomalyEvent> {
        let margin = self.config.geo_margin_ms;
        let mut events = Vec::new();

        for far in points {
            let worst_near = points
                .iter()
                .filter(|near| near.distance_km < far.distance_km)
                .filter(|near| far.latency_ms < near.latency_ms - margin)
                .max_by(|a, b| a.latency_ms.total_cmp(&b.latency_ms));

            if let Some(near) = worst_near {
                events.push(ctx.event(Finding {
                    kind: AnomalyKind::GeographicAnomaly,
                    probe_id: far.probe_id,
                    metric: "ping_rtt_ms",
                    units: "ms",
                    value: far.latency_ms,
                    threshold: near.latency_ms,
                    severity: Severity::Warning,
                    description: format!(
                        "Probe at {:.0}km sees {:.1}ms while probe {} at {:.0}km sees {:.1}ms",
                        far.distance_km,
                        far.latency_ms,
                        near.probe_id,
                        near.distance_km,
                        near.latency_ms
                    ),
                    route: None,
                }));
            }
        }

        events
    }
}
