use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{RoutingConfig, SintraConfig, ThresholdConfig};
use crate::detect::baseline::BaselineStore;
use crate::detect::connectivity::ConnectivityDetector;
use crate::detect::latency::LatencyDetector;
use crate::detect::routing::{GeoPoint, RoutingDetector};
use crate::detect::{AnomalyEvent, DetectError, EventContext};
use crate::measurement::{MeasurementKind, MeasurementResult, ProbeSample};

/// A ping sample that passed validation.
#[derive(Debug, Clone)]
pub struct PingObservation<'a> {
    pub probe_id: u64,
    /// `None` when the probe got no replies.
    pub avg_rtt: Option<f64>,
    pub min_rtt: Option<f64>,
    pub max_rtt: Option<f64>,
    pub rtts: &'a [f64],
    pub packet_loss: f64,
    pub distance_km: Option<f64>,
    /// Probe-side measurement time, or the pass time when unknown.
    pub observed_at: DateTime<Utc>,
}

/// A traceroute sample that passed validation.
#[derive(Debug, Clone)]
pub struct TraceObservation<'a> {
    pub probe_id: u64,
    pub hops: &'a [String],
    pub target_address: Option<&'a str>,
    pub last_hop_rtt: Option<f64>,
    pub distance_km: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

/// A probe sample skipped during a pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleWarning {
    pub probe_id: u64,
    pub reason: String,
}

/// Outcome of one detection pass over one measurement.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub measurement_id: u64,
    pub kind: MeasurementKind,
    pub target: String,
    pub probes_evaluated: usize,
    pub events: Vec<AnomalyEvent>,
    pub warnings: Vec<SampleWarning>,
}

impl DetectionReport {
    pub fn anomaly_count(&self) -> usize {
        self.events.len()
    }
}

/// Runs the detectors for one measurement at a time against a shared baseline store.
pub struct Detector {
    thresholds: ThresholdConfig,
    routing: RoutingConfig,
    store: Arc<BaselineStore>,
}

impl Detector {
    /// Build a detector; refuses an invalid configuration.
    pub fn new(config: &SintraConfig, store: Arc<BaselineStore>) -> Result<Self, DetectError> {
        config.validate()?;
        Ok(Self {
            thresholds: config.thresholds.clone(),
            routing: config.routing.clone(),
            store,
        })
    }

    /// Build a detector with a fresh, empty baseline store.
    pub fn from_config(config: &SintraConfig) -> Result<Self, DetectError> {
        config.validate()?;
        let store = BaselineStore::new(config.baseline.smoothing, config.baseline.route_window());
        Self::new(config, Arc::new(store))
    }

    pub fn store(&self) -> &Arc<BaselineStore> {
        &self.store
    }

    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }

    pub fn detect(&self, measurement: &MeasurementResult) -> DetectionReport {
        self.detect_at(measurement, Utc::now())
    }

    /// Run one pass with an explicit detection timestamp.
    pub fn detect_at(&self, measurement: &MeasurementResult, at: DateTime<Utc>) -> DetectionReport {
        let ctx = EventContext {
            measurement_id: measurement.id,
            target: &measurement.target,
            detected_at: at,
        };
        let mut warnings = Vec::new();

        let (events, probes_evaluated) = match measurement.kind {
            MeasurementKind::Ping => {
                let observations: Vec<PingObservation<'_>> = measurement
                    .samples
                    .iter()
                    .filter_map(|s| accept(validate_ping(s, at), measurement.id, &mut warnings))
                    .collect();

                let mut events = LatencyDetector::new(&self.thresholds).detect(
                    &ctx,
                    &observations,
                    &self.store,
                );
                events.extend(ConnectivityDetector::new(&self.thresholds).detect(&ctx, &observations));

                let points: Vec<GeoPoint> = observations
                    .iter()
                    .filter_map(|o| GeoPoint::new(o.probe_id, o.distance_km, o.avg_rtt))
                    .collect();
                events.extend(RoutingDetector::new(&self.routing).detect_geographic(&ctx, &points));

                (events, observations.len())
            }
            MeasurementKind::Traceroute => {
                let observations: Vec<TraceObservation<'_>> = measurement
                    .samples
                    .iter()
                    .filter_map(|s| accept(validate_trace(s, at), measurement.id, &mut warnings))
                    .collect();

                let routing = RoutingDetector::new(&self.routing);
                let mut events = routing.detect_routes(&ctx, &observations, &self.store);

                let points: Vec<GeoPoint> = observations
                    .iter()
                    .filter_map(|o| GeoPoint::new(o.probe_id, o.distance_km, o.last_hop_rtt))
                    .collect();
                events.extend(routing.detect_geographic(&ctx, &points));

                (events, observations.len())
            }
        };

        info!(
            measurement_id = measurement.id,
            kind = %measurement.kind,
            probes = probes_evaluated,
            skipped = warnings.len(),
            anomalies = events.len(),
            "Detection pass complete"
        );

        DetectionReport {
            measurement_id: measurement.id,
            kind: measurement.kind,
            target: measurement.target.clone(),
            probes_evaluated,
            events,
            warnings,
        }
    }
}

fn accept<T>(
    validated: Result<T, DetectError>,
    measurement_id: u64,
    warnings: &mut Vec<SampleWarning>,
) -> Option<T> {
    match validated {
        Ok(observation) => Some(observation),
        Err(DetectError::MalformedSample { probe_id, reason }) => {
            warn!(measurement_id, probe_id, %reason, "Skipping malformed probe sample");
            warnings.push(SampleWarning { probe_id, reason });
            None
        }
        Err(e) => {
            debug!(measurement_id, error = %e, "Skipping probe sample");
            warnings.push(SampleWarning {
                probe_id: 0,
                reason: e.to_string(),
            });
            None
        }
    }
}

fn malformed(probe_id: u64, reason: impl Into<String>) -> DetectError {
    DetectError::MalformedSample {
        probe_id,
        reason: reason.into(),
    }
}

fn check_ms(probe_id: u64, field: &str, value: Option<f64>) -> Result<Option<f64>, DetectError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => {
            Err(malformed(probe_id, format!("{} must be a non-negative number, got {}", field, v)))
        }
        other => Ok(other),
    }
}

fn check_decoded(sample: &ProbeSample) -> Result<(), DetectError> {
    if let Some(reason) = &sample.malformed {
        return Err(malformed(sample.probe_id, reason.clone()));
    }
    if sample.probe_id == 0 {
        return Err(malformed(0, "missing probe id"));
    }
    Ok(())
}

fn validate_ping(sample: &ProbeSample, pass_at: DateTime<Utc>) -> Result<PingObservation<'_>, DetectError> {
    check_decoded(sample)?;
    let probe_id = sample.probe_id;

    let packet_loss = sample
        .packet_loss
        .ok_or_else(|| malformed(probe_id, "missing packet loss percentage"))?;
    if !(0.0..=100.0).contains(&packet_loss) {
        return Err(malformed(
            probe_id,
            format!("packet loss {} outside 0-100", packet_loss),
        ));
    }

    let avg_rtt = check_ms(probe_id, "avg_rtt", sample.latency.avg)?;
    let min_rtt = check_ms(probe_id, "min_rtt", sample.latency.min)?;
    let max_rtt = check_ms(probe_id, "max_rtt", sample.latency.max)?;
    if avg_rtt.is_none() && packet_loss < 100.0 {
        return Err(malformed(
            probe_id,
            "missing average RTT for a probe that received replies",
        ));
    }

    Ok(PingObservation {
        probe_id,
        avg_rtt,
        min_rtt,
        max_rtt,
        rtts: &sample.latency.rtts,
        packet_loss,
        distance_km: sample.source.distance_km,
        observed_at: sample.observed_at.unwrap_or(pass_at),
    })
}

fn validate_trace(sample: &ProbeSample, pass_at: DateTime<Utc>) -> Result<TraceObservation<'_>, DetectError> {
    check_decoded(sample)?;
    let probe_id = sample.probe_id;
    let hops = sample
        .hops
        .as_deref()
        .ok_or_else(|| malformed(probe_id, "missing hop list"))?;

    Ok(TraceObservation {
        probe_id,
        hops,
        target_address: sample.target_address.as_deref(),
        last_hop_rtt: check_ms(probe_id, "last hop rtt", sample.latency.avg)?,
        distance_km: sample.source.distance_km,
        observed_at: sample.observed_at.unwrap_or(pass_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::AnomalyKind;

    fn ping_measurement(samples: Vec<ProbeSample>) -> MeasurementResult {
        MeasurementResult {
            id: 42,
            kind: MeasurementKind::Ping,
            target: "example.com".to_string(),
            description: String::new(),
            samples,
        }
    }

    #[test]
    fn test_malformed_sample_skipped_not_fatal() {
        let detector = Detector::from_config(&SintraConfig::default()).unwrap();
        let mut broken = ProbeSample::ping(2, Some(30.0), 0.0);
        broken.packet_loss = None;
        let m = ping_measurement(vec![
            ProbeSample::ping(1, Some(300.0), 0.0),
            broken,
            ProbeSample::ping(3, Some(20.0), 0.0),
        ]);

        let report = detector.detect(&m);
        assert_eq!(report.probes_evaluated, 2);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].probe_id, 2);
        assert!(report
            .events
            .iter()
            .any(|e| e.kind == AnomalyKind::LatencySpike && e.probe_id == 1));
        assert!(report.events.iter().all(|e| e.probe_id != 2));
    }

    #[test]
    fn test_reachable_probe_without_rtt_is_malformed() {
        let mut s = ProbeSample::ping(5, None, 20.0);
        s.latency.avg = None;
        assert!(matches!(
            validate_ping(&s, Utc::now()),
            Err(DetectError::MalformedSample { probe_id: 5, .. })
        ));
        let unreachable = ProbeSample::ping(6, None, 100.0);
        assert!(validate_ping(&unreachable, Utc::now()).is_ok());
    }

    #[test]
    fn test_loss_out_of_range_is_malformed() {
        let s = ProbeSample::ping(5, Some(10.0), 140.0);
        assert!(validate_ping(&s, Utc::now()).is_err());
        let s = ProbeSample::ping(5, Some(-1.0), 0.0);
        assert!(validate_ping(&s, Utc::now()).is_err());
    }

    #[test]
    fn test_traceroute_without_hops_is_malformed() {
        let s = ProbeSample {
            probe_id: 9,
            ..Default::default()
        };
        assert!(validate_trace(&s, Utc::now()).is_err());
    }

    #[test]
    fn test_invalid_config_refused() {
        let mut cfg = SintraConfig::default();
        cfg.thresholds.outlier_factor = -2.0;
        assert!(matches!(
            Detector::from_config(&cfg),
            Err(DetectError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn test_every_event_references_input_probe() {
        let detector = Detector::from_config(&SintraConfig::default()).unwrap();
        let m = ping_measurement(vec![
            ProbeSample::ping(1, Some(600.0), 0.0),
            ProbeSample::ping(2, None, 100.0),
            ProbeSample::ping(3, Some(20.0), 50.0).with_rtts(vec![1.0, 80.0]),
            ProbeSample::ping(4, Some(22.0), 0.0),
        ]);
        let report = detector.detect(&m);
        assert!(!report.events.is_empty());
        for event in &report.events {
            assert_eq!(event.measurement_id, 42);
            assert!(m.samples.iter().any(|s| s.probe_id == event.probe_id));
        }
    }

    #[test]
    fn test_undecodable_entry_reported_as_warning() {
        let detector = Detector::from_config(&SintraConfig::default()).unwrap();
        let json = r#"{
            "measurement_id": 42,
            "type": "ping",
            "target": "example.com",
            "results": [
                {"probe_id": 1, "packet_loss_percentage": 0.0, "latency_stats": {"avg": 400.0}},
                {"probe_id": 2, "packet_loss_percentage": 0.0, "latency_stats": {"avg": 30.0}},
                {"probe_id": 3, "packet_loss_percentage": 0.0, "distance_km": "unknown",
                 "latency_stats": {"avg": 31.0}}
            ]
        }"#;
        let m = crate::measurement::parse_document(json).unwrap();
        let report = detector.detect(&m);

        assert_eq!(report.probes_evaluated, 2);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].probe_id, 3);
        assert!(report
            .events
            .iter()
            .any(|e| e.kind == AnomalyKind::LatencySpike && e.probe_id == 1));
    }

    #[test]
    fn test_observation_time_prefers_probe_timestamp() {
        let pass_at = Utc::now();
        let taken = pass_at - chrono::Duration::hours(3);
        let stamped = ProbeSample::traceroute(4, &["a", "b"]).with_observed_at(taken);
        assert_eq!(validate_trace(&stamped, pass_at).unwrap().observed_at, taken);
        let unstamped = ProbeSample::traceroute(4, &["a", "b"]);
        assert_eq!(validate_trace(&unstamped, pass_at).unwrap().observed_at, pass_at);
    }
}
