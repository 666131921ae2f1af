//! Anomaly detection: baselines, per-kind detectors, and the pass orchestrator.

pub mod anomaly;
pub mod baseline;
pub mod connectivity;
pub mod engine;
pub mod latency;
pub mod routing;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use baseline::{Baseline, BaselineKey, BaselineStore};
pub use engine::{DetectionReport, Detector, SampleWarning};

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("invalid configuration: {field} {reason}")]
    ConfigInvalid { field: &'static str, reason: String },

    #[error("malformed measurement result: {0}")]
    MalformedResult(String),

    #[error("malformed sample from probe {probe_id}: {reason}")]
    MalformedSample { probe_id: u64, reason: String },

    #[error("insufficient peers: need {needed} reporting probes, have {have}")]
    InsufficientPeers { needed: usize, have: usize },
}

/// Severity levels attached to every anomaly event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// The anomaly taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    LatencySpike,
    JitterSpike,
    OutlierProbeLatency,
    PacketLoss,
    UnreachableHost,
    OutlierProbeLoss,
    RouteChange,
    PathFlapping,
    #[serde(alias = "geo_anomaly")]
    GeographicAnomaly,
}

impl AnomalyKind {
    pub const ALL: [AnomalyKind; 9] = [
        AnomalyKind::LatencySpike,
        AnomalyKind::JitterSpike,
        AnomalyKind::OutlierProbeLatency,
        AnomalyKind::PacketLoss,
        AnomalyKind::UnreachableHost,
        AnomalyKind::OutlierProbeLoss,
        AnomalyKind::RouteChange,
        AnomalyKind::PathFlapping,
        AnomalyKind::GeographicAnomaly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::LatencySpike => "latency_spike",
            AnomalyKind::JitterSpike => "jitter_spike",
            AnomalyKind::OutlierProbeLatency => "outlier_probe_latency",
            AnomalyKind::PacketLoss => "packet_loss",
            AnomalyKind::UnreachableHost => "unreachable_host",
            AnomalyKind::OutlierProbeLoss => "outlier_probe_loss",
            AnomalyKind::RouteChange => "route_change",
            AnomalyKind::PathFlapping => "path_flapping",
            AnomalyKind::GeographicAnomaly => "geographic_anomaly",
        }
    }

    /// Static operator-facing description, used by the summary breakdowns.
    pub fn description(&self) -> &'static str {
        match self {
            AnomalyKind::LatencySpike => {
                "RTT exceeds the static ceiling or spikes well above the probe's baseline"
            }
            AnomalyKind::JitterSpike => {
                "High variation in RTTs (instability, not necessarily high latency)"
            }
            AnomalyKind::OutlierProbeLatency => {
                "Only some probes report high delay (not the majority)"
            }
            AnomalyKind::PacketLoss => "Share of lost packets exceeds the loss ceiling",
            AnomalyKind::UnreachableHost => "Host not reachable: 100% loss or destination never reached",
            AnomalyKind::OutlierProbeLoss => "Only some probes report high loss (not the majority)",
            AnomalyKind::RouteChange => "Traceroute path differs from the probe's baseline path",
            AnomalyKind::PathFlapping => "Route changes repeatedly within the rolling window",
            AnomalyKind::GeographicAnomaly => {
                "Farther probe reports clearly better latency than a nearer one (suspicious routing)"
            }
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Previous and current path attached to route events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDelta {
    pub previous: Vec<String>,
    pub current: Vec<String>,
}

/// A single classified anomaly. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    #[serde(rename = "anomaly")]
    pub kind: AnomalyKind,
    pub measurement_id: u64,
    pub probe_id: u64,
    pub target: String,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub units: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteDelta>,
    #[serde(rename = "timestamp")]
    pub detected_at: DateTime<Utc>,
}

/// Shared context for building events within one measurement pass.
#[derive(Debug, Clone)]
pub(crate) struct EventContext<'a> {
    pub measurement_id: u64,
    pub target: &'a str,
    pub detected_at: DateTime<Utc>,
}

/// Metric fields of an event before the pass context is attached.
#[derive(Debug, Clone)]
pub(crate) struct Finding {
    pub kind: AnomalyKind,
    pub probe_id: u64,
    pub metric: &'static str,
    pub units: &'static str,
    pub value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub description: String,
    pub route: Option<RouteDelta>,
}

impl EventContext<'_> {
    pub fn event(&self, finding: Finding) -> AnomalyEvent {
        AnomalyEvent {
            kind: finding.kind,
            measurement_id: self.measurement_id,
            probe_id: finding.probe_id,
            target: self.target.to_string(),
            metric: finding.metric.to_string(),
            value: finding.value,
            threshold: finding.threshold,
            units: finding.units.to_string(),
            severity: finding.severity,
            description: finding.description,
            route: finding.route,
            detected_at: self.detected_at,
        }
    }
}
