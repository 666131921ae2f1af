//! Measurement results as handed to the detection core.

pub mod document;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use document::parse_document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementKind {
    Ping,
    Traceroute,
}

impl std::fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeasurementKind::Ping => write!(f, "ping"),
            MeasurementKind::Traceroute => write!(f, "traceroute"),
        }
    }
}

impl std::str::FromStr for MeasurementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ping" => Ok(MeasurementKind::Ping),
            "traceroute" => Ok(MeasurementKind::Traceroute),
            other => Err(format!("unsupported measurement type '{}'", other)),
        }
    }
}

/// One fetched dataset. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub id: u64,
    pub kind: MeasurementKind,
    pub target: String,
    #[serde(default)]
    pub description: String,
    pub samples: Vec<ProbeSample>,
}

/// Where a probe sits relative to the target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeSource {
    pub address: Option<String>,
    /// Distance from probe to target, used to rank probes for the geographic check.
    pub distance_km: Option<f64>,
    pub country: Option<String>,
}

/// Round-trip-time statistics (ms). A missing average means no replies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(default)]
    pub rtts: Vec<f64>,
}

/// One probe's observation within a measurement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeSample {
    pub probe_id: u64,
    #[serde(default)]
    pub source: ProbeSource,
    pub target_address: Option<String>,
    #[serde(default)]
    pub latency: LatencyStats,
    /// Packet loss percentage, 0-100.
    pub packet_loss: Option<f64>,
    /// Ordered hop addresses (traceroute only).
    pub hops: Option<Vec<String>>,
    /// When the probe took the measurement, if the document says.
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
    /// Set when the entry could not be decoded; detection rejects it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malformed: Option<String>,
}

impl ProbeSample {
    pub fn ping(probe_id: u64, avg_rtt: Option<f64>, packet_loss: f64) -> Self {
        Self {
            probe_id,
            latency: LatencyStats {
                avg: avg_rtt,
                min: avg_rtt,
                max: avg_rtt,
                rtts: Vec::new(),
            },
            packet_loss: Some(packet_loss),
            ..Default::default()
        }
    }

    pub fn traceroute(probe_id: u64, hops: &[&str]) -> Self {
        Self {
            probe_id,
            hops: Some(hops.iter().map(|h| h.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn with_rtts(mut self, rtts: Vec<f64>) -> Self {
        self.latency.min = rtts.iter().copied().reduce(f64::min);
        self.latency.max = rtts.iter().copied().reduce(f64::max);
        self.latency.rtts = rtts;
        self
    }

    pub fn with_distance(mut self, distance_km: f64) -> Self {
        self.source.distance_km = Some(distance_km);
        self
    }

    pub fn with_target_address(mut self, address: &str) -> Self {
        self.target_address = Some(address.to_string());
        self
    }

    pub fn with_observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }
}
