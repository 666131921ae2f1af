//! TOML configuration for sintra.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a usable configuration. Thresholds are validated before any
//! detection pass runs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::DetectError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a detection run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SintraConfig {
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl SintraConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `SINTRA_CONFIG` environment variable.
    /// 2. `./sintra.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("SINTRA_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SINTRA_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local_path = Path::new("sintra.toml");
        if local_path.exists() {
            match Self::load(local_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local_path.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject values that would make detection meaningless.
    pub fn validate(&self) -> Result<(), DetectError> {
        self.thresholds.validate()?;
        self.routing.validate()?;
        self.baseline.validate()?;
        if self.batch.workers == 0 {
            return Err(invalid("batch.workers", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> DetectError {
    DetectError::ConfigInvalid {
        field,
        reason: reason.into(),
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), DetectError> {
    if !value.is_finite() {
        return Err(invalid(field, format!("must be finite, got {}", value)));
    }
    if value < 0.0 {
        return Err(invalid(field, format!("must not be negative, got {}", value)));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Detection thresholds, immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Static RTT ceiling (ms).
    pub latency_spike_ms: f64,
    /// Packet loss ceiling (%).
    pub packet_loss_percentage: f64,
    /// RTT variation ceiling (ms).
    pub jitter_spike_ms: f64,
    /// Multiplier applied to a peer median or baseline average.
    pub outlier_factor: f64,
    /// Loss (%) a probe must exceed before it can be a loss outlier.
    /// Zero means the peer median alone decides.
    pub outlier_loss_floor_percentage: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            latency_spike_ms: 250.0,
            packet_loss_percentage: 10.0,
            jitter_spike_ms: 15.0,
            outlier_factor: 2.0,
            outlier_loss_floor_percentage: 0.0,
        }
    }
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<(), DetectError> {
        non_negative("thresholds.latency_spike_ms", self.latency_spike_ms)?;
        non_negative("thresholds.packet_loss_percentage", self.packet_loss_percentage)?;
        non_negative("thresholds.jitter_spike_ms", self.jitter_spike_ms)?;
        non_negative("thresholds.outlier_factor", self.outlier_factor)?;
        if self.outlier_factor <= 0.0 {
            return Err(invalid("thresholds.outlier_factor", "must be greater than zero"));
        }
        non_negative("thresholds.outlier_loss_floor_percentage", self.outlier_loss_floor_percentage)?;
        if self.outlier_loss_floor_percentage > 100.0 {
            return Err(invalid(
                "thresholds.outlier_loss_floor_percentage",
                "must be a percentage between 0 and 100",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Path flapping fires once route changes in the window exceed this count.
    pub flap_threshold: usize,
    /// Latency disagreement (ms) tolerated before a geographic anomaly fires.
    pub geo_margin_ms: f64,
    /// Flag traceroutes whose last hop is not the target address.
    pub verify_destination: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            flap_threshold: 3,
            geo_margin_ms: 50.0,
            verify_destination: true,
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> Result<(), DetectError> {
        non_negative("routing.geo_margin_ms", self.geo_margin_ms)
    }
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Weight of the newest sample in the moving latency average, in (0, 1].
    pub smoothing: f64,
    /// Rolling window for counting route changes (seconds).
    pub route_window_secs: u64,
    /// SQLite database holding persisted baselines.
    pub database_path: PathBuf,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            smoothing: 0.3,
            route_window_secs: 3600,
            database_path: PathBuf::from("data/sintra.db"),
        }
    }
}

impl BaselineConfig {
    pub fn validate(&self) -> Result<(), DetectError> {
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            return Err(invalid(
                "baseline.smoothing",
                format!("must be in (0, 1], got {}", self.smoothing),
            ));
        }
        if self.route_window_secs == 0 {
            return Err(invalid("baseline.route_window_secs", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn route_window(&self) -> chrono::Duration {
        // Clamped to a century; longer windows are indistinguishable in practice.
        let secs = self.route_window_secs.min(100 * 365 * 24 * 3600);
        chrono::Duration::seconds(secs as i64)
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding fetched `measurement_*_result*.json` documents.
    pub results_dir: PathBuf,
    /// Directory receiving one event document per measurement.
    pub events_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("data/results"),
            events_dir: PathBuf::from("data/events"),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum measurement documents processed concurrently.
    pub workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = SintraConfig::default();
        assert_eq!(cfg.thresholds.latency_spike_ms, 250.0);
        assert_eq!(cfg.thresholds.packet_loss_percentage, 10.0);
        assert_eq!(cfg.thresholds.jitter_spike_ms, 15.0);
        assert_eq!(cfg.thresholds.outlier_factor, 2.0);
        assert_eq!(cfg.thresholds.outlier_loss_floor_percentage, 0.0);
        assert_eq!(cfg.routing.flap_threshold, 3);
        assert_eq!(cfg.routing.geo_margin_ms, 50.0);
        assert!(cfg.routing.verify_destination);
        assert_eq!(cfg.baseline.smoothing, 0.3);
        assert_eq!(cfg.baseline.route_window_secs, 3600);
        assert_eq!(cfg.batch.workers, 4);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[thresholds]
latency_spike_ms = 180.0
packet_loss_percentage = 5.0
jitter_spike_ms = 20.0
outlier_factor = 3.0
outlier_loss_floor_percentage = 5.0

[routing]
flap_threshold = 5
geo_margin_ms = 25.0
verify_destination = false

[baseline]
smoothing = 0.5
route_window_secs = 600
database_path = "/var/lib/sintra/baselines.db"

[paths]
results_dir = "/srv/results"
events_dir = "/srv/events"

[batch]
workers = 8

[logging]
level = "debug"
json = true
"#;

        let cfg: SintraConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.thresholds.latency_spike_ms, 180.0);
        assert_eq!(cfg.thresholds.outlier_factor, 3.0);
        assert_eq!(cfg.thresholds.outlier_loss_floor_percentage, 5.0);
        assert_eq!(cfg.routing.flap_threshold, 5);
        assert!(!cfg.routing.verify_destination);
        assert_eq!(cfg.baseline.route_window_secs, 600);
        assert_eq!(
            cfg.baseline.database_path,
            PathBuf::from("/var/lib/sintra/baselines.db")
        );
        assert_eq!(cfg.paths.results_dir, PathBuf::from("/srv/results"));
        assert_eq!(cfg.batch.workers, 8);
        assert!(cfg.logging.json);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: SintraConfig = toml::from_str("[thresholds]\nlatency_spike_ms = 100.0\n").unwrap();
        assert_eq!(cfg.thresholds.latency_spike_ms, 100.0);
        assert_eq!(cfg.thresholds.outlier_factor, 2.0);
        assert_eq!(cfg.batch.workers, 4);
    }

    #[test]
    fn test_loss_floor_must_be_a_percentage() {
        let mut cfg = SintraConfig::default();
        cfg.thresholds.outlier_loss_floor_percentage = 120.0;
        assert!(matches!(
            cfg.validate(),
            Err(DetectError::ConfigInvalid {
                field: "thresholds.outlier_loss_floor_percentage",
                ..
            })
        ));
        cfg.thresholds.outlier_loss_floor_percentage = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_outlier_factor_rejected() {
        let mut cfg = SintraConfig::default();
        cfg.thresholds.outlier_factor = 0.0;
        match cfg.validate() {
            Err(DetectError::ConfigInvalid { field, .. }) => {
                assert_eq!(field, "thresholds.outlier_factor")
            }
            other => panic!("expected ConfigInvalid, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let mut cfg = SintraConfig::default();
        cfg.thresholds.packet_loss_percentage = -1.0;
        assert!(matches!(
            cfg.validate(),
            Err(DetectError::ConfigInvalid { field: "thresholds.packet_loss_percentage", .. })
        ));

        let mut cfg = SintraConfig::default();
        cfg.thresholds.jitter_spike_ms = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_other_sections_validated() {
        let mut cfg = SintraConfig::default();
        cfg.baseline.smoothing = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = SintraConfig::default();
        cfg.batch.workers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SintraConfig::default();
        cfg.baseline.route_window_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sintra.toml");
        std::fs::write(&path, "[batch]\nworkers = 2\n").unwrap();

        let cfg = SintraConfig::load(&path).unwrap();
        assert_eq!(cfg.batch.workers, 2);
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(SintraConfig::load(Path::new("/nonexistent/path/sintra.toml")).is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = SintraConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let back: SintraConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg.thresholds, back.thresholds);
        assert_eq!(cfg.baseline, back.baseline);
    }
}
