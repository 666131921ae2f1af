use crate::detect::DetectError;

/// Peer comparisons need at least this many reporting probes.
pub const MIN_PEERS: usize = 3;

/// A simple series of observations for per-measurement statistics.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Sample standard deviation (n - 1). Zero for fewer than two values.
    pub fn std_dev(&self) -> f64 {
        if self.values.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self.values.iter().map(|&x| (x - mean).powi(2)).sum();
        (sum_sq_diff / (self.values.len() - 1) as f64).sqrt()
    }

    /// Median; the mean of the two middle values for an even count.
    pub fn median(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let mut sorted = self.values.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2.0)
        } else {
            Some(sorted[mid])
        }
    }

    /// Median across peers, refusing to answer for fewer than [`MIN_PEERS`] values.
    pub fn peer_median(&self) -> Result<f64, DetectError> {
        if self.values.len() < MIN_PEERS {
            return Err(DetectError::InsufficientPeers {
                needed: MIN_PEERS,
                have: self.values.len(),
            });
        }
        // Non-empty, checked above.
        Ok(self.median().unwrap_or_default())
    }
}

/// RTT variability for one sample: standard deviation of the raw RTTs when
/// there are at least two, otherwise the min/max spread.
pub fn jitter(rtts: &[f64], min_rtt: Option<f64>, max_rtt: Option<f64>) -> Option<f64> {
    if rtts.len() >= 2 {
        return Some(TimeSeries::new(rtts.to_vec()).std_dev());
    }
    match (min_rtt, max_rtt) {
        (Some(min), Some(max)) => Some((max - min).max(0.0)),
        _ => None,
    }
}
