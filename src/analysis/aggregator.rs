use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::detect::{AnomalyEvent, AnomalyKind, Severity};

/// Count of one anomaly kind within a measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindCount {
    pub count: usize,
    pub description: &'static str,
}

/// Per-measurement rollup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementSummary {
    pub measurement_id: u64,
    pub total_anomalies: usize,
    /// Distinct probe ids appearing in any event.
    pub probes_affected: usize,
    pub critical: usize,
    pub breakdown: BTreeMap<AnomalyKind, KindCount>,
}

/// Share of one anomaly kind across all measurements.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindShare {
    pub count: usize,
    /// Percentage of the global total, one decimal place.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalSummary {
    pub measurements: usize,
    pub total_anomalies: usize,
    pub average_per_measurement: f64,
    pub breakdown: BTreeMap<AnomalyKind, KindShare>,
}

/// One row of the detailed view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventDetail {
    pub measurement_id: u64,
    pub probe_id: u64,
    pub kind: AnomalyKind,
    pub target: String,
    pub value: f64,
    pub threshold: f64,
    pub units: String,
    pub severity: Severity,
    pub description: String,
    pub detected_at: DateTime<Utc>,
}

impl From<&AnomalyEvent> for EventDetail {
    fn from(e: &AnomalyEvent) -> Self {
        Self {
            measurement_id: e.measurement_id,
            probe_id: e.probe_id,
            kind: e.kind,
            target: e.target.clone(),
            value: e.value,
            threshold: e.threshold,
            units: e.units.clone(),
            severity: e.severity,
            description: e.description.clone(),
            detected_at: e.detected_at,
        }
    }
}

pub fn summarize_measurement(measurement_id: u64, events: &[AnomalyEvent]) -> MeasurementSummary {
    let mut breakdown: BTreeMap<AnomalyKind, KindCount> = BTreeMap::new();
    let mut probes = BTreeSet::new();
    let mut critical = 0;

    for event in events {
        probes.insert(event.probe_id);
        if event.severity == Severity::Critical {
            critical += 1;
        }
        breakdown
            .entry(event.kind)
            .or_insert_with(|| KindCount {
                count: 0,
                description: event.kind.description(),
            })
            .count += 1;
    }

    MeasurementSummary {
        measurement_id,
        total_anomalies: events.len(),
        probes_affected: probes.len(),
        critical,
        breakdown,
    }
}

pub fn summarize_global(summaries: &[MeasurementSummary]) -> GlobalSummary {
    let total: usize = summaries.iter().map(|s| s.total_anomalies).sum();

    let mut counts: BTreeMap<AnomalyKind, usize> = BTreeMap::new();
    for summary in summaries {
        for (kind, kc) in &summary.breakdown {
            *counts.entry(*kind).or_default() += kc.count;
        }
    }

    let breakdown = counts
        .into_iter()
        .map(|(kind, count)| {
            (
                kind,
                KindShare {
                    count,
                    percentage: percentage(count, total),
                },
            )
        })
        .collect();

    let average_per_measurement = if summaries.is_empty() {
        0.0
    } else {
        total as f64 / summaries.len() as f64
    };

    GlobalSummary {
        measurements: summaries.len(),
        total_anomalies: total,
        average_per_measurement,
        breakdown,
    }
}

fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 / total as f64 * 1000.0).round() / 10.0
}

/// Already-produced events formatted for display, in their original order.
pub fn detailed_view(events: &[AnomalyEvent], measurement_id: Option<u64>) -> Vec<EventDetail> {
    events
        .iter()
        .filter(|e| measurement_id.map_or(true, |id| e.measurement_id == id))
        .map(EventDetail::from)
        .collect()
}

/// Everything the `alerts` view presents.
#[derive(Debug, Clone, Serialize)]
pub struct AlertsReport {
    pub measurements: Vec<MeasurementSummary>,
    pub global: GlobalSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<EventDetail>>,
}

impl AlertsReport {
    /// Build the report from per-measurement event lists, optionally
    /// restricted to one measurement id.
    pub fn build<'a>(
        measurements: impl IntoIterator<Item = (u64, &'a [AnomalyEvent])>,
        filter: Option<u64>,
        detailed: bool,
    ) -> Self {
        let selected: Vec<(u64, &[AnomalyEvent])> = measurements
            .into_iter()
            .filter(|(id, _)| filter.map_or(true, |f| f == *id))
            .collect();

        let summaries: Vec<MeasurementSummary> = selected
            .iter()
            .map(|(id, events)| summarize_measurement(*id, events))
            .collect();
        let global = summarize_global(&summaries);

        let details = detailed.then(|| {
            selected
                .iter()
                .flat_map(|(_, events)| detailed_view(events, None))
                .collect()
        });

        Self {
            measurements: summaries,
            global,
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(measurement_id: u64, probe_id: u64, kind: AnomalyKind) -> AnomalyEvent {
        AnomalyEvent {
            kind,
            measurement_id,
            probe_id,
            target: "example.com".to_string(),
            metric: "ping_rtt_ms".to_string(),
            value: 300.0,
            threshold: 250.0,
            units: "ms".to_string(),
            severity: if kind == AnomalyKind::UnreachableHost {
                Severity::Critical
            } else {
                Severity::Warning
            },
            description: String::new(),
            route: None,
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_measurement_summary_counts() {
        let events = vec![
            event(1, 10, AnomalyKind::LatencySpike),
            event(1, 10, AnomalyKind::OutlierProbeLatency),
            event(1, 11, AnomalyKind::UnreachableHost),
        ];
        let s = summarize_measurement(1, &events);
        assert_eq!(s.total_anomalies, 3);
        assert_eq!(s.probes_affected, 2);
        assert_eq!(s.critical, 1);
        assert_eq!(s.breakdown[&AnomalyKind::LatencySpike].count, 1);
        assert_eq!(
            s.breakdown[&AnomalyKind::UnreachableHost].description,
            AnomalyKind::UnreachableHost.description()
        );
    }

    #[test]
    fn test_global_percentages_sum_to_100() {
        let a = vec![
            event(1, 1, AnomalyKind::LatencySpike),
            event(1, 2, AnomalyKind::PacketLoss),
            event(1, 3, AnomalyKind::PacketLoss),
        ];
        let b = vec![
            event(2, 1, AnomalyKind::RouteChange),
            event(2, 1, AnomalyKind::PathFlapping),
            event(2, 2, AnomalyKind::RouteChange),
            event(2, 3, AnomalyKind::JitterSpike),
        ];
        let summaries = vec![summarize_measurement(1, &a), summarize_measurement(2, &b)];
        let global = summarize_global(&summaries);

        assert_eq!(global.total_anomalies, 7);
        assert_eq!(global.measurements, 2);
        assert_eq!(global.average_per_measurement, 3.5);
        assert_eq!(global.breakdown[&AnomalyKind::PacketLoss].percentage, 28.6);

        let sum: f64 = global.breakdown.values().map(|s| s.percentage).sum();
        assert!((sum - 100.0).abs() <= 0.1 * global.breakdown.len() as f64);
    }

    #[test]
    fn test_empty_global_summary() {
        let global = summarize_global(&[]);
        assert_eq!(global.total_anomalies, 0);
        assert_eq!(global.average_per_measurement, 0.0);
        assert!(global.breakdown.is_empty());
    }

    #[test]
    fn test_alerts_report_filter_and_details() {
        let a = vec![event(1, 1, AnomalyKind::LatencySpike)];
        let b = vec![
            event(2, 5, AnomalyKind::RouteChange),
            event(2, 6, AnomalyKind::RouteChange),
        ];
        let docs = vec![(1, a.as_slice()), (2, b.as_slice())];

        let report = AlertsReport::build(docs.clone(), None, false);
        assert_eq!(report.measurements.len(), 2);
        assert_eq!(report.global.total_anomalies, 3);
        assert!(report.details.is_none());

        let report = AlertsReport::build(docs, Some(2), true);
        assert_eq!(report.measurements.len(), 1);
        assert_eq!(report.global.total_anomalies, 2);
        let details = report.details.unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].probe_id, 5);
        assert_eq!(details[1].probe_id, 6);
    }
}
