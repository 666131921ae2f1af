//! Prometheus exposition of detection output.
//!
//! Gauges are rebuilt from the on-disk documents on every scrape, so each
//! render uses its own [`Registry`].

use anyhow::Result;
use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::analysis::aggregator::summarize_measurement;
use crate::measurement::{MeasurementKind, MeasurementResult};
use crate::storage::events::EventDocument;

/// The gauge families exported on `/metrics`.
pub struct DetectionMetrics {
    registry: Registry,
    events_total: IntGaugeVec,
    anomalies: IntGaugeVec,
    anomaly_event: GaugeVec,
    ping_latency_avg: GaugeVec,
    ping_packet_loss: GaugeVec,
    traceroute_hops: IntGaugeVec,
}

impl DetectionMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let probe_labels = &["measurement_id", "probe_id", "target"];

        let events_total = IntGaugeVec::new(
            Opts::new("sintra_events_total", "Anomaly events recorded per measurement"),
            &["measurement_id"],
        )?;
        let anomalies = IntGaugeVec::new(
            Opts::new("sintra_anomalies", "Anomaly events per measurement and kind"),
            &["measurement_id", "kind"],
        )?;
        let anomaly_event = GaugeVec::new(
            Opts::new("sintra_anomaly_event", "Observed value of each anomaly event"),
            &["measurement_id", "probe_id", "kind", "severity", "target", "metric"],
        )?;
        let ping_latency_avg = GaugeVec::new(
            Opts::new("sintra_ping_latency_avg", "Average ping RTT per probe (ms)"),
            probe_labels,
        )?;
        let ping_packet_loss = GaugeVec::new(
            Opts::new("sintra_ping_packet_loss", "Ping packet loss per probe (%)"),
            probe_labels,
        )?;
        let traceroute_hops = IntGaugeVec::new(
            Opts::new("sintra_traceroute_hops", "Responding hops per traceroute probe"),
            probe_labels,
        )?;

        registry.register(Box::new(events_total.clone()))?;
        registry.register(Box::new(anomalies.clone()))?;
        registry.register(Box::new(anomaly_event.clone()))?;
        registry.register(Box::new(ping_latency_avg.clone()))?;
        registry.register(Box::new(ping_packet_loss.clone()))?;
        registry.register(Box::new(traceroute_hops.clone()))?;

        Ok(Self {
            registry,
            events_total,
            anomalies,
            anomaly_event,
            ping_latency_avg,
            ping_packet_loss,
            traceroute_hops,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn observe_events(&self, doc: &EventDocument) {
        let id = doc.measurement_id.to_string();
        self.events_total
            .with_label_values(&[&id])
            .set(doc.events.len() as i64);

        let summary = summarize_measurement(doc.measurement_id, &doc.events);
        for (kind, count) in &summary.breakdown {
            self.anomalies
                .with_label_values(&[&id, kind.as_str()])
                .set(count.count as i64);
        }

        for event in &doc.events {
            self.anomaly_event
                .with_label_values(&[
                    &event.measurement_id.to_string(),
                    &event.probe_id.to_string(),
                    event.kind.as_str(),
                    &event.severity.to_string(),
                    &event.target,
                    &event.metric,
                ])
                .set(event.value);
        }
    }

    pub fn observe_result(&self, result: &MeasurementResult) {
        let id = result.id.to_string();
        for sample in &result.samples {
            let probe = sample.probe_id.to_string();
            let labels = [id.as_str(), probe.as_str(), result.target.as_str()];
            match result.kind {
                MeasurementKind::Ping => {
                    if let Some(avg) = sample.latency.avg {
                        self.ping_latency_avg.with_label_values(&labels).set(avg);
                    }
                    if let Some(loss) = sample.packet_loss {
                        self.ping_packet_loss.with_label_values(&labels).set(loss);
                    }
                }
                MeasurementKind::Traceroute => {
                    if let Some(hops) = &sample.hops {
                        self.traceroute_hops
                            .with_label_values(&labels)
                            .set(hops.len() as i64);
                    }
                }
            }
        }
    }
}

/// Encode everything gathered by `registry` in the text exposition format.
pub fn export_metrics(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Render gauges for the given event documents and measurement results.
pub fn render_prometheus(documents: &[EventDocument], results: &[MeasurementResult]) -> Result<String> {
    let metrics = DetectionMetrics::new()?;
    for doc in documents {
        metrics.observe_events(doc);
    }
    for result in results {
        metrics.observe_result(result);
    }
    export_metrics(metrics.registry())
}
