//! Parsing of fetched result documents into [`MeasurementResult`].
//!
//! The fetch client writes one JSON document per measurement with a
//! `results` array holding one entry per probe. Ping entries carry
//! `latency_stats` and `packet_loss_percentage`; traceroute entries carry
//! either a flat `hops` list or the raw `traceroute_hops` replies.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::{LatencyStats, MeasurementKind, MeasurementResult, ProbeSample, ProbeSource};
use crate::detect::DetectError;

#[derive(Debug, Deserialize)]
struct RawDocument {
    measurement_id: Option<u64>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    target: Option<String>,
    #[serde(default)]
    description: String,
    /// Decoded entry by entry so a single bad probe stays local.
    #[serde(default)]
    results: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawResult {
    probe_id: Option<u64>,
    #[serde(alias = "from")]
    source_address: Option<String>,
    target_address: Option<String>,
    packet_loss_percentage: Option<f64>,
    latency_stats: Option<RawLatency>,
    distance_km: Option<f64>,
    country_code: Option<String>,
    hops: Option<Vec<RawFlatHop>>,
    traceroute_hops: Option<Vec<RawTraceHop>>,
    timestamp: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawLatency {
    min: Option<f64>,
    max: Option<f64>,
    avg: Option<f64>,
    #[serde(default, alias = "all_rtts")]
    rtts: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct RawFlatHop {
    ip: Option<String>,
    rtt: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawTraceHop {
    #[serde(default)]
    result: Vec<RawHopReply>,
}

#[derive(Debug, Deserialize)]
struct RawHopReply {
    from: Option<String>,
    rtt: Option<f64>,
}

/// Parse one result document. Per-sample metric checks are left to the
/// detection pass so one bad probe does not reject the whole document.
pub fn parse_document(text: &str) -> Result<MeasurementResult, DetectError> {
    let raw: RawDocument = serde_json::from_str(text)
        .map_err(|e| DetectError::MalformedResult(format!("invalid JSON: {}", e)))?;

    let id = raw
        .measurement_id
        .ok_or_else(|| DetectError::MalformedResult("missing measurement_id".to_string()))?;

    let kind = resolve_kind(raw.kind.as_deref(), &raw.results)
        .map_err(|reason| DetectError::MalformedResult(format!("measurement {}: {}", id, reason)))?;

    let target = raw
        .target
        .or_else(|| {
            raw.results.iter().find_map(|r| {
                str_field(r, "target")
                    .or_else(|| str_field(r, "target_address"))
                    .map(str::to_string)
            })
        })
        .unwrap_or_default();

    let samples = raw
        .results
        .into_iter()
        .filter(|r| {
            str_field(r, "measurement_type")
                .map_or(true, |t| t.parse::<MeasurementKind>().ok() == Some(kind))
        })
        .map(|r| decode_result(r, kind))
        .collect();

    Ok(MeasurementResult {
        id,
        kind,
        target,
        description: raw.description,
        samples,
    })
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn resolve_kind(declared: Option<&str>, results: &[Value]) -> Result<MeasurementKind, String> {
    if let Some(declared) = declared {
        return declared.parse();
    }
    let mut kinds = results
        .iter()
        .filter_map(|r| str_field(r, "measurement_type"))
        .filter_map(|t| t.parse::<MeasurementKind>().ok());
    match kinds.next() {
        Some(first) => Ok(first),
        None => Err("cannot determine measurement type".to_string()),
    }
}

fn decode_result(value: Value, kind: MeasurementKind) -> ProbeSample {
    // Recover the id before decoding consumes the value, so a broken entry
    // still names its probe in the warning.
    let probe_id = value.get("probe_id").and_then(Value::as_u64).unwrap_or_default();
    match serde_json::from_value::<RawResult>(value) {
        Ok(raw) => convert_result(raw, kind),
        Err(e) => ProbeSample {
            probe_id,
            malformed: Some(e.to_string()),
            ..Default::default()
        },
    }
}

fn convert_result(raw: RawResult, kind: MeasurementKind) -> ProbeSample {
    let mut sample = ProbeSample {
        // A missing id stays 0 and is rejected as malformed during detection.
        probe_id: raw.probe_id.unwrap_or_default(),
        source: ProbeSource {
            address: raw.source_address,
            distance_km: raw.distance_km,
            country: raw.country_code,
        },
        target_address: raw.target_address,
        latency: raw
            .latency_stats
            .map(|l| LatencyStats {
                avg: l.avg,
                min: l.min,
                max: l.max,
                rtts: l.rtts,
            })
            .unwrap_or_default(),
        packet_loss: raw.packet_loss_percentage,
        hops: None,
        observed_at: raw.timestamp.as_ref().and_then(parse_timestamp),
        malformed: None,
    };

    if kind == MeasurementKind::Traceroute {
        let (hops, last_rtt) = if let Some(flat) = raw.hops {
            flatten_flat_hops(flat)
        } else if let Some(trace) = raw.traceroute_hops {
            flatten_trace_hops(trace)
        } else {
            (None, None)
        };
        sample.hops = hops;
        if sample.latency.avg.is_none() {
            sample.latency.avg = last_rtt;
        }
    }

    sample
}

/// Raw results carry epoch seconds; processed ones an ISO-8601 string,
/// with or without an offset (UTC assumed). Anything else is ignored.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|secs| secs as i64))
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|t| t.and_utc())
            }),
        _ => None,
    }
}

fn flatten_flat_hops(hops: Vec<RawFlatHop>) -> (Option<Vec<String>>, Option<f64>) {
    let mut path = Vec::with_capacity(hops.len());
    let mut last_rtt = None;
    for hop in hops {
        if let Some(ip) = hop.ip.filter(|ip| !ip.is_empty() && ip != "*") {
            path.push(ip);
            last_rtt = hop.rtt;
        }
    }
    (Some(path), last_rtt)
}

/// First replying address per hop; silent hops are dropped from the path.
fn flatten_trace_hops(hops: Vec<RawTraceHop>) -> (Option<Vec<String>>, Option<f64>) {
    let mut path = Vec::with_capacity(hops.len());
    let mut last_rtt = None;
    for hop in hops {
        let replies: Vec<&RawHopReply> = hop.result.iter().filter(|r| r.from.is_some()).collect();
        if let Some(first) = replies.first().and_then(|r| r.from.clone()) {
            path.push(first);
            last_rtt = replies
                .iter()
                .filter_map(|r| r.rtt)
                .reduce(f64::min);
        }
    }
    (Some(path), last_rtt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping_document() {
        let json = r#"{
            "measurement_id": 1001,
            "target": "example.com",
            "results": [
                {
                    "probe_id": 11,
                    "measurement_type": "ping",
                    "source_address": "192.0.2.10",
                    "target_address": "93.184.216.34",
                    "packet_loss_percentage": 0.0,
                    "latency_stats": {"min": 10.0, "max": 14.0, "avg": 12.0, "all_rtts": [10.0, 12.0, 14.0]},
                    "distance_km": 120.5
                },
                {
                    "probe_id": 12,
                    "measurement_type": "ping",
                    "packet_loss_percentage": 100.0,
                    "latency_stats": {"min": null, "max": null, "avg": null, "all_rtts": []}
                }
            ]
        }"#;

        let m = parse_document(json).expect("parse failed");
        assert_eq!(m.id, 1001);
        assert_eq!(m.kind, MeasurementKind::Ping);
        assert_eq!(m.target, "example.com");
        assert_eq!(m.samples.len(), 2);
        assert_eq!(m.samples[0].latency.rtts, vec![10.0, 12.0, 14.0]);
        assert_eq!(m.samples[0].source.distance_km, Some(120.5));
        assert_eq!(m.samples[1].latency.avg, None);
        assert_eq!(m.samples[1].packet_loss, Some(100.0));
    }

    #[test]
    fn test_parse_raw_traceroute_hops() {
        let json = r#"{
            "measurement_id": 2002,
            "results": [
                {
                    "probe_id": 7,
                    "measurement_type": "traceroute",
                    "target": "example.net",
                    "target_address": "198.51.100.1",
                    "traceroute_hops": [
                        {"hop": 1, "result": [{"from": "10.0.0.1", "rtt": 1.2}, {"from": "10.0.0.1", "rtt": 1.0}]},
                        {"hop": 2, "result": [{"x": "*"}]},
                        {"hop": 3, "result": [{"from": "198.51.100.1", "rtt": 30.5}]}
                    ]
                }
            ]
        }"#;

        let m = parse_document(json).expect("parse failed");
        assert_eq!(m.kind, MeasurementKind::Traceroute);
        assert_eq!(m.target, "example.net");
        let s = &m.samples[0];
        assert_eq!(
            s.hops.as_deref(),
            Some(&["10.0.0.1".to_string(), "198.51.100.1".to_string()][..])
        );
        assert_eq!(s.latency.avg, Some(30.5));
    }

    #[test]
    fn test_parse_flat_hops() {
        let json = r#"{
            "measurement_id": 3,
            "type": "traceroute",
            "target": "t",
            "results": [{"probe_id": 1, "hops": [{"ip": "a"}, {"ip": null}, {"ip": "b", "rtt": 9.0}]}]
        }"#;
        let m = parse_document(json).unwrap();
        assert_eq!(m.samples[0].hops, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(m.samples[0].latency.avg, Some(9.0));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        assert!(matches!(
            parse_document("{not json"),
            Err(DetectError::MalformedResult(_))
        ));
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let json = r#"{"measurement_id": 5, "results": [{"probe_id": 1, "measurement_type": "dns"}]}"#;
        assert!(matches!(
            parse_document(json),
            Err(DetectError::MalformedResult(_))
        ));
    }

    #[test]
    fn test_missing_id_is_malformed() {
        let json = r#"{"type": "ping", "results": []}"#;
        assert!(matches!(
            parse_document(json),
            Err(DetectError::MalformedResult(_))
        ));
    }

    #[test]
    fn test_mistyped_entry_stays_local() {
        let json = r#"{
            "measurement_id": 40,
            "type": "ping",
            "target": "example.com",
            "results": [
                {"probe_id": 1, "packet_loss_percentage": 0.0, "latency_stats": {"avg": 400.0}},
                {"probe_id": 2, "packet_loss_percentage": 0.0, "latency_stats": {"avg": 30.0}},
                {"probe_id": 3, "packet_loss_percentage": 0.0, "distance_km": "unknown",
                 "latency_stats": {"avg": 31.0}}
            ]
        }"#;
        let m = parse_document(json).expect("one bad entry must not reject the document");
        assert_eq!(m.samples.len(), 3);
        assert!(m.samples[0].malformed.is_none());
        assert_eq!(m.samples[0].latency.avg, Some(400.0));
        assert_eq!(m.samples[2].probe_id, 3);
        assert!(m.samples[2].malformed.as_deref().unwrap().contains("invalid type"));
    }

    #[test]
    fn test_parse_result_timestamps() {
        let json = r#"{
            "measurement_id": 41,
            "type": "ping",
            "target": "t",
            "results": [
                {"probe_id": 1, "timestamp": 1700000000},
                {"probe_id": 2, "timestamp": "2023-11-14T22:13:20"},
                {"probe_id": 3, "timestamp": "2023-11-14T23:13:20+01:00"},
                {"probe_id": 4, "timestamp": "yesterday"},
                {"probe_id": 5}
            ]
        }"#;
        let m = parse_document(json).unwrap();
        let expected = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(m.samples[0].observed_at, Some(expected));
        assert_eq!(m.samples[1].observed_at, Some(expected));
        assert_eq!(m.samples[2].observed_at, Some(expected));
        assert_eq!(m.samples[3].observed_at, None);
        assert_eq!(m.samples[4].observed_at, None);
        assert!(m.samples.iter().all(|s| s.malformed.is_none()));
    }
}
