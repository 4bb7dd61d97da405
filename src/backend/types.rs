use serde::{Deserialize, Serialize};

/// One exported flow in the collector's expected JSON shape.
///
/// The collector accepts partial records; the enrichment fields (geo, ASN,
/// category) are never populated by this sensor and are omitted from the
/// payload when absent. Field names are part of the wire contract.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub source_ip: String,
    pub dest_ip: String,
    pub source_port: u16,
    pub dest_port: u16,
    pub protocol: &'static str,
    /// "active" or "inactive".
    pub status: &'static str,
    /// RFC3339 with nanosecond precision, UTC.
    pub start_time: String,
    pub last_activity: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn: Option<i64>,
    #[serde(rename = "asOrganization", skip_serializing_if = "Option::is_none")]
    pub as_organization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enriched: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_out: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets_out: Option<i64>,
    /// Whole milliseconds between first and last activity.
    #[serde(rename = "duration", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// Body of `POST /api/connections`. Borrows the batch so callers can
/// serialize arbitrary prefixes without cloning records.
#[derive(Debug, Serialize)]
pub struct ConnectionsPayload<'a> {
    pub connections: &'a [Connection],
}

/// One interface metrics window in the collector's JSON shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// RFC3339 with nanosecond precision, UTC.
    pub timestamp: String,
    pub connections: usize,
    pub bandwidth_in: i64,
    pub bandwidth_out: i64,
    pub blocked: usize,
    pub inactive: usize,
}

/// Body of `POST /api/metrics`.
#[derive(Debug, Serialize)]
pub struct MetricsPayload<'a> {
    pub snapshots: &'a [MetricsSnapshot],
}

/// Collector acknowledgement for an accepted batch.
#[derive(Debug, Clone, Deserialize)]
pub struct AcceptedResponse {
    pub received: usize,
    pub status: String,
}
