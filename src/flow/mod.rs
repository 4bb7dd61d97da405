pub mod ident;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, SecondsFormat, Utc};

use crate::backend::types::Connection;
use crate::capture::event::Protocol;
use crate::config::DedupMode;

/// Identity of a flow in the table after canonicalization.
///
/// Equality is structural over all five fields. Addresses are kept in text
/// form because that is what the stable id and the wire records carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
}

/// Keys order lexicographically over (protocol, src_ip, dst_ip, src_port,
/// dst_port). Export batches sort on this, so two runs over the same key
/// set always produce the same record order.
impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.protocol
            .cmp(&other.protocol)
            .then_with(|| self.src_ip.cmp(&other.src_ip))
            .then_with(|| self.dst_ip.cmp(&other.dst_ip))
            .then_with(|| self.src_port.cmp(&other.src_port))
            .then_with(|| self.dst_port.cmp(&other.dst_port))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-flow state. `first_seen` never moves after creation; the counters
/// are monotonic until the entry is pruned away.
#[derive(Debug)]
struct Entry {
    id: String,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    bytes_in: i64,
    bytes_out: i64,
    packets_in: i64,
    packets_out: i64,
    /// Has observations the sink has not acknowledged yet.
    dirty: bool,
    /// Reserved by an outstanding or already-acknowledged export; excluded
    /// from selection until the next `reset_pending`.
    pending: bool,
    /// Crossed the first idle threshold; awaiting deletion or reactivation.
    inactive: bool,
}

/// Concurrency-safe table of bidirectional flows.
///
/// A single mutex guards the whole table including the per-entry flags.
/// None of the operations perform I/O or serialization under the lock;
/// `export_batch` copies selected entries out before releasing it.
pub struct Aggregator {
    host_id: String,
    dedup: DedupMode,
    idle_ttl: Duration,
    local_ips: HashSet<String>,
    flows: Mutex<HashMap<Key, Entry>>,
}

impl Aggregator {
    /// Creates an aggregator. `local_ips` is the set of addresses (text
    /// form) considered local to the capture interface; it drives both
    /// canonicalization and directional accounting.
    pub fn new(
        host_id: &str,
        dedup: DedupMode,
        idle_ttl: std::time::Duration,
        local_ips: HashSet<String>,
    ) -> Self {
        Self {
            host_id: host_id.to_string(),
            dedup,
            idle_ttl: Duration::from_std(idle_ttl).unwrap_or_else(|_| Duration::zero()),
            local_ips,
            flows: Mutex::new(HashMap::new()),
        }
    }

    /// Number of flows currently tracked.
    pub fn len(&self) -> usize {
        self.flows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Computes the canonical key for a packet. If exactly one endpoint is
    /// local, the local side always lands in the `src` position so both
    /// directions of a conversation collapse to one key. Ties (both local
    /// or both remote) never swap. Dedup mode `ip` zeroes both ports.
    fn key_for(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        protocol: Protocol,
    ) -> Key {
        let mut src = src_ip.to_string();
        let mut dst = dst_ip.to_string();
        let mut src_port = src_port;
        let mut dst_port = dst_port;

        let src_local = self.local_ips.contains(&src);
        let dst_local = self.local_ips.contains(&dst);
        if dst_local && !src_local {
            std::mem::swap(&mut src, &mut dst);
            std::mem::swap(&mut src_port, &mut dst_port);
        }

        if self.dedup == DedupMode::Ip {
            src_port = 0;
            dst_port = 0;
        }

        Key {
            src_ip: src,
            dst_ip: dst,
            src_port,
            dst_port,
            protocol,
        }
    }

    /// Folds one packet observation into the table.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        ts: DateTime<Utc>,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        protocol: Protocol,
        length: u32,
    ) {
        let key = self.key_for(src_ip, dst_ip, src_port, dst_port, protocol);

        let mut flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());

        let entry = flows.entry(key).or_insert_with_key(|k| {
            let src_port = k.src_port.to_string();
            let dst_port = k.dst_port.to_string();
            let id = ident::stable_id(
                &self.host_id,
                [
                    k.protocol.as_str(),
                    k.src_ip.as_str(),
                    k.dst_ip.as_str(),
                    src_port.as_str(),
                    dst_port.as_str(),
                ],
            );
            Entry {
                id,
                first_seen: ts,
                last_seen: ts,
                bytes_in: 0,
                bytes_out: 0,
                packets_in: 0,
                packets_out: 0,
                dirty: true,
                pending: false,
                inactive: false,
            }
        });

        entry.last_seen = ts;
        entry.dirty = true;
        // A fresh packet re-awakens an idle flow.
        entry.inactive = false;

        // Direction follows the original packet, not the canonical key.
        if self.local_ips.contains(&src_ip.to_string()) {
            entry.bytes_out += i64::from(length);
            entry.packets_out += 1;
        } else {
            entry.bytes_in += i64::from(length);
            entry.packets_in += 1;
        }
    }

    /// Applies the two idle thresholds. Past the TTL an entry turns
    /// inactive (and dirty, so the state change gets published); past
    /// twice the TTL it is deleted. A zero TTL disables pruning.
    pub fn prune(&self, now: DateTime<Utc>) {
        if self.idle_ttl <= Duration::zero() {
            return;
        }

        let mut flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        flows.retain(|_, entry| {
            let idle = now.signed_duration_since(entry.last_seen);

            if idle > self.idle_ttl * 2 {
                return false;
            }
            if idle > self.idle_ttl && !entry.inactive {
                entry.inactive = true;
                entry.dirty = true;
            }
            true
        });
    }

    /// Selects up to `max` exportable flows and reserves them.
    ///
    /// A flow is exportable when it is dirty and not already reserved by
    /// this tick's earlier batches. Selected keys are sorted (see [`Key`]'s
    /// ordering), truncated to `max`, marked pending, and copied out as
    /// `(record, key)` pairs. A `max` of zero returns an empty batch.
    pub fn export_batch(&self, max: usize) -> Vec<(Connection, Key)> {
        if max == 0 {
            return Vec::new();
        }

        let mut flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());

        let mut keys: Vec<Key> = flows
            .iter()
            .filter(|(_, e)| e.dirty && !e.pending)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys.truncate(max);

        let mut batch = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(entry) = flows.get_mut(&key) else {
                continue;
            };
            entry.pending = true;

            let status = if entry.inactive { "inactive" } else { "active" };
            let duration_ms = entry
                .last_seen
                .signed_duration_since(entry.first_seen)
                .num_milliseconds();

            let record = Connection {
                id: entry.id.clone(),
                source_ip: key.src_ip.clone(),
                dest_ip: key.dst_ip.clone(),
                source_port: key.src_port,
                dest_port: key.dst_port,
                protocol: key.protocol.as_str(),
                status,
                start_time: rfc3339_nanos(entry.first_seen),
                last_activity: rfc3339_nanos(entry.last_seen),
                bytes_in: Some(entry.bytes_in),
                bytes_out: Some(entry.bytes_out),
                packets_in: Some(entry.packets_in),
                packets_out: Some(entry.packets_out),
                duration_ms: Some(duration_ms),
                ..Connection::default()
            };

            batch.push((record, key));
        }

        batch
    }

    /// Acknowledges a delivered batch: the flows are clean, but stay
    /// pending so continued traffic cannot re-export them within the same
    /// flush interval. `reset_pending` at the next tick frees them.
    pub fn ack(&self, keys: &[Key]) {
        let mut flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            if let Some(entry) = flows.get_mut(key) {
                entry.dirty = false;
            }
        }
    }

    /// Releases a failed batch: the flows stay dirty and become
    /// immediately selectable again.
    pub fn nack(&self, keys: &[Key]) {
        let mut flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            if let Some(entry) = flows.get_mut(key) {
                entry.pending = false;
            }
        }
    }

    /// Clears the pending reservation on every flow. Called once at the
    /// top of each flush tick, before the export loop.
    pub fn reset_pending(&self) {
        let mut flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        for entry in flows.values_mut() {
            entry.pending = false;
        }
    }
}

/// RFC3339 with nanosecond precision in UTC, the collector's timestamp
/// format.
fn rfc3339_nanos(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}
