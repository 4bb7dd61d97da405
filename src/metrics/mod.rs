use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Default snapshot ring capacity: a week of hourly windows.
const DEFAULT_MAX_SNAPSHOTS: usize = 168;

/// Aggregated interface metrics for one time window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Start of the window the counters cover.
    pub timestamp: DateTime<Utc>,
    /// Unique connection ids seen in the window.
    pub connections: usize,
    pub bandwidth_in: i64,
    pub bandwidth_out: i64,
    pub blocked: usize,
    pub inactive: usize,
}

/// Mutable counters for the window currently being accumulated.
struct Window {
    start_time: DateTime<Utc>,
    active_conns: HashSet<String>,
    total_bytes_in: i64,
    total_bytes_out: i64,
    blocked_count: usize,
    inactive_count: usize,
    snapshots: VecDeque<Snapshot>,
    max_snapshots: usize,
}

impl Window {
    fn current_snapshot(&self) -> Snapshot {
        Snapshot {
            timestamp: self.start_time,
            connections: self.active_conns.len(),
            bandwidth_in: self.total_bytes_in,
            bandwidth_out: self.total_bytes_out,
            blocked: self.blocked_count,
            inactive: self.inactive_count,
        }
    }
}

/// Collects coarse interface-wide metrics over time windows and keeps a
/// bounded ring of historical snapshots. Concurrency-safe; every operation
/// holds the single internal lock.
pub struct Collector {
    inner: Mutex<Window>,
}

impl Collector {
    /// Creates a collector keeping at most `max_snapshots` historical
    /// snapshots; zero falls back to the default of 168.
    pub fn new(max_snapshots: usize) -> Self {
        let max_snapshots = if max_snapshots == 0 {
            DEFAULT_MAX_SNAPSHOTS
        } else {
            max_snapshots
        };

        Self {
            inner: Mutex::new(Window {
                start_time: Utc::now(),
                active_conns: HashSet::new(),
                total_bytes_in: 0,
                total_bytes_out: 0,
                blocked_count: 0,
                inactive_count: 0,
                snapshots: VecDeque::with_capacity(max_snapshots),
                max_snapshots,
            }),
        }
    }

    /// Records one delivered connection into the current window.
    pub fn record_connection(
        &self,
        conn_id: &str,
        bytes_in: i64,
        bytes_out: i64,
        blocked: bool,
        inactive: bool,
    ) {
        let mut win = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        win.active_conns.insert(conn_id.to_string());
        win.total_bytes_in += bytes_in;
        win.total_bytes_out += bytes_out;

        if blocked {
            win.blocked_count += 1;
        }
        if inactive {
            win.inactive_count += 1;
        }
    }

    /// Captures the current window as a snapshot, appends it to the ring
    /// (dropping the oldest when full) and resets the window, including a
    /// fresh start timestamp.
    pub fn take_snapshot(&self) -> Snapshot {
        let mut win = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let snapshot = win.current_snapshot();

        if win.snapshots.len() == win.max_snapshots {
            win.snapshots.pop_front();
        }
        win.snapshots.push_back(snapshot.clone());

        win.start_time = Utc::now();
        win.active_conns.clear();
        win.total_bytes_in = 0;
        win.total_bytes_out = 0;
        win.blocked_count = 0;
        win.inactive_count = 0;

        snapshot
    }

    /// Returns a copy of all collected snapshots, oldest first.
    pub fn snapshots(&self) -> Vec<Snapshot> {
        let win = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        win.snapshots.iter().cloned().collect()
    }

    /// Returns the current window's counters without resetting anything.
    pub fn current(&self) -> Snapshot {
        let win = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        win.current_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_falls_back_to_default() {
        let c = Collector::new(0);
        for i in 0..DEFAULT_MAX_SNAPSHOTS + 5 {
            c.record_connection(&format!("conn{i}"), 1, 1, false, false);
            c.take_snapshot();
        }
        assert_eq!(c.snapshots().len(), DEFAULT_MAX_SNAPSHOTS);
    }

    #[test]
    fn test_record_connection_accumulates() {
        let c = Collector::new(10);

        c.record_connection("conn1", 100, 200, false, false);
        c.record_connection("conn2", 50, 75, false, true);
        // Same id again must not bump the connection count.
        c.record_connection("conn1", 25, 30, false, false);

        let current = c.current();
        assert_eq!(current.connections, 2);
        assert_eq!(current.bandwidth_in, 175);
        assert_eq!(current.bandwidth_out, 305);
        assert_eq!(current.blocked, 0);
        assert_eq!(current.inactive, 1);
    }

    #[test]
    fn test_blocked_count() {
        let c = Collector::new(10);
        c.record_connection("conn1", 1, 1, true, false);
        c.record_connection("conn2", 1, 1, true, true);
        assert_eq!(c.current().blocked, 2);
    }

    #[test]
    fn test_take_snapshot_resets_window() {
        let c = Collector::new(3);

        c.record_connection("conn1", 100, 200, false, false);
        c.record_connection("conn2", 50, 75, false, true);

        let before = c.current().timestamp;
        let snap = c.take_snapshot();
        assert_eq!(snap.timestamp, before);
        assert_eq!(snap.connections, 2);
        assert_eq!(snap.bandwidth_in, 150);
        assert_eq!(snap.bandwidth_out, 275);
        assert_eq!(snap.inactive, 1);

        let current = c.current();
        assert_eq!(current.connections, 0);
        assert_eq!(current.bandwidth_in, 0);
        assert_eq!(current.bandwidth_out, 0);
        assert_eq!(current.inactive, 0);
        assert!(current.timestamp >= snap.timestamp);
    }

    #[test]
    fn test_ring_drops_oldest() {
        let c = Collector::new(3);

        for i in 0..5i64 {
            c.record_connection("conn", i, 0, false, false);
            c.take_snapshot();
        }

        let snaps = c.snapshots();
        assert_eq!(snaps.len(), 3);
        // Windows 0 and 1 were evicted.
        assert_eq!(snaps[0].bandwidth_in, 2);
        assert_eq!(snaps[2].bandwidth_in, 4);
    }

    #[test]
    fn test_snapshots_returns_a_copy() {
        let c = Collector::new(3);
        c.take_snapshot();

        let mut snaps = c.snapshots();
        snaps.clear();
        assert_eq!(c.snapshots().len(), 1);
    }
}
