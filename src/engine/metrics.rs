//! SOPHIA - Engine Metrics & Observability
//! Lock-free operation counters shared by the engine, the database handle
//! and every cursor it opens.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic operation counters for the Sophia engine.
///
/// All counters use `Ordering::Relaxed`; they are for observability only.
#[derive(Debug)]
pub struct EngineMetrics {
    pub puts: AtomicU64,
    pub gets: AtomicU64,
    /// `exists` calls.
    pub exists: AtomicU64,
    pub deletes: AtomicU64,
    /// Cursors opened.
    pub cursors: AtomicU64,
    pub flushes: AtomicU64,
    pub compactions: AtomicU64,
    /// Key and value bytes accepted by `set`.
    pub bytes_written: AtomicU64,
    /// Value bytes returned by `get` and by cursors.
    pub bytes_read: AtomicU64,
    /// WAL records replayed at open.
    pub wal_recoveries: AtomicU64,
    started: Instant,
}

/// Plain copy of the counters at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub puts: u64,
    pub gets: u64,
    pub exists: u64,
    pub deletes: u64,
    pub cursors: u64,
    pub flushes: u64,
    pub compactions: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub wal_recoveries: u64,
    pub uptime_secs: f64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            exists: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            cursors: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            wal_recoveries: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_put(&self, key_size: usize, value_size: usize) {
        bump(&self.puts, 1);
        bump(&self.bytes_written, (key_size + value_size) as u64);
    }

    /// `value_size` is `None` on a miss.
    pub fn record_get(&self, value_size: Option<usize>) {
        bump(&self.gets, 1);
        if let Some(size) = value_size {
            bump(&self.bytes_read, size as u64);
        }
    }

    pub fn record_exists(&self) {
        bump(&self.exists, 1);
    }

    pub fn record_delete(&self) {
        bump(&self.deletes, 1);
    }

    pub fn record_cursor(&self) {
        bump(&self.cursors, 1);
    }

    pub fn record_cursor_read(&self, value_size: usize) {
        bump(&self.bytes_read, value_size as u64);
    }

    pub fn record_flush(&self) {
        bump(&self.flushes, 1);
    }

    pub fn record_compaction(&self) {
        bump(&self.compactions, 1);
    }

    pub fn record_recovery(&self, records: usize) {
        bump(&self.wal_recoveries, records as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            puts: load(&self.puts),
            gets: load(&self.gets),
            exists: load(&self.exists),
            deletes: load(&self.deletes),
            cursors: load(&self.cursors),
            flushes: load(&self.flushes),
            compactions: load(&self.compactions),
            bytes_written: load(&self.bytes_written),
            bytes_read: load(&self.bytes_read),
            wal_recoveries: load(&self.wal_recoveries),
            uptime_secs: self.started.elapsed().as_secs_f64(),
        }
    }

    /// Human-readable report for the shell's `info` command.
    pub fn report(&self) -> String {
        self.snapshot().to_string()
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSnapshot {
    /// Client-facing operations, flushes and compactions excluded.
    pub fn total_ops(&self) -> u64 {
        self.puts + self.gets + self.exists + self.deletes + self.cursors
    }

    pub fn ops_per_sec(&self) -> f64 {
        if self.uptime_secs < 0.001 {
            return 0.0;
        }
        self.total_ops() as f64 / self.uptime_secs
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "═══ SOPHIA Engine Metrics ═══")?;
        writeln!(f, "Operations:")?;
        for (name, value) in [
            ("puts", self.puts),
            ("gets", self.gets),
            ("exists", self.exists),
            ("deletes", self.deletes),
            ("cursors", self.cursors),
            ("flushes", self.flushes),
            ("compactions", self.compactions),
        ] {
            writeln!(f, "  {:<12} {}", format!("{}:", name), value)?;
        }
        writeln!(f, "Throughput:")?;
        writeln!(f, "  total ops:   {}", self.total_ops())?;
        writeln!(f, "  ops/sec:     {:.2}", self.ops_per_sec())?;
        writeln!(f, "I/O:")?;
        writeln!(f, "  written:     {} bytes", self.bytes_written)?;
        writeln!(f, "  read:        {} bytes", self.bytes_read)?;
        writeln!(f, "Recovery:")?;
        writeln!(f, "  wal records replayed: {}", self.wal_recoveries)?;
        write!(f, "Uptime: {:.2}s", self.uptime_secs)
    }
}
