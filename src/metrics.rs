//! Host metrics producer: samples cgroup v2 CPU and memory, filesystem
//! usage under the database directory, and process I/O rates.
//!
//! CPU percent and I/O rates are deltas between successive samples, so
//! the first sample only primes state and is discarded.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::ingest::{Enqueuer, Event, EventPayload, MetricPayload};
use crate::store::statvfs;
use crate::tasks::TickTask;

const CPU_STAT_PATH: &str = "/sys/fs/cgroup/cpu.stat";
const CPU_MAX_PATH: &str = "/sys/fs/cgroup/cpu.max";
const MEMORY_CURRENT_PATH: &str = "/sys/fs/cgroup/memory.current";
const MEMORY_MAX_PATH: &str = "/sys/fs/cgroup/memory.max";
const PROC_IO_PATH: &str = "/proc/self/io";

struct CpuSample {
    usage_usec: i64,
    at: Instant,
}

struct IoSample {
    read_bytes: i64,
    write_bytes: i64,
    at: Instant,
}

pub struct MetricsSampler {
    interval: Duration,
    enqueuer: Arc<dyn Enqueuer>,
    db_dir: PathBuf,
    last_cpu: Option<CpuSample>,
    last_io: Option<IoSample>,
}

impl MetricsSampler {
    pub fn new(interval: Duration, enqueuer: Arc<dyn Enqueuer>, db_path: &Path) -> Self {
        let db_dir = db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            interval,
            enqueuer,
            db_dir,
            last_cpu: None,
            last_io: None,
        }
    }

    /// Take one sample. Returns `None` while priming the CPU delta or
    /// when the cgroup files are unreadable.
    fn collect(&mut self) -> Option<Event> {
        let now = Instant::now();
        let usage_usec = parse_usage_usec(&std::fs::read_to_string(CPU_STAT_PATH).ok()?)?;
        let cores = std::fs::read_to_string(CPU_MAX_PATH)
            .ok()
            .map(|s| effective_cores(&s, host_cpus()))
            .unwrap_or_else(host_cpus);

        let current = CpuSample {
            usage_usec,
            at: now,
        };
        let Some(last) = self.last_cpu.replace(current) else {
            return None; // first sample primes the delta
        };
        let delta_usage = (usage_usec - last.usage_usec) as f64 / 1_000_000.0;
        let delta_time = now.duration_since(last.at).as_secs_f64();
        if delta_time <= 0.0 {
            return None;
        }
        let cpu_pct = ((delta_usage / delta_time) * 100.0 / cores).max(0.0);

        let (mem_current, mem_total) = read_memory_cgroup();
        let mem_available = if mem_total > 0 && mem_total >= mem_current {
            mem_total - mem_current
        } else {
            0
        };

        let (disk_used, disk_total, disk_free) = disk_stats(&self.db_dir);
        let (io_read_rate, io_write_rate) = self.io_rates(now);
        let disk_usage_pct = if disk_total > 0 {
            (disk_used as f64 / disk_total as f64) * 100.0
        } else {
            0.0
        };

        let metadata = serde_json::json!({
            "io_read_bytes_per_sec": io_read_rate,
            "io_write_bytes_per_sec": io_write_rate,
            "disk_usage_pct": disk_usage_pct,
            "source": "cgroup",
        });

        Some(Event {
            created_at: Utc::now().timestamp_millis(),
            payload: EventPayload::Metric(MetricPayload {
                cpu_pct,
                mem_rss_bytes: mem_current,
                mem_available,
                mem_total,
                disk_used_bytes: disk_used,
                disk_total_bytes: disk_total,
                disk_free_bytes: disk_free,
                metadata: metadata.to_string(),
            }),
        })
    }

    fn io_rates(&mut self, now: Instant) -> (i64, i64) {
        let (read_bytes, write_bytes) = std::fs::read_to_string(PROC_IO_PATH)
            .map(|s| parse_proc_io(&s))
            .unwrap_or((0, 0));
        let current = IoSample {
            read_bytes,
            write_bytes,
            at: now,
        };
        let Some(last) = self.last_io.replace(current) else {
            return (0, 0);
        };
        let seconds = now.duration_since(last.at).as_secs_f64();
        if seconds <= 0.0 {
            return (0, 0);
        }
        let read_rate = ((read_bytes - last.read_bytes) as f64 / seconds) as i64;
        let write_rate = ((write_bytes - last.write_bytes) as f64 / seconds) as i64;
        (read_rate.max(0), write_rate.max(0))
    }
}

#[async_trait]
impl TickTask for MetricsSampler {
    fn name(&self) -> &'static str {
        "metrics_sampler"
    }

    fn period(&self) -> Duration {
        self.interval
    }

    async fn tick(&mut self) -> Result<()> {
        if let Some(event) = self.collect() {
            self.enqueuer.enqueue(event);
        }
        Ok(())
    }
}

/// `usage_usec` line from cgroup v2 `cpu.stat`.
fn parse_usage_usec(content: &str) -> Option<i64> {
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() == Some("usage_usec") {
            return fields.next()?.parse().ok();
        }
    }
    None
}

/// Effective core count from cgroup v2 `cpu.max` ("quota period" or
/// "max period"). Falls back to the host count, never below 1.
fn effective_cores(content: &str, host: f64) -> f64 {
    let fields: Vec<&str> = content.split_whitespace().collect();
    if fields.len() != 2 || fields[0] == "max" {
        return host;
    }
    let (Ok(quota), Ok(period)) = (fields[0].parse::<f64>(), fields[1].parse::<f64>()) else {
        return host;
    };
    if period <= 0.0 {
        return host;
    }
    (quota / period).max(1.0)
}

fn host_cpus() -> f64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as f64)
        .unwrap_or(1.0)
}

/// (current, total) from cgroup v2 memory files. A `memory.max` of
/// "max" (no limit) reports total 0.
fn read_memory_cgroup() -> (i64, i64) {
    let Ok(current_raw) = std::fs::read_to_string(MEMORY_CURRENT_PATH) else {
        return (0, 0);
    };
    let current = current_raw.trim().parse().unwrap_or(0);

    let Ok(max_raw) = std::fs::read_to_string(MEMORY_MAX_PATH) else {
        return (current, 0);
    };
    let max_str = max_raw.trim();
    if max_str == "max" {
        return (current, 0);
    }
    (current, max_str.parse().unwrap_or(0))
}

/// `read_bytes` / `write_bytes` from `/proc/self/io`.
fn parse_proc_io(content: &str) -> (i64, i64) {
    let mut read_bytes = 0;
    let mut write_bytes = 0;
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        match key.trim_end_matches(':') {
            "read_bytes" => read_bytes = value.parse().unwrap_or(0),
            "write_bytes" => write_bytes = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    (read_bytes, write_bytes)
}

/// (used, total, free) bytes for the filesystem holding `path`.
fn disk_stats(path: &Path) -> (i64, i64, i64) {
    match statvfs(path) {
        Some((total, free)) => {
            let total = total as i64;
            let free = free as i64;
            (total - free, total, free)
        }
        None => (0, 0, 0),
    }
}
