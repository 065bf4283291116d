//! Configuration: every knob is an `OCT_*` environment variable with a
//! matching long flag, declared once so defaults, `--help`, and
//! `--version` all come from the same place. Duration values accept
//! humantime strings ("500ms", "15s", "5m").

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "octrace",
    about = "Observability sidecar — buffers LLM traces, errors, and host metrics in SQLite and pushes them upstream",
    version
)]
pub struct Config {
    /// HTTP listen port for ingest and health
    #[arg(long, env = "OCT_PORT", default_value_t = 9090)]
    pub port: u16,

    /// SQLite database file (WAL sidefile lives next to it)
    #[arg(long, env = "OCT_DB_PATH", default_value = "/data/openclaw-trace.db")]
    pub db_path: PathBuf,

    /// Log level or tracing filter directive
    #[arg(long, env = "OCT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Remote ingestion endpoint; push stays disabled when unset
    #[arg(long, env = "OCT_PUSH_ENDPOINT")]
    pub push_endpoint: Option<String>,

    #[arg(long, env = "OCT_PUSH_INTERVAL", default_value = "5m", value_parser = humantime::parse_duration)]
    pub push_interval: Duration,

    /// Serialized envelope size cap per push batch
    #[arg(long, env = "OCT_PUSH_MAX_PAYLOAD_BYTES", default_value_t = 5_242_880)]
    pub push_max_payload_bytes: usize,

    /// Gateway log file to tail; parser stays off when unset
    #[arg(long, env = "OCT_LOG_PATH")]
    pub log_path: Option<PathBuf>,

    /// Synced rows older than this many days are eligible for deletion
    #[arg(long, env = "OCT_RETENTION_DAYS", default_value_t = 3)]
    pub retention_days: u32,

    /// Byte cap applied to input_text/output_text on ingest
    #[arg(long, env = "OCT_MAX_TEXT_BYTES", default_value_t = 16_384)]
    pub max_text_bytes: usize,

    #[arg(long, env = "OCT_METRICS_INTERVAL", default_value = "15s", value_parser = humantime::parse_duration)]
    pub metrics_interval: Duration,

    #[arg(long, env = "OCT_CLEANUP_INTERVAL", default_value = "5m", value_parser = humantime::parse_duration)]
    pub cleanup_interval: Duration,

    #[arg(long, env = "OCT_WAL_CHECKPOINT_INTERVAL", default_value = "10m", value_parser = humantime::parse_duration)]
    pub wal_checkpoint_interval: Duration,

    /// WAL sidefile size that triggers a RESTART checkpoint
    #[arg(long, env = "OCT_WAL_RESTART_THRESHOLD_BYTES", default_value_t = 52_428_800)]
    pub wal_restart_threshold_bytes: i64,

    /// Disk usage percent below which retention does nothing
    #[arg(long, env = "OCT_CLEANUP_DISK_THRESHOLD", default_value_t = 80.0)]
    pub cleanup_disk_threshold: f64,

    /// Database file size below which retention does nothing
    #[arg(long, env = "OCT_CLEANUP_DB_THRESHOLD_BYTES", default_value_t = 104_857_600)]
    pub cleanup_db_threshold_bytes: i64,
}
