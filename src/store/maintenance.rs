//! Space and WAL maintenance: self-throttling retention and the
//! threshold-gated RESTART checkpoint.

use std::path::Path;

use chrono::Utc;

use super::{Result, Store};

/// What a retention pass did, for the caller's log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub deleted: u64,
    pub did_run: bool,
}

impl Store {
    pub fn db_size_bytes(&self) -> i64 {
        std::fs::metadata(self.path()).map(|m| m.len() as i64).unwrap_or(0)
    }

    pub fn wal_size_bytes(&self) -> i64 {
        let mut wal = self.path().as_os_str().to_owned();
        wal.push("-wal");
        std::fs::metadata(&wal).map(|m| m.len() as i64).unwrap_or(0)
    }

    /// RESTART-checkpoint the WAL when the sidefile has grown past
    /// `threshold_bytes`. RESTART rather than TRUNCATE: writers may be
    /// concurrent with this loop.
    pub async fn checkpoint_if_wal_exceeds(&self, threshold_bytes: i64) -> Result<bool> {
        if self.wal_size_bytes() <= threshold_bytes {
            return Ok(false);
        }
        sqlx::query("PRAGMA wal_checkpoint(RESTART)")
            .execute(self.writer())
            .await?;
        Ok(true)
    }

    /// Self-throttling retention pass.
    ///
    /// Does nothing while both the filesystem usage and the database file
    /// size sit below their thresholds. Otherwise deletes synced rows
    /// older than the retention window from each event table and
    /// reclaims freelist pages with an incremental vacuum.
    pub async fn cleanup_old_synced(
        &self,
        retention_days: u32,
        disk_threshold_pct: f64,
        db_threshold_bytes: i64,
    ) -> Result<CleanupOutcome> {
        let dir = self.path().parent().unwrap_or_else(|| Path::new("."));
        let usage_pct = disk_usage_percent(dir);
        let db_size = self.db_size_bytes();
        if usage_pct < disk_threshold_pct && db_size < db_threshold_bytes {
            return Ok(CleanupOutcome {
                deleted: 0,
                did_run: false,
            });
        }

        let cutoff = Utc::now().timestamp_millis() - i64::from(retention_days) * 86_400_000;
        let mut deleted = 0u64;
        for table in ["llm_traces", "error_events", "system_metrics"] {
            let res = sqlx::query(&format!(
                "DELETE FROM {table} WHERE synced = 1 AND created_at < ?"
            ))
            .bind(cutoff)
            .execute(self.writer())
            .await?;
            deleted += res.rows_affected();
        }

        let _ = sqlx::query("PRAGMA incremental_vacuum(1000)")
            .execute(self.writer())
            .await;

        Ok(CleanupOutcome {
            deleted,
            did_run: true,
        })
    }
}

/// Used percentage of the filesystem holding `path`, via statvfs.
/// Returns 0 when the filesystem cannot be inspected.
pub(crate) fn disk_usage_percent(path: &Path) -> f64 {
    match statvfs(path) {
        Some((total, free)) if total > 0.0 => ((total - free) / total) * 100.0,
        _ => 0.0,
    }
}

/// (total_bytes, available_bytes) for the filesystem holding `path`.
pub(crate) fn statvfs(path: &Path) -> Option<(f64, f64)> {
    use std::ffi::CString;
    let path_cstr = CString::new(path.to_str()?.as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(path_cstr.as_ptr(), &mut stat) };
    if ret == 0 {
        let total = stat.f_blocks as f64 * stat.f_frsize as f64;
        let free = stat.f_bavail as f64 * stat.f_frsize as f64;
        Some((total, free))
    } else {
        None
    }
}
