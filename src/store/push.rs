//! Push projection: unsynced rows from all three event tables, emitted
//! as wire-ready JSON straight from SQLite via `json_object`, plus the
//! mark-synced transition.

use serde_json::value::RawValue;
use sqlx::Row;

use super::{Result, Store, StoreError};

/// Which event table a projected row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTable {
    LlmTraces,
    ErrorEvents,
    SystemMetrics,
}

impl EventTable {
    pub fn table_name(self) -> &'static str {
        match self {
            EventTable::LlmTraces => "llm_traces",
            EventTable::ErrorEvents => "error_events",
            EventTable::SystemMetrics => "system_metrics",
        }
    }

    /// Tag carried on the wire (`{"type": ..., "data": ...}`).
    pub fn wire_type(self) -> &'static str {
        match self {
            EventTable::LlmTraces => "llm_trace",
            EventTable::ErrorEvents => "error_event",
            EventTable::SystemMetrics => "system_metric",
        }
    }

    fn from_table_name(name: &str) -> Option<Self> {
        match name {
            "llm_traces" => Some(EventTable::LlmTraces),
            "error_events" => Some(EventTable::ErrorEvents),
            "system_metrics" => Some(EventTable::SystemMetrics),
            _ => None,
        }
    }
}

/// One unsynced row projected for push. `data` is the stored fields as
/// JSON, built inside SQLite; it passes to the wire unparsed.
#[derive(Debug)]
pub struct PushEvent {
    pub table: EventTable,
    pub row_id: i64,
    pub created_at: i64,
    pub trace_id: String,
    pub data: Box<RawValue>,
}

const FETCH_UNSYNCED_SQL: &str = "
SELECT table_name, id, created_at, trace_id, payload
FROM (
  SELECT 'llm_traces' AS table_name, id, created_at, trace_id,
    json_object(
      'trace_id', trace_id,
      'created_at', created_at,
      'provider', provider,
      'model', model,
      'input_text', input_text,
      'output_text', output_text,
      'prompt_tokens', prompt_tokens,
      'completion_tokens', completion_tokens,
      'total_tokens', total_tokens,
      'cost_usd', cost_usd,
      'latency_ms', latency_ms,
      'status', status,
      'error_type', error_type,
      'metadata', metadata
    ) AS payload
  FROM llm_traces WHERE synced = 0
  UNION ALL
  SELECT 'error_events' AS table_name, id, created_at, trace_id,
    json_object(
      'trace_id', trace_id,
      'created_at', created_at,
      'error_type', error_type,
      'message', message,
      'stack_trace', stack_trace,
      'severity', severity,
      'metadata', metadata
    ) AS payload
  FROM error_events WHERE synced = 0
  UNION ALL
  SELECT 'system_metrics' AS table_name, id, created_at, trace_id,
    json_object(
      'trace_id', trace_id,
      'created_at', created_at,
      'cpu_pct', cpu_pct,
      'mem_rss_bytes', mem_rss_bytes,
      'mem_available', mem_available,
      'mem_total', mem_total,
      'disk_used_bytes', disk_used_bytes,
      'disk_total_bytes', disk_total_bytes,
      'disk_free_bytes', disk_free_bytes,
      'metadata', metadata
    ) AS payload
  FROM system_metrics WHERE synced = 0
)
ORDER BY created_at ASC
LIMIT ?";

impl Store {
    /// Up to `limit` unsynced rows across the three event tables, in
    /// global `created_at` order.
    pub async fn fetch_unsynced_events(&self, limit: i64) -> Result<Vec<PushEvent>> {
        let rows = sqlx::query(FETCH_UNSYNCED_SQL)
            .bind(limit)
            .fetch_all(self.reader())
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let table_name: String = row.try_get("table_name")?;
            let table = EventTable::from_table_name(&table_name).ok_or_else(|| {
                StoreError::Io(sqlx::Error::Decode(
                    format!("unknown event table {table_name}").into(),
                ))
            })?;
            let payload: String = row.try_get("payload")?;
            let data = RawValue::from_string(payload)
                .map_err(|e| StoreError::Io(sqlx::Error::Decode(Box::new(e))))?;
            out.push(PushEvent {
                table,
                row_id: row.try_get("id")?,
                created_at: row.try_get("created_at")?,
                trace_id: row.try_get("trace_id")?,
                data,
            });
        }
        Ok(out)
    }

    /// Flip `synced` for exactly these rows and record the push attempt.
    /// A mark that matches zero rows is not an error.
    pub async fn mark_events_synced(
        &self,
        events: &[PushEvent],
        pushed_at: i64,
        duration_ms: i64,
    ) -> Result<()> {
        let mut grouped: [(EventTable, Vec<i64>); 3] = [
            (EventTable::LlmTraces, Vec::new()),
            (EventTable::ErrorEvents, Vec::new()),
            (EventTable::SystemMetrics, Vec::new()),
        ];
        for ev in events {
            for (table, ids) in grouped.iter_mut() {
                if *table == ev.table {
                    ids.push(ev.row_id);
                }
            }
        }

        let mut tx = self.writer().begin().await?;
        for (table, ids) in &grouped {
            if ids.is_empty() {
                continue;
            }
            let placeholders = vec!["?"; ids.len()].join(",");
            let sql = format!(
                "UPDATE {} SET synced = 1, pushed_at = ? WHERE id IN ({placeholders})",
                table.table_name()
            );
            let mut query = sqlx::query(&sql).bind(pushed_at);
            for id in ids {
                query = query.bind(id);
            }
            query.execute(&mut *tx).await?;
        }

        sqlx::query(
            "INSERT INTO push_log (created_at, status, events_pushed, duration_ms)
             VALUES (?, 'ok', ?, ?)",
        )
        .bind(pushed_at)
        .bind(events.len() as i64)
        .bind(duration_ms)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Unsynced row counts per table: (traces, errors, metrics).
    pub async fn pending_counts(&self) -> Result<(i64, i64, i64)> {
        let traces: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM llm_traces WHERE synced = 0")
            .fetch_one(self.reader())
            .await?;
        let errors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM error_events WHERE synced = 0")
            .fetch_one(self.reader())
            .await?;
        let metrics: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM system_metrics WHERE synced = 0")
                .fetch_one(self.reader())
                .await?;
        Ok((traces, errors, metrics))
    }
}
