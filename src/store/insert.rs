//! Batched insert path plus the small read queries used by the health
//! surface and tests.

use super::{Result, Store};

/// One row destined for `llm_traces`. The worker fills `trace_id` and
/// `created_at`; text fields arrive already truncated.
#[derive(Debug, Clone, Default)]
pub struct TraceInsert {
    pub trace_id: String,
    pub created_at: i64,
    pub provider: String,
    pub model: String,
    pub input_text: String,
    pub output_text: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub latency_ms: i64,
    pub status: String,
    pub error_type: String,
    pub metadata: String,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorInsert {
    pub trace_id: String,
    pub created_at: i64,
    pub error_type: String,
    pub message: String,
    pub stack_trace: String,
    pub severity: String,
    pub metadata: String,
}

#[derive(Debug, Clone, Default)]
pub struct MetricInsert {
    pub trace_id: String,
    pub created_at: i64,
    pub cpu_pct: f64,
    pub mem_rss_bytes: i64,
    pub mem_available: i64,
    pub mem_total: i64,
    pub disk_used_bytes: i64,
    pub disk_total_bytes: i64,
    pub disk_free_bytes: i64,
    pub metadata: String,
}

/// Fully materialized trace row, for test assertions.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TraceRow {
    pub trace_id: String,
    pub provider: String,
    pub model: String,
    pub input_text: String,
    pub output_text: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub latency_ms: i64,
    pub status: String,
    pub error_type: String,
    pub metadata: String,
}

impl Store {
    /// Insert all three slices inside one write transaction. Either the
    /// whole batch commits or none of it does.
    pub async fn insert_batch(
        &self,
        traces: &[TraceInsert],
        errors: &[ErrorInsert],
        metrics: &[MetricInsert],
    ) -> Result<()> {
        let mut tx = self.writer().begin().await?;

        for row in traces {
            sqlx::query(
                "INSERT INTO llm_traces (
                   trace_id, created_at, provider, model, input_text, output_text,
                   prompt_tokens, completion_tokens, total_tokens, cost_usd, latency_ms,
                   status, error_type, metadata, synced, pushed_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL)",
            )
            .bind(&row.trace_id)
            .bind(row.created_at)
            .bind(&row.provider)
            .bind(&row.model)
            .bind(&row.input_text)
            .bind(&row.output_text)
            .bind(row.prompt_tokens)
            .bind(row.completion_tokens)
            .bind(row.total_tokens)
            .bind(row.cost_usd)
            .bind(row.latency_ms)
            .bind(&row.status)
            .bind(&row.error_type)
            .bind(&row.metadata)
            .execute(&mut *tx)
            .await?;
        }

        for row in errors {
            sqlx::query(
                "INSERT INTO error_events (
                   trace_id, created_at, error_type, message, stack_trace, severity,
                   metadata, synced, pushed_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, NULL)",
            )
            .bind(&row.trace_id)
            .bind(row.created_at)
            .bind(&row.error_type)
            .bind(&row.message)
            .bind(&row.stack_trace)
            .bind(&row.severity)
            .bind(&row.metadata)
            .execute(&mut *tx)
            .await?;
        }

        for row in metrics {
            sqlx::query(
                "INSERT INTO system_metrics (
                   trace_id, created_at, cpu_pct, mem_rss_bytes, mem_available, mem_total,
                   disk_used_bytes, disk_total_bytes, disk_free_bytes, metadata, synced, pushed_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL)",
            )
            .bind(&row.trace_id)
            .bind(row.created_at)
            .bind(row.cpu_pct)
            .bind(row.mem_rss_bytes)
            .bind(row.mem_available)
            .bind(row.mem_total)
            .bind(row.disk_used_bytes)
            .bind(row.disk_total_bytes)
            .bind(row.disk_free_bytes)
            .bind(&row.metadata)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn trace_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM llm_traces")
            .fetch_one(self.reader())
            .await?)
    }

    pub async fn error_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM error_events")
            .fetch_one(self.reader())
            .await?)
    }

    pub async fn metric_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM system_metrics")
            .fetch_one(self.reader())
            .await?)
    }

    pub async fn error_count_by_type(&self, error_type: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM error_events WHERE error_type = ?")
                .bind(error_type)
                .fetch_one(self.reader())
                .await?,
        )
    }

    /// Most recently inserted trace row, nulls coalesced to empty strings.
    pub async fn latest_trace(&self) -> Result<Option<TraceRow>> {
        Ok(sqlx::query_as(
            "SELECT trace_id, provider, model,
                    COALESCE(input_text, '') AS input_text,
                    COALESCE(output_text, '') AS output_text,
                    prompt_tokens, completion_tokens, total_tokens, cost_usd, latency_ms,
                    status,
                    COALESCE(error_type, '') AS error_type,
                    COALESCE(metadata, '') AS metadata
             FROM llm_traces ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(self.reader())
        .await?)
    }

    pub async fn latest_error_message(&self) -> Result<Option<(String, String)>> {
        Ok(sqlx::query_as(
            "SELECT error_type, message FROM error_events ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(self.reader())
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::open_temp;
    use super::*;
    use crate::store::StoreError;

    fn seed_trace(id: &str, created_at: i64) -> TraceInsert {
        TraceInsert {
            trace_id: id.to_string(),
            created_at,
            provider: "anthropic".into(),
            model: "claude-sonnet-4".into(),
            status: "ok".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn batch_commits_all_three_categories() {
        let (_dir, store) = open_temp().await;

        store
            .insert_batch(
                &[seed_trace("11111111-1111-4111-8111-111111111111", 1)],
                &[ErrorInsert {
                    trace_id: "22222222-2222-4222-8222-222222222222".into(),
                    created_at: 2,
                    error_type: "llm_error".into(),
                    message: "rate limited".into(),
                    severity: "error".into(),
                    ..Default::default()
                }],
                &[MetricInsert {
                    trace_id: "33333333-3333-4333-8333-333333333333".into(),
                    created_at: 3,
                    cpu_pct: 12.5,
                    ..Default::default()
                }],
            )
            .await
            .unwrap();

        assert_eq!(store.trace_count().await.unwrap(), 1);
        assert_eq!(store.error_count().await.unwrap(), 1);
        assert_eq!(store.metric_count().await.unwrap(), 1);

        let row = store.latest_trace().await.unwrap().unwrap();
        assert_eq!(row.provider, "anthropic");
        assert_eq!(row.model, "claude-sonnet-4");

        let (etype, msg) = store.latest_error_message().await.unwrap().unwrap();
        assert_eq!(etype, "llm_error");
        assert_eq!(msg, "rate limited");
    }

    #[tokio::test]
    async fn duplicate_trace_id_rolls_back_whole_batch() {
        let (_dir, store) = open_temp().await;
        let dup = "44444444-4444-4444-8444-444444444444";

        store
            .insert_batch(&[seed_trace(dup, 1)], &[], &[])
            .await
            .unwrap();

        let err = store
            .insert_batch(&[seed_trace("55555555-5555-4555-8555-555555555555", 2), seed_trace(dup, 3)], &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // The non-conflicting row must not have survived the rollback.
        assert_eq!(store.trace_count().await.unwrap(), 1);
    }
}
