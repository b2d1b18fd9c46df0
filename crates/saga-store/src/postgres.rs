use async_trait::async_trait;
use chrono::Utc;
use domain::{Aggregate, Saga, SagaEvent};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    EventEnvelope, EventId, Result, SagaId, SagaQuery, StoreError, Version, store::SagaStore,
};

/// PostgreSQL-backed saga store.
///
/// Records live in `sagas` (the full saga as JSONB plus indexed status and
/// type columns), journals in `saga_events`. Each write runs in a single
/// transaction.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_saga(row: PgRow) -> Result<Saga> {
        let record: serde_json::Value = row.try_get("record")?;
        let mut saga: Saga = serde_json::from_value(record)?;
        saga.set_version(Version::new(row.try_get("version")?));
        Ok(saga)
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            event_type: row.try_get("event_type")?,
            version: Version::new(row.try_get("version")?),
            timestamp: row.try_get("timestamp")?,
            payload: row.try_get("payload")?,
        })
    }

    fn encode(saga: &Saga, version: Version) -> Result<serde_json::Value> {
        let mut record = saga.clone();
        record.set_version(version);
        Ok(serde_json::to_value(&record)?)
    }

    async fn insert_events(
        tx: &mut Transaction<'_, Postgres>,
        saga_id: SagaId,
        base: Version,
        events: &[SagaEvent],
    ) -> Result<()> {
        for envelope in EventEnvelope::record_all(saga_id, base, events, Utc::now())? {
            sqlx::query(
                r#"
                INSERT INTO saga_events (id, saga_id, event_type, version, timestamp, payload)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(envelope.event_id.as_uuid())
            .bind(saga_id.as_uuid())
            .bind(&envelope.event_type)
            .bind(envelope.version.as_i64())
            .bind(envelope.timestamp)
            .bind(&envelope.payload)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                // Another writer appended the same version first
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_saga_version")
                {
                    return StoreError::ConcurrencyConflict {
                        saga_id,
                        expected: base,
                        actual: envelope.version,
                    };
                }
                StoreError::Database(e)
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    #[tracing::instrument(skip(self, saga, events), fields(saga_id = %saga.id()))]
    async fn create(&self, saga: &Saga, events: &[SagaEvent]) -> Result<Version> {
        let saga_id = saga.id();
        if events.is_empty() {
            return Err(StoreError::EmptyCommit(saga_id));
        }
        let version = Version::initial().advance(events.len());

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sagas (id, saga_type, status, version, record)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(saga.saga_type())
        .bind(saga.status().as_str())
        .bind(version.as_i64())
        .bind(Self::encode(saga, version)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("sagas_pkey")
            {
                return StoreError::AlreadyExists(saga_id);
            }
            StoreError::Database(e)
        })?;

        Self::insert_events(&mut tx, saga_id, Version::initial(), events).await?;

        tx.commit().await?;
        Ok(version)
    }

    #[tracing::instrument(skip(self, saga, events), fields(saga_id = %saga.id()))]
    async fn commit(
        &self,
        saga: &Saga,
        events: &[SagaEvent],
        expected: Version,
    ) -> Result<Version> {
        let saga_id = saga.id();
        if events.is_empty() {
            return Err(StoreError::EmptyCommit(saga_id));
        }
        let version = expected.advance(events.len());

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE sagas
            SET status = $2, version = $3, record = $4, updated_at = NOW()
            WHERE id = $1 AND version = $5
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(saga.status().as_str())
        .bind(version.as_i64())
        .bind(Self::encode(saga, version)?)
        .bind(expected.as_i64())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM sagas WHERE id = $1")
                .bind(saga_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;

            return Err(match actual {
                None => StoreError::NotFound(saga_id),
                Some(actual) => StoreError::ConcurrencyConflict {
                    saga_id,
                    expected,
                    actual: Version::new(actual),
                },
            });
        }

        Self::insert_events(&mut tx, saga_id, expected, events).await?;

        tx.commit().await?;
        Ok(version)
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<Saga>> {
        let row: Option<PgRow> = sqlx::query("SELECT version, record FROM sagas WHERE id = $1")
            .bind(saga_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn events(&self, saga_id: SagaId) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(
            r#"
            SELECT id, saga_id, event_type, version, timestamp, payload
            FROM saga_events
            WHERE saga_id = $1
            ORDER BY version ASC
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn list(&self, query: SagaQuery) -> Result<Vec<Saga>> {
        let mut sql = String::from("SELECT version, record FROM sagas WHERE 1=1");
        let mut param_count = 0;

        if !query.statuses.is_empty() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ANY(${param_count})"));
        }
        if query.saga_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND saga_type = ${param_count}"));
        }

        sql.push_str(" ORDER BY created_at ASC, id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if !query.statuses.is_empty() {
            let statuses: Vec<String> = query
                .statuses
                .iter()
                .map(|status| status.as_str().to_string())
                .collect();
            sqlx_query = sqlx_query.bind(statuses);
        }
        if let Some(saga_type) = query.saga_type {
            sqlx_query = sqlx_query.bind(saga_type);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_saga).collect()
    }
}
