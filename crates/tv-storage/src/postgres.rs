use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::info;
use tv_core::{
    AffirmativeAction, IngestionRunLog, NewRunLog, NewTender, RunStatus, TenderRecord, TriggerKind,
    SAMPLE_SOURCE,
};

use crate::store::{StoreError, TenderStore};

/// Rows per INSERT statement; keeps bind parameters under the Postgres limit.
const UPSERT_CHUNK: usize = 1000;

const TENDER_COLUMNS: &str = "id, natural_key, tender_no, title, procuring_entity, description, category, location, \
     deadline, source, contact_info, tender_url, requirements, affirmative_action, points_required, \
     created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgTenderStore {
    pool: PgPool,
}

impl PgTenderStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn tender_from_row(row: &PgRow) -> Result<TenderRecord, StoreError> {
    let affirmative: Option<JsonValue> = row.try_get("affirmative_action")?;
    let points: i32 = row.try_get("points_required")?;
    Ok(TenderRecord {
        id: row.try_get("id")?,
        natural_key: row.try_get("natural_key")?,
        tender_no: row.try_get("tender_no")?,
        title: row.try_get("title")?,
        procuring_entity: row.try_get("procuring_entity")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        location: row.try_get("location")?,
        deadline: row.try_get("deadline")?,
        source: row.try_get("source")?,
        contact_info: row.try_get("contact_info")?,
        tender_url: row.try_get("tender_url")?,
        requirements: row.try_get("requirements")?,
        affirmative_action: affirmative
            .as_ref()
            .map(AffirmativeAction::from_json)
            .unwrap_or_default(),
        points_required: u32::try_from(points).unwrap_or(0),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_log_from_row(row: &PgRow) -> Result<IngestionRunLog, StoreError> {
    let status: String = row.try_get("status")?;
    let trigger: String = row.try_get("trigger")?;
    let found: i32 = row.try_get("records_found")?;
    let inserted: i32 = row.try_get("records_inserted")?;
    Ok(IngestionRunLog {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        status: RunStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
            table: "ingestion_runs",
            message: format!("unknown status {status}"),
        })?,
        records_found: u32::try_from(found).unwrap_or(0),
        records_inserted: u32::try_from(inserted).unwrap_or(0),
        error_message: row.try_get("error_message")?,
        trigger: TriggerKind::parse(&trigger),
        created_at: row.try_get("created_at")?,
    })
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl TenderStore for PgTenderStore {
    async fn upsert_tenders(&self, tenders: &[NewTender]) -> Result<u64, StoreError> {
        if tenders.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;
        for chunk in tenders.chunks(UPSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO tenders (id, natural_key, tender_no, title, procuring_entity, description, category, location, \
                 deadline, source, contact_info, tender_url, requirements, affirmative_action, points_required) ",
            );
            qb.push_values(chunk, |mut b, t| {
                b.push_bind(t.id())
                    .push_bind(&t.natural_key)
                    .push_bind(&t.tender_no)
                    .push_bind(&t.title)
                    .push_bind(&t.procuring_entity)
                    .push_bind(&t.description)
                    .push_bind(&t.category)
                    .push_bind(&t.location)
                    .push_bind(t.deadline)
                    .push_bind(&t.source)
                    .push_bind(&t.contact_info)
                    .push_bind(&t.tender_url)
                    .push_bind(&t.requirements)
                    .push_bind(t.affirmative_action.to_json())
                    .push_bind(to_i32(t.points_required));
            });
            qb.push(
                " ON CONFLICT (natural_key) DO UPDATE SET \
                 tender_no = EXCLUDED.tender_no, \
                 title = EXCLUDED.title, \
                 procuring_entity = EXCLUDED.procuring_entity, \
                 description = EXCLUDED.description, \
                 category = EXCLUDED.category, \
                 location = EXCLUDED.location, \
                 deadline = EXCLUDED.deadline, \
                 source = EXCLUDED.source, \
                 contact_info = EXCLUDED.contact_info, \
                 tender_url = EXCLUDED.tender_url, \
                 requirements = EXCLUDED.requirements, \
                 affirmative_action = EXCLUDED.affirmative_action, \
                 points_required = EXCLUDED.points_required, \
                 updated_at = NOW()",
            );
            affected += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn latest_tenders(&self, limit: usize) -> Result<Vec<TenderRecord>, StoreError> {
        let sql = format!(
            "SELECT {TENDER_COLUMNS} FROM tenders WHERE source <> $1 \
             ORDER BY created_at DESC, natural_key ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(SAMPLE_SOURCE)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(tender_from_row).collect()
    }

    async fn count_tenders(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenders WHERE source <> $1")
            .bind(SAMPLE_SOURCE)
            .fetch_one(&self.pool)
            .await?;
        Ok(to_u64(count))
    }

    async fn count_created_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tenders WHERE source <> $1 AND created_at >= $2",
        )
        .bind(SAMPLE_SOURCE)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(to_u64(count))
    }

    async fn counts_by_source(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let rows = sqlx::query(
            "SELECT source, COUNT(*) AS n FROM tenders WHERE source <> $1 GROUP BY source",
        )
        .bind(SAMPLE_SOURCE)
        .fetch_all(&self.pool)
        .await?;
        let mut out = BTreeMap::new();
        for row in rows {
            let source: String = row.try_get("source")?;
            let n: i64 = row.try_get("n")?;
            out.insert(source, to_u64(n));
        }
        Ok(out)
    }

    async fn append_run_log(&self, log: NewRunLog) -> Result<IngestionRunLog, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO ingestion_runs (source, status, records_found, records_inserted, error_message, trigger)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, source, status, records_found, records_inserted, error_message, trigger, created_at
            "#,
        )
        .bind(&log.source)
        .bind(log.status.as_str())
        .bind(to_i32(log.records_found))
        .bind(to_i32(log.records_inserted))
        .bind(&log.error_message)
        .bind(log.trigger.as_str())
        .fetch_one(&self.pool)
        .await?;
        run_log_from_row(&row)
    }

    async fn recent_run_logs(&self, limit: usize) -> Result<Vec<IngestionRunLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source, status, records_found, records_inserted, error_message, trigger, created_at
              FROM ingestion_runs
             ORDER BY created_at DESC, id DESC
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_log_from_row).collect()
    }

    async fn latest_run_log_for(&self, source: &str) -> Result<Option<IngestionRunLog>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, source, status, records_found, records_inserted, error_message, trigger, created_at
              FROM ingestion_runs
             WHERE source = $1
             ORDER BY created_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_log_from_row).transpose()
    }

    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM tenders WHERE deadline IS NOT NULL AND deadline < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
