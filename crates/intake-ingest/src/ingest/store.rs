//! PostgreSQL destination for subject records

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::{debug, instrument};

use super::models::SubjectRecord;
use super::writer::SubjectStore;
use crate::error::IngestResult;

/// Columns bound per record in the bulk upsert
pub const BIND_COLUMNS: usize = 6;

/// Largest batch a single statement can bind (Postgres allows 65535 parameters)
pub const MAX_BATCH_SIZE: usize = u16::MAX as usize / BIND_COLUMNS;

/// A stored row, including the bookkeeping timestamps
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSubject {
    #[sqlx(flatten)]
    pub record: SubjectRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PgSubjectStore {
    pool: PgPool,
}

impl PgSubjectStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> IngestResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM subjects")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn find(&self, subject_id: &str) -> IngestResult<Option<StoredSubject>> {
        let row = sqlx::query_as::<_, StoredSubject>(
            r#"
            SELECT subject_id, email, monthly_income, credit_score,
                   employment_status, age, created_at, updated_at
            FROM subjects
            WHERE subject_id = $1
            "#,
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

/// Keep only the last occurrence of each key, preserving arrival order
///
/// A single `INSERT ... ON CONFLICT DO UPDATE` may not touch the same row
/// twice, so duplicates inside one batch collapse to the latest values.
fn last_per_key(records: &[SubjectRecord]) -> Vec<&SubjectRecord> {
    let last: HashMap<&str, usize> = records
        .iter()
        .enumerate()
        .map(|(index, record)| (record.subject_id.as_str(), index))
        .collect();

    records
        .iter()
        .enumerate()
        .filter(|(index, record)| last.get(record.subject_id.as_str()) == Some(index))
        .map(|(_, record)| record)
        .collect()
}

#[async_trait]
impl SubjectStore for PgSubjectStore {
    #[instrument(skip_all, fields(batch_size = records.len()))]
    async fn upsert_batch(&self, records: &[SubjectRecord]) -> IngestResult<()> {
        let rows = last_per_key(records);
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"
            INSERT INTO subjects (
                subject_id,
                email,
                monthly_income,
                credit_score,
                employment_status,
                age
            )
            "#,
        );

        query_builder.push_values(rows.iter().copied(), |mut b, record| {
            b.push_bind(&record.subject_id)
                .push_bind(&record.email)
                .push_bind(&record.monthly_income)
                .push_bind(record.credit_score)
                .push_bind(&record.employment_status)
                .push_bind(record.age);
        });

        query_builder.push(
            r#"
            ON CONFLICT (subject_id)
            DO UPDATE SET
                email = EXCLUDED.email,
                monthly_income = EXCLUDED.monthly_income,
                credit_score = EXCLUDED.credit_score,
                employment_status = EXCLUDED.employment_status,
                age = EXCLUDED.age,
                updated_at = NOW()
            "#,
        );

        let result = query_builder.build().execute(&mut *tx).await?;
        tx.commit().await?;

        debug!(
            rows_affected = result.rows_affected(),
            collapsed = records.len() - rows.len(),
            "Upserted subject batch"
        );

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use sqlx::types::BigDecimal;

    fn record(id: &str, email: &str) -> SubjectRecord {
        SubjectRecord {
            subject_id: id.to_string(),
            email: email.to_string(),
            monthly_income: BigDecimal::from(4200_i64),
            credit_score: 710,
            employment_status: "employed".to_string(),
            age: 41,
        }
    }

    #[test]
    fn test_max_batch_size_fits_bind_limit() {
        assert!(MAX_BATCH_SIZE * BIND_COLUMNS <= 65_535);
        assert!(5000 <= MAX_BATCH_SIZE);
    }

    #[test]
    fn test_last_per_key_keeps_latest_values() {
        let records = vec![
            record("U1", "first@x.com"),
            record("U2", "other@x.com"),
            record("U1", "second@x.com"),
        ];

        let rows = last_per_key(&records);
        let emails: Vec<&str> = rows.iter().map(|r| r.email.as_str()).collect();
        assert_eq!(emails, vec!["other@x.com", "second@x.com"]);
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore] // Requires a PostgreSQL instance via DATABASE_URL
    async fn test_upsert_inserts_then_overwrites(pool: PgPool) {
        let store = PgSubjectStore::new(pool);

        store.upsert_batch(&[record("U1", "a@x.com"), record("U2", "b@x.com")]).await.unwrap();
        let before = store.find("U1").await.unwrap().unwrap();

        store.upsert_batch(&[record("U1", "changed@x.com")]).await.unwrap();
        let after = store.find("U1").await.unwrap().unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(after.record.email, "changed@x.com");
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at >= before.updated_at);
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore] // Requires a PostgreSQL instance via DATABASE_URL
    async fn test_duplicate_keys_in_one_batch(pool: PgPool) {
        let store = PgSubjectStore::new(pool);

        store
            .upsert_batch(&[record("U9", "old@x.com"), record("U9", "new@x.com")])
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.find("U9").await.unwrap().unwrap().record.email, "new@x.com");
    }
}
