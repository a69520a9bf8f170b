use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fts_core::{DataMode, FundingRecord};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Postgres rejects statements with more bind parameters than this.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{found} record cannot be written to the {expected} table")]
    ModeMismatch { expected: DataMode, found: DataMode },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub deleted: u64,
    pub inserted: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: i64,
    pub utc_created: DateTime<Utc>,
    pub utc_updated: DateTime<Utc>,
    pub record: FundingRecord,
}

/// Persistence seam for the three funding tables.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Creates the tables and indexes if they do not exist yet.
    async fn migrate(&self) -> Result<(), StoreError>;

    /// Removes every row from every table.
    async fn clear(&self) -> Result<(), StoreError>;

    async fn insert_records(
        &self,
        mode: DataMode,
        records: &[FundingRecord],
    ) -> Result<u64, StoreError>;

    /// Deletes rows whose key column matches any of `keys`, then inserts
    /// `records`, as one unit of work.
    async fn replace_records(
        &self,
        mode: DataMode,
        keys: &[String],
        records: &[FundingRecord],
    ) -> Result<ReplaceOutcome, StoreError>;

    async fn count(&self, mode: DataMode) -> Result<u64, StoreError>;
}

fn ensure_mode(mode: DataMode, records: &[FundingRecord]) -> Result<(), StoreError> {
    match records.iter().find(|r| r.mode() != mode) {
        Some(record) => Err(StoreError::ModeMismatch {
            expected: mode,
            found: record.mode(),
        }),
        None => Ok(()),
    }
}

fn columns_for(mode: DataMode) -> &'static [&'static str] {
    match mode {
        DataMode::Emergency => &[
            "emergency_id",
            "emergency_name",
            "countries",
            "year",
            "funding",
            "requirement",
            "coverage",
        ],
        DataMode::Appeal => &[
            "emergency_id",
            "emergency_name",
            "countries",
            "year",
            "appeal_id",
            "appeal_name",
            "funding_type",
            "funding",
            "requirement",
            "coverage",
        ],
        DataMode::Cluster => &[
            "emergency_id",
            "emergency_name",
            "countries",
            "year",
            "appeal_id",
            "appeal_name",
            "funding_type",
            "cluster",
            "funding",
            "requirement",
            "coverage",
        ],
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_in(
        tx: &mut Transaction<'_, Postgres>,
        mode: DataMode,
        records: &[FundingRecord],
    ) -> Result<u64, StoreError> {
        let columns = columns_for(mode);
        let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);
        let mut inserted = 0u64;

        for batch in records.chunks(rows_per_statement) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} ({}) ",
                mode.table_name(),
                columns.join(", ")
            ));
            qb.push_values(batch, |mut b, record| {
                let base = record.base();
                b.push_bind(base.emergency_id.clone())
                    .push_bind(base.emergency_name.clone())
                    .push_bind(base.countries.clone())
                    .push_bind(base.year.clone());
                if let Some(appeal) = record.appeal() {
                    b.push_bind(appeal.appeal_id.clone())
                        .push_bind(appeal.appeal_name.clone())
                        .push_bind(appeal.funding_type.clone());
                }
                if let Some(cluster) = record.cluster() {
                    b.push_bind(cluster.to_string());
                }
                let requirement = record.requirement();
                b.push_bind(requirement.funding())
                    .push_bind(requirement.requirement())
                    .push_bind(requirement.coverage());
            });
            let result = qb.build().persistent(false).execute(&mut **tx).await?;
            inserted += result.rows_affected();
        }

        Ok(inserted)
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        info!("funding tables are up to date");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("TRUNCATE TABLE emergency, appeal, cluster RESTART IDENTITY")
            .execute(&self.pool)
            .await?;
        info!("cleared funding tables");
        Ok(())
    }

    async fn insert_records(
        &self,
        mode: DataMode,
        records: &[FundingRecord],
    ) -> Result<u64, StoreError> {
        ensure_mode(mode, records)?;
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let inserted = Self::insert_in(&mut tx, mode, records).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn replace_records(
        &self,
        mode: DataMode,
        keys: &[String],
        records: &[FundingRecord],
    ) -> Result<ReplaceOutcome, StoreError> {
        ensure_mode(mode, records)?;
        let mut tx = self.pool.begin().await?;

        let deleted = if keys.is_empty() {
            0
        } else {
            let sql = format!(
                "DELETE FROM {} WHERE {} = ANY($1)",
                mode.table_name(),
                mode.key_column()
            );
            sqlx::query(&sql)
                .bind(keys)
                .execute(&mut *tx)
                .await?
                .rows_affected()
        };
        let inserted = Self::insert_in(&mut tx, mode, records).await?;

        tx.commit().await?;
        Ok(ReplaceOutcome { deleted, inserted })
    }

    async fn count(&self, mode: DataMode) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", mode.table_name());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }
}

#[derive(Debug, Default)]
struct MemoryTables {
    next_id: i64,
    rows: HashMap<DataMode, Vec<StoredRow>>,
}

impl MemoryTables {
    fn append(&mut self, mode: DataMode, records: &[FundingRecord]) -> u64 {
        let now = Utc::now();
        let table = self.rows.entry(mode).or_default();
        for record in records {
            self.next_id += 1;
            table.push(StoredRow {
                id: self.next_id,
                utc_created: now,
                utc_updated: now,
                record: record.clone(),
            });
        }
        records.len() as u64
    }
}

/// Process-local store with the same contract as [`PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a table in insertion order.
    pub async fn rows(&self, mode: DataMode) -> Vec<StoredRow> {
        let tables = self.tables.lock().await;
        tables.rows.get(&mode).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        for mode in DataMode::ALL {
            tables.rows.entry(mode).or_default();
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.rows.values_mut().for_each(Vec::clear);
        tables.next_id = 0;
        Ok(())
    }

    async fn insert_records(
        &self,
        mode: DataMode,
        records: &[FundingRecord],
    ) -> Result<u64, StoreError> {
        ensure_mode(mode, records)?;
        let mut tables = self.tables.lock().await;
        Ok(tables.append(mode, records))
    }

    async fn replace_records(
        &self,
        mode: DataMode,
        keys: &[String],
        records: &[FundingRecord],
    ) -> Result<ReplaceOutcome, StoreError> {
        ensure_mode(mode, records)?;
        let keys: HashSet<&str> = keys.iter().map(String::as_str).collect();
        let mut tables = self.tables.lock().await;
        let table = tables.rows.entry(mode).or_default();
        let before = table.len();
        table.retain(|row| !keys.contains(row.record.identity_key()));
        let deleted = (before - table.len()) as u64;
        let inserted = tables.append(mode, records);
        Ok(ReplaceOutcome { deleted, inserted })
    }

    async fn count(&self, mode: DataMode) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.rows.get(&mode).map_or(0, |rows| rows.len() as u64))
    }
}
