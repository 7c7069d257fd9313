//! PostgreSQL store backend.
//!
//! Runtime-checked sqlx queries; conditional status updates guard against
//! lost updates from racing writers (retry fire vs recovery resume).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use crate::config::DatabaseConfig;
use crate::error::{Result, SchedulerError};
use crate::job::JobStatus;
use crate::store::{InstanceRecord, InstanceStore, RegistrationRecord, StepRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS replication_instance (
    instance_id     TEXT PRIMARY KEY,
    policy_id       TEXT NOT NULL,
    status          TEXT NOT NULL,
    current_offset  INT  NOT NULL DEFAULT 0,
    start_time      TIMESTAMPTZ,
    end_time        TIMESTAMPTZ,
    message         TEXT,
    deletion_time   TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_replication_instance_policy
    ON replication_instance (policy_id);
CREATE INDEX IF NOT EXISTS idx_replication_instance_status
    ON replication_instance (status);

CREATE TABLE IF NOT EXISTS replication_step (
    instance_id     TEXT NOT NULL,
    step_offset     INT  NOT NULL,
    status          TEXT NOT NULL,
    run_count       INT  NOT NULL DEFAULT 0,
    start_time      TIMESTAMPTZ,
    end_time        TIMESTAMPTZ,
    message         TEXT,
    context_data    TEXT,
    deletion_time   TIMESTAMPTZ,
    PRIMARY KEY (instance_id, step_offset)
);

CREATE TABLE IF NOT EXISTS scheduler_registration (
    policy_id   TEXT PRIMARY KEY,
    payload     TEXT NOT NULL,
    run_counter BIGINT NOT NULL DEFAULT 0,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// sqlx-backed [`InstanceStore`].
pub struct PgInstanceStore {
    pool: PgPool,
}

impl PgInstanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect per configuration and ensure the schema exists.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool)
            .connect(&config.url)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Create tables and indexes if absent.
    pub async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn instance_from_row(row: &sqlx::postgres::PgRow) -> Result<InstanceRecord> {
        Ok(InstanceRecord {
            instance_id: row.try_get("instance_id")?,
            policy_id: row.try_get("policy_id")?,
            status: parse_status(row.try_get::<String, _>("status")?)?,
            current_offset: row.try_get::<i32, _>("current_offset")? as u32,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            message: row.try_get("message")?,
            deletion_time: row.try_get("deletion_time")?,
        })
    }

    fn step_from_row(row: &sqlx::postgres::PgRow) -> Result<StepRecord> {
        Ok(StepRecord {
            instance_id: row.try_get("instance_id")?,
            offset: row.try_get::<i32, _>("step_offset")? as u32,
            status: parse_status(row.try_get::<String, _>("status")?)?,
            run_count: row.try_get::<i32, _>("run_count")? as u32,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            message: row.try_get("message")?,
            context_data: row.try_get("context_data")?,
            deletion_time: row.try_get("deletion_time")?,
        })
    }
}

fn parse_status(raw: String) -> Result<JobStatus> {
    JobStatus::from_str(&raw).map_err(SchedulerError::Store)
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    async fn insert_instance(&self, record: InstanceRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO replication_instance \
             (instance_id, policy_id, status, current_offset, start_time, end_time, message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&record.instance_id)
        .bind(&record.policy_id)
        .bind(record.status.to_string())
        .bind(record.current_offset as i32)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(&record.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_steps(&self, steps: Vec<StepRecord>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for step in steps {
            sqlx::query(
                "INSERT INTO replication_step \
                 (instance_id, step_offset, status, run_count, message, context_data) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&step.instance_id)
            .bind(step.offset as i32)
            .bind(step.status.to_string())
            .bind(step.run_count as i32)
            .bind(&step.message)
            .bind(&step.context_data)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let row = sqlx::query("SELECT * FROM replication_instance WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::instance_from_row(&r)).transpose()
    }

    async fn get_step(&self, instance_id: &str, offset: u32) -> Result<Option<StepRecord>> {
        let row = sqlx::query(
            "SELECT * FROM replication_step WHERE instance_id = $1 AND step_offset = $2",
        )
        .bind(instance_id)
        .bind(offset as i32)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::step_from_row(&r)).transpose()
    }

    async fn mark_instance_running(
        &self,
        instance_id: &str,
        start_time: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE replication_instance SET status = 'RUNNING', start_time = $2 \
             WHERE instance_id = $1 AND status = 'SUBMITTED'",
        )
        .bind(instance_id)
        .bind(start_time)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_instance_offset(&self, instance_id: &str, offset: u32) -> Result<()> {
        sqlx::query("UPDATE replication_instance SET current_offset = $2 WHERE instance_id = $1")
            .bind(instance_id)
            .bind(offset as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_instance(
        &self,
        instance_id: &str,
        status: JobStatus,
        end_time: DateTime<Utc>,
        message: Option<String>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE replication_instance \
             SET status = $2, end_time = $3, message = $4 \
             WHERE instance_id = $1 AND status IN ('SUBMITTED', 'RUNNING')",
        )
        .bind(instance_id)
        .bind(status.to_string())
        .bind(end_time)
        .bind(&message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_step_running(
        &self,
        instance_id: &str,
        offset: u32,
        start_time: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE replication_step SET status = 'RUNNING', start_time = $3 \
             WHERE instance_id = $1 AND step_offset = $2 \
                   AND status IN ('SUBMITTED', 'RUNNING')",
        )
        .bind(instance_id)
        .bind(offset as i32)
        .bind(start_time)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_step_message(
        &self,
        instance_id: &str,
        offset: u32,
        message: String,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE replication_step SET message = $3 \
             WHERE instance_id = $1 AND step_offset = $2",
        )
        .bind(instance_id)
        .bind(offset as i32)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_step(
        &self,
        instance_id: &str,
        offset: u32,
        status: JobStatus,
        end_time: DateTime<Utc>,
        message: Option<String>,
        context_data: Option<String>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE replication_step \
             SET status = $3, end_time = $4, \
                 message = COALESCE($5, message), \
                 context_data = COALESCE($6, context_data) \
             WHERE instance_id = $1 AND step_offset = $2 \
                   AND status IN ('SUBMITTED', 'RUNNING')",
        )
        .bind(instance_id)
        .bind(offset as i32)
        .bind(status.to_string())
        .bind(end_time)
        .bind(&message)
        .bind(&context_data)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_remaining_steps(
        &self,
        instance_id: &str,
        status: JobStatus,
        end_time: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE replication_step SET status = $2, end_time = $3 \
             WHERE instance_id = $1 AND status = 'SUBMITTED'",
        )
        .bind(instance_id)
        .bind(status.to_string())
        .bind(end_time)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn increment_step_run_count(&self, instance_id: &str, offset: u32) -> Result<u32> {
        let row = sqlx::query(
            "UPDATE replication_step SET run_count = run_count + 1 \
             WHERE instance_id = $1 AND step_offset = $2 \
             RETURNING run_count",
        )
        .bind(instance_id)
        .bind(offset as i32)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SchedulerError::Store(format!("no such step: {instance_id}/{offset}")))?;
        Ok(row.try_get::<i32, _>("run_count")? as u32)
    }

    async fn find_instances_by_status(&self, status: JobStatus) -> Result<Vec<InstanceRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM replication_instance \
             WHERE status = $1 AND deletion_time IS NULL \
             ORDER BY instance_id",
        )
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::instance_from_row).collect()
    }

    async fn retire_instance(
        &self,
        instance_id: &str,
        deletion_time: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE replication_instance SET status = 'DELETED', deletion_time = $2 \
             WHERE instance_id = $1 AND deletion_time IS NULL",
        )
        .bind(instance_id)
        .bind(deletion_time)
        .execute(&mut *tx)
        .await?;
        let retired = result.rows_affected() > 0;
        if retired {
            sqlx::query("UPDATE replication_step SET deletion_time = $2 WHERE instance_id = $1")
                .bind(instance_id)
                .bind(deletion_time)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(retired)
    }

    async fn purge_retired(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM replication_step WHERE instance_id IN \
             (SELECT instance_id FROM replication_instance WHERE deletion_time < $1)",
        )
        .bind(older_than)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM replication_instance WHERE deletion_time < $1")
            .bind(older_than)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn save_registration(&self, policy_id: &str, payload: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO scheduler_registration (policy_id, payload) VALUES ($1, $2) \
             ON CONFLICT (policy_id) DO UPDATE SET payload = EXCLUDED.payload",
        )
        .bind(policy_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_registration(&self, policy_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduler_registration WHERE policy_id = $1")
            .bind(policy_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_registrations(&self) -> Result<Vec<RegistrationRecord>> {
        let rows =
            sqlx::query("SELECT policy_id, payload FROM scheduler_registration ORDER BY policy_id")
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| {
                Ok(RegistrationRecord {
                    policy_id: row.try_get("policy_id")?,
                    payload: row.try_get("payload")?,
                })
            })
            .collect()
    }

    async fn next_run_count(&self, policy_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "UPDATE scheduler_registration SET run_counter = run_counter + 1 \
             WHERE policy_id = $1 \
             RETURNING run_counter",
        )
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SchedulerError::Store(format!("policy is not registered: {policy_id}")))?;
        Ok(row.try_get("run_counter")?)
    }
}
