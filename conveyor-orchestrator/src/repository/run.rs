//! Run Repository
//!
//! Storage of pipeline runs. The coordinator writes the whole run after
//! every transition, so a store only needs insert/update/read.

use async_trait::async_trait;
use conveyor_core::domain::run::PipelineRun;
use sqlx::PgPool;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored run is unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("run {0} not found")]
    NotFound(Uuid),
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn insert(&self, run: &PipelineRun) -> Result<(), RepositoryError>;

    async fn update(&self, run: &PipelineRun) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PipelineRun>, RepositoryError>;

    /// All runs, most recent first
    async fn list_all(&self) -> Result<Vec<PipelineRun>, RepositoryError>;
}

#[derive(Default)]
pub struct InMemoryRunRepository {
    runs: RwLock<HashMap<Uuid, PipelineRun>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn insert(&self, run: &PipelineRun) -> Result<(), RepositoryError> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn update(&self, run: &PipelineRun) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().await;
        let slot = runs.get_mut(&run.id).ok_or(RepositoryError::NotFound(run.id))?;
        *slot = run.clone();
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PipelineRun>, RepositoryError> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<PipelineRun>, RepositoryError> {
        let mut runs: Vec<_> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}

/// Postgres-backed store; the run body is kept as JSONB next to a few
/// indexed columns
pub struct PgRunRepository {
    pool: PgPool,
}

impl PgRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    body: serde_json::Value,
}

impl TryFrom<RunRow> for PipelineRun {
    type Error = serde_json::Error;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        serde_json::from_value(row.body)
    }
}

#[async_trait]
impl RunRepository for PgRunRepository {
    async fn insert(&self, run: &PipelineRun) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (id, kind, status, started_at, ended_at, body)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.id)
        .bind(run.kind.to_string())
        .bind(run.status.to_string())
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(serde_json::to_value(run)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, run: &PipelineRun) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = $2, ended_at = $3, body = $4
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.status.to_string())
        .bind(run.ended_at)
        .bind(serde_json::to_value(run)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(run.id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PipelineRun>, RepositoryError> {
        let row = sqlx::query_as::<_, RunRow>("SELECT body FROM pipeline_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(PipelineRun::try_from).transpose()?)
    }

    async fn list_all(&self) -> Result<Vec<PipelineRun>, RepositoryError> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT body FROM pipeline_runs ORDER BY started_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(PipelineRun::try_from)
            .collect::<Result<_, _>>()?)
    }
}
