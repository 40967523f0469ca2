use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Executor, PgPool, Row};
use std::collections::BTreeMap;

use crate::model::{
    Branch, ContainerEdge, ContainerType, EdgeCursor, EdgeKey, FieldContainer, FieldValue, Id, JobError,
    JobFilter, JobKind, JobStatus, MigrationJob, SchemaChange, SchemaDefinition, SchemaKind, SchemaVersion,
};
use crate::store::traits::{BranchStore, ContainerStore, JobStore, SchemaVersionStore, Store};

const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_versions (
    id          TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    name        TEXT NOT NULL,
    version     INTEGER NOT NULL,
    definition  JSONB NOT NULL,
    previous    TEXT,
    next        TEXT,
    changes     JSONB NOT NULL DEFAULT '[]',
    created_at  TIMESTAMPTZ NOT NULL,
    UNIQUE (kind, name, version)
);

CREATE TABLE IF NOT EXISTS branches (
    id                    TEXT PRIMARY KEY,
    project_id            TEXT NOT NULL,
    name                  TEXT NOT NULL,
    created_at            TIMESTAMPTZ NOT NULL,
    base_branch_id        TEXT,
    latest                BOOLEAN NOT NULL DEFAULT FALSE,
    migrated              BOOLEAN NOT NULL DEFAULT FALSE,
    auto_purge            BOOLEAN NOT NULL DEFAULT FALSE,
    schema_versions       JSONB NOT NULL DEFAULT '{}',
    microschema_versions  JSONB NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS migration_jobs (
    seq         BIGSERIAL,
    id          TEXT PRIMARY KEY,
    scope       TEXT NOT NULL,
    job_type    TEXT NOT NULL,
    branch_id   TEXT,
    kind        JSONB NOT NULL,
    status      TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    started_at  TIMESTAMPTZ,
    stopped_at  TIMESTAMPTZ,
    error       JSONB,
    retry_of    TEXT
);
CREATE INDEX IF NOT EXISTS migration_jobs_status_seq ON migration_jobs (status, seq);

CREATE TABLE IF NOT EXISTS field_containers (
    id                  TEXT PRIMARY KEY,
    node_id             TEXT NOT NULL,
    language            TEXT NOT NULL,
    schema_version_id   TEXT NOT NULL,
    fields              JSONB NOT NULL,
    micronode_versions  TEXT[] NOT NULL DEFAULT '{}',
    previous            TEXT,
    next                TEXT[] NOT NULL DEFAULT '{}',
    created_at          TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS field_containers_version ON field_containers (schema_version_id);

CREATE TABLE IF NOT EXISTS container_edges (
    branch_id       TEXT NOT NULL,
    node_id         TEXT NOT NULL,
    language        TEXT NOT NULL,
    container_type  TEXT NOT NULL,
    container_id    TEXT NOT NULL REFERENCES field_containers (id),
    PRIMARY KEY (branch_id, node_id, language, container_type)
);
CREATE INDEX IF NOT EXISTS container_edges_container ON container_edges (container_id);
"#;

const VERSION_COLUMNS: &str = "id, kind, name, version, definition, previous, next, changes, created_at";
const BRANCH_COLUMNS: &str = "id, project_id, name, created_at, base_branch_id, latest, migrated, auto_purge, schema_versions, microschema_versions";
const JOB_COLUMNS: &str = "id, kind, status, created_at, started_at, stopped_at, error, retry_of";
const CONTAINER_COLUMNS: &str = "c.id, c.node_id, c.language, c.schema_version_id, c.fields, c.previous, c.next, c.created_at";
const EDGE_COLUMNS: &str = "e.branch_id, e.node_id, e.language, e.container_type, e.container_id";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Create the tables if they do not exist yet
    pub async fn migrate(&self) -> Result<()> {
        self.pool
            .execute(SCHEMA_DDL)
            .await
            .context("Failed to create database tables")?;
        log::info!("Database tables ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn version_from_row(row: &PgRow) -> Result<SchemaVersion> {
    let kind: String = row.try_get("kind")?;
    let version: i32 = row.try_get("version")?;
    Ok(SchemaVersion {
        id: row.try_get("id")?,
        kind: SchemaKind::parse(&kind).ok_or_else(|| anyhow!("Unknown schema kind: {}", kind))?,
        name: row.try_get("name")?,
        version: u32::try_from(version).context("Negative schema version")?,
        definition: row.try_get::<Json<SchemaDefinition>, _>("definition")?.0,
        previous: row.try_get("previous")?,
        next: row.try_get("next")?,
        changes: row.try_get::<Json<Vec<SchemaChange>>, _>("changes")?.0,
        created_at: row.try_get("created_at")?,
    })
}

fn branch_from_row(row: &PgRow) -> Result<Branch> {
    Ok(Branch {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
        base_branch_id: row.try_get("base_branch_id")?,
        latest: row.try_get("latest")?,
        migrated: row.try_get("migrated")?,
        auto_purge: row.try_get("auto_purge")?,
        schema_versions: row.try_get::<Json<BTreeMap<String, Id>>, _>("schema_versions")?.0,
        microschema_versions: row.try_get::<Json<BTreeMap<String, Id>>, _>("microschema_versions")?.0,
    })
}

fn job_from_row(row: &PgRow) -> Result<MigrationJob> {
    let status: String = row.try_get("status")?;
    Ok(MigrationJob {
        id: row.try_get("id")?,
        kind: row.try_get::<Json<JobKind>, _>("kind")?.0,
        status: JobStatus::parse(&status).ok_or_else(|| anyhow!("Unknown job status: {}", status))?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        stopped_at: row.try_get("stopped_at")?,
        error: row.try_get::<Option<Json<JobError>>, _>("error")?.map(|error| error.0),
        retry_of: row.try_get("retry_of")?,
    })
}

fn container_from_row(row: &PgRow) -> Result<FieldContainer> {
    Ok(FieldContainer {
        id: row.try_get("id")?,
        node_id: row.try_get("node_id")?,
        language: row.try_get("language")?,
        schema_version_id: row.try_get("schema_version_id")?,
        fields: row.try_get::<Json<BTreeMap<String, FieldValue>>, _>("fields")?.0,
        previous: row.try_get("previous")?,
        next: row.try_get::<Vec<String>, _>("next")?.into_iter().collect(),
        created_at: row.try_get("created_at")?,
    })
}

fn edge_from_row(row: &PgRow) -> Result<ContainerEdge> {
    let container_type: String = row.try_get("container_type")?;
    Ok(ContainerEdge {
        branch_id: row.try_get("branch_id")?,
        node_id: row.try_get("node_id")?,
        language: row.try_get("language")?,
        container_type: ContainerType::parse(&container_type)
            .ok_or_else(|| anyhow!("Unknown container type: {}", container_type))?,
        container_id: row.try_get("container_id")?,
    })
}

/// Edge columns come first under their own names; the container is selected
/// with a `c_` prefix so both can be read from one joined row.
fn edge_and_container_from_row(row: &PgRow) -> Result<(ContainerEdge, FieldContainer)> {
    let edge = edge_from_row(row)?;
    let container = FieldContainer {
        id: row.try_get("c_id")?,
        node_id: row.try_get("c_node_id")?,
        language: row.try_get("c_language")?,
        schema_version_id: row.try_get("c_schema_version_id")?,
        fields: row.try_get::<Json<BTreeMap<String, FieldValue>>, _>("c_fields")?.0,
        previous: row.try_get("c_previous")?,
        next: row.try_get::<Vec<String>, _>("c_next")?.into_iter().collect(),
        created_at: row.try_get("c_created_at")?,
    };
    Ok((edge, container))
}

const JOINED_COLUMNS: &str = "e.branch_id, e.node_id, e.language, e.container_type, e.container_id, \
     c.id AS c_id, c.node_id AS c_node_id, c.language AS c_language, \
     c.schema_version_id AS c_schema_version_id, c.fields AS c_fields, \
     c.previous AS c_previous, c.next AS c_next, c.created_at AS c_created_at";

/// Keyset condition over `(node_id, language)` bound at `$first` and
/// `$first + 1`, with binary collation so the order matches the in-memory store
fn after_cursor(first: usize) -> String {
    let (node, language) = (first, first + 1);
    format!(
        "(${node}::text IS NULL OR (e.node_id COLLATE \"C\", e.language COLLATE \"C\") > (${node}::text COLLATE \"C\", ${language}::text COLLATE \"C\"))"
    )
}

const CURSOR_ORDER: &str = "ORDER BY e.node_id COLLATE \"C\", e.language COLLATE \"C\"";

#[async_trait::async_trait]
impl SchemaVersionStore for PostgresStore {
    async fn get_version(&self, id: &Id) -> Result<Option<SchemaVersion>> {
        let row = sqlx::query(&format!("SELECT {} FROM schema_versions WHERE id = $1", VERSION_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch schema version")?;

        row.as_ref().map(version_from_row).transpose()
    }

    async fn find_version(&self, kind: SchemaKind, name: &str, version: u32) -> Result<Option<SchemaVersion>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM schema_versions WHERE kind = $1 AND name = $2 AND version = $3",
            VERSION_COLUMNS
        ))
        .bind(kind.as_str())
        .bind(name)
        .bind(i32::try_from(version).context("Schema version out of range")?)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to find schema version")?;

        row.as_ref().map(version_from_row).transpose()
    }

    async fn get_root_version(&self, kind: SchemaKind, name: &str) -> Result<Option<SchemaVersion>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM schema_versions WHERE kind = $1 AND name = $2 AND previous IS NULL",
            VERSION_COLUMNS
        ))
        .bind(kind.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch root schema version")?;

        row.as_ref().map(version_from_row).transpose()
    }

    async fn get_latest_version(&self, kind: SchemaKind, name: &str) -> Result<Option<SchemaVersion>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM schema_versions WHERE kind = $1 AND name = $2 AND next IS NULL",
            VERSION_COLUMNS
        ))
        .bind(kind.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest schema version")?;

        row.as_ref().map(version_from_row).transpose()
    }

    async fn list_names(&self, kind: SchemaKind) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM schema_versions WHERE kind = $1 AND previous IS NULL ORDER BY name")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list schema names")?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(anyhow::Error::from))
            .collect()
    }

    async fn append_version(&self, version: SchemaVersion) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        if let Some(previous) = &version.previous {
            let linked = sqlx::query("UPDATE schema_versions SET next = $1 WHERE id = $2 AND next IS NULL")
                .bind(&version.id)
                .bind(previous)
                .execute(&mut *tx)
                .await
                .context("Failed to link previous schema version")?;
            if linked.rows_affected() == 0 {
                let exists = sqlx::query("SELECT 1 FROM schema_versions WHERE id = $1")
                    .bind(previous)
                    .fetch_optional(&mut *tx)
                    .await?
                    .is_some();
                if !exists {
                    return Err(anyhow!("Previous version not found: {}", previous));
                }
                return Ok(false);
            }
        }

        // (kind, name, 1) is unique, which also rejects a second root
        let inserted = sqlx::query(
            r#"
            INSERT INTO schema_versions (id, kind, name, version, definition, previous, next, changes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $8)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&version.id)
        .bind(version.kind.as_str())
        .bind(&version.name)
        .bind(i32::try_from(version.version).context("Schema version out of range")?)
        .bind(Json(&version.definition))
        .bind(&version.previous)
        .bind(Json(&version.changes))
        .bind(version.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert schema version")?;

        if inserted.rows_affected() == 0 {
            return Ok(false);
        }

        tx.commit().await.context("Failed to commit schema version")?;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl BranchStore for PostgresStore {
    async fn get_branch(&self, id: &Id) -> Result<Option<Branch>> {
        let row = sqlx::query(&format!("SELECT {} FROM branches WHERE id = $1", BRANCH_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch branch")?;

        row.as_ref().map(branch_from_row).transpose()
    }

    async fn list_branches(&self, project_id: Option<&Id>) -> Result<Vec<Branch>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM branches WHERE ($1::text IS NULL OR project_id = $1) ORDER BY created_at, name",
            BRANCH_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list branches")?;

        rows.iter().map(branch_from_row).collect()
    }

    async fn upsert_branch(&self, branch: Branch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO branches (id, project_id, name, created_at, base_branch_id, latest, migrated, auto_purge, schema_versions, microschema_versions)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                base_branch_id = EXCLUDED.base_branch_id,
                latest = EXCLUDED.latest,
                migrated = EXCLUDED.migrated,
                auto_purge = EXCLUDED.auto_purge,
                schema_versions = EXCLUDED.schema_versions,
                microschema_versions = EXCLUDED.microschema_versions
            "#,
        )
        .bind(&branch.id)
        .bind(&branch.project_id)
        .bind(&branch.name)
        .bind(branch.created_at)
        .bind(&branch.base_branch_id)
        .bind(branch.latest)
        .bind(branch.migrated)
        .bind(branch.auto_purge)
        .bind(Json(&branch.schema_versions))
        .bind(Json(&branch.microschema_versions))
        .execute(&self.pool)
        .await
        .context("Failed to upsert branch")?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresStore {
    async fn insert_job(&self, job: MigrationJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO migration_jobs (id, scope, job_type, branch_id, kind, status, created_at, started_at, stopped_at, error, retry_of)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&job.id)
        .bind(job.kind.scope())
        .bind(job.job_type().as_str())
        .bind(job.branch_id())
        .bind(Json(&job.kind))
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.stopped_at)
        .bind(job.error.as_ref().map(Json))
        .bind(&job.retry_of)
        .execute(&self.pool)
        .await
        .context("Failed to insert migration job")?;

        Ok(())
    }

    async fn get_job(&self, id: &Id) -> Result<Option<MigrationJob>> {
        let row = sqlx::query(&format!("SELECT {} FROM migration_jobs WHERE id = $1", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch migration job")?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<MigrationJob>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM migration_jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR job_type = $2)
              AND ($3::text IS NULL OR branch_id = $3)
            ORDER BY seq
            "#,
            JOB_COLUMNS
        ))
        .bind(filter.status.map(|status| status.as_str()))
        .bind(filter.job_type.map(|job_type| job_type.as_str()))
        .bind(&filter.branch_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list migration jobs")?;

        rows.iter().map(job_from_row).collect()
    }

    async fn claim_next_job(&self, started_at: DateTime<Utc>) -> Result<Option<MigrationJob>> {
        // A queued job is only eligible when it is the oldest queued job of its
        // scope and nothing in that scope is running. Locked rows are skipped,
        // so concurrent claimers never block on each other.
        let row = sqlx::query(&format!(
            r#"
            UPDATE migration_jobs SET status = 'started', started_at = $1
            WHERE status = 'queued' AND id = (
                SELECT j.id FROM migration_jobs j
                WHERE j.status = 'queued'
                  AND NOT EXISTS (
                      SELECT 1 FROM migration_jobs s WHERE s.scope = j.scope AND s.status = 'started'
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM migration_jobs o WHERE o.scope = j.scope AND o.status = 'queued' AND o.seq < j.seq
                  )
                ORDER BY j.seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(started_at)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim migration job")?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn finish_job(
        &self,
        id: &Id,
        status: JobStatus,
        error: Option<JobError>,
        stopped_at: DateTime<Utc>,
    ) -> Result<Option<MigrationJob>> {
        if !JobStatus::Started.can_transition_to(status) {
            return Ok(None);
        }
        let row = sqlx::query(&format!(
            r#"
            UPDATE migration_jobs SET status = $2, error = $3, stopped_at = $4
            WHERE id = $1 AND status = 'started'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(error.map(Json))
        .bind(stopped_at)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to finish migration job")?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn delete_jobs_with_status(&self, status: JobStatus) -> Result<usize> {
        let result = sqlx::query("DELETE FROM migration_jobs WHERE status = $1")
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to delete migration jobs")?;

        Ok(result.rows_affected() as usize)
    }

    async fn delete_job(&self, id: &Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM migration_jobs WHERE id = $1 AND status <> 'started'")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete migration job")?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_jobs(&self) -> Result<Option<usize>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        // Keeps claimers out until the check and the delete are done
        sqlx::query("LOCK TABLE migration_jobs IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .context("Failed to lock migration jobs")?;

        let running: bool = sqlx::query("SELECT EXISTS (SELECT 1 FROM migration_jobs WHERE status = 'started')")
            .fetch_one(&mut *tx)
            .await?
            .try_get(0)?;
        if running {
            return Ok(None);
        }

        let result = sqlx::query("DELETE FROM migration_jobs")
            .execute(&mut *tx)
            .await
            .context("Failed to clear migration jobs")?;
        tx.commit().await.context("Failed to commit job cleanup")?;

        Ok(Some(result.rows_affected() as usize))
    }
}

#[async_trait::async_trait]
impl ContainerStore for PostgresStore {
    async fn get_container(&self, id: &Id) -> Result<Option<FieldContainer>> {
        let row = sqlx::query(&format!("SELECT {} FROM field_containers c WHERE c.id = $1", CONTAINER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch field container")?;

        row.as_ref().map(container_from_row).transpose()
    }

    async fn insert_container(&self, container: FieldContainer) -> Result<()> {
        insert_container(&mut *self.pool.acquire().await?, &container).await
    }

    async fn get_edge(&self, key: &EdgeKey) -> Result<Option<ContainerEdge>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM container_edges e WHERE e.branch_id = $1 AND e.node_id = $2 AND e.language = $3 AND e.container_type = $4",
            EDGE_COLUMNS
        ))
        .bind(&key.branch_id)
        .bind(&key.node_id)
        .bind(&key.language)
        .bind(key.container_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch container edge")?;

        row.as_ref().map(edge_from_row).transpose()
    }

    async fn set_edge(&self, edge: ContainerEdge) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO container_edges (branch_id, node_id, language, container_type, container_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (branch_id, node_id, language, container_type) DO UPDATE SET
                container_id = EXCLUDED.container_id
            "#,
        )
        .bind(&edge.branch_id)
        .bind(&edge.node_id)
        .bind(&edge.language)
        .bind(edge.container_type.as_str())
        .bind(&edge.container_id)
        .execute(&self.pool)
        .await
        .context("Failed to set container edge")?;

        Ok(())
    }

    async fn list_edges(
        &self,
        branch_id: &Id,
        container_type: ContainerType,
        after: Option<&EdgeCursor>,
        limit: usize,
    ) -> Result<Vec<ContainerEdge>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM container_edges e
            WHERE e.branch_id = $1 AND e.container_type = $2 AND {}
            {} LIMIT $5
            "#,
            EDGE_COLUMNS,
            after_cursor(3),
            CURSOR_ORDER
        ))
        .bind(branch_id)
        .bind(container_type.as_str())
        .bind(after.map(|cursor| cursor.node_id.as_str()))
        .bind(after.map(|cursor| cursor.language.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list container edges")?;

        rows.iter().map(edge_from_row).collect()
    }

    async fn list_edges_at_version(
        &self,
        branch_id: &Id,
        version_id: &Id,
        container_type: ContainerType,
        after: Option<&EdgeCursor>,
        limit: usize,
    ) -> Result<Vec<(ContainerEdge, FieldContainer)>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM container_edges e
            JOIN field_containers c ON c.id = e.container_id
            WHERE e.branch_id = $1 AND e.container_type = $2 AND c.schema_version_id = $3 AND {}
            {} LIMIT $6
            "#,
            JOINED_COLUMNS,
            after_cursor(4),
            CURSOR_ORDER
        ))
        .bind(branch_id)
        .bind(container_type.as_str())
        .bind(version_id)
        .bind(after.map(|cursor| cursor.node_id.as_str()))
        .bind(after.map(|cursor| cursor.language.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list containers at version")?;

        rows.iter().map(edge_and_container_from_row).collect()
    }

    async fn list_edges_with_micronode_version(
        &self,
        branch_id: &Id,
        microschema_version_id: &Id,
        container_type: ContainerType,
        after: Option<&EdgeCursor>,
        limit: usize,
    ) -> Result<Vec<(ContainerEdge, FieldContainer)>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM container_edges e
            JOIN field_containers c ON c.id = e.container_id
            WHERE e.branch_id = $1 AND e.container_type = $2 AND $3 = ANY(c.micronode_versions) AND {}
            {} LIMIT $6
            "#,
            JOINED_COLUMNS,
            after_cursor(4),
            CURSOR_ORDER
        ))
        .bind(branch_id)
        .bind(container_type.as_str())
        .bind(microschema_version_id)
        .bind(after.map(|cursor| cursor.node_id.as_str()))
        .bind(after.map(|cursor| cursor.language.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list containers with micronode version")?;

        rows.iter().map(edge_and_container_from_row).collect()
    }

    async fn count_edges_at_version(&self, branch_id: &Id, version_id: &Id) -> Result<usize> {
        let count: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) FROM container_edges e
            JOIN field_containers c ON c.id = e.container_id
            WHERE e.branch_id = $1 AND c.schema_version_id = $2
            "#,
        )
        .bind(branch_id)
        .bind(version_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count containers at version")?
        .try_get(0)?;

        Ok(count as usize)
    }

    async fn count_edges_with_micronode_version(&self, branch_id: &Id, microschema_version_id: &Id) -> Result<usize> {
        let count: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) FROM container_edges e
            JOIN field_containers c ON c.id = e.container_id
            WHERE e.branch_id = $1 AND $2 = ANY(c.micronode_versions)
            "#,
        )
        .bind(branch_id)
        .bind(microschema_version_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count containers with micronode version")?
        .try_get(0)?;

        Ok(count as usize)
    }

    async fn count_containers_at_version(&self, version_id: &Id) -> Result<usize> {
        let count: i64 = sqlx::query("SELECT COUNT(*) FROM field_containers WHERE schema_version_id = $1")
            .bind(version_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count containers")?
            .try_get(0)?;

        Ok(count as usize)
    }

    async fn commit_successor(&self, key: &EdgeKey, successor: FieldContainer) -> Result<bool> {
        let previous_id = successor
            .previous
            .clone()
            .ok_or_else(|| anyhow!("Successor container {} has no predecessor", successor.id))?;

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let current: Option<String> = sqlx::query(
            r#"
            SELECT container_id FROM container_edges
            WHERE branch_id = $1 AND node_id = $2 AND language = $3 AND container_type = $4
            FOR UPDATE
            "#,
        )
        .bind(&key.branch_id)
        .bind(&key.node_id)
        .bind(&key.language)
        .bind(key.container_type.as_str())
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to lock container edge")?
        .map(|row| row.try_get(0))
        .transpose()?;

        if current.as_deref() != Some(previous_id.as_str()) {
            return Ok(false);
        }

        insert_container(&mut *tx, &successor).await?;

        sqlx::query("UPDATE field_containers SET next = array_append(next, $1) WHERE id = $2")
            .bind(&successor.id)
            .bind(&previous_id)
            .execute(&mut *tx)
            .await
            .context("Failed to link previous container")?;

        sqlx::query(
            r#"
            UPDATE container_edges SET container_id = $5
            WHERE branch_id = $1 AND node_id = $2 AND language = $3 AND container_type = $4
            "#,
        )
        .bind(&key.branch_id)
        .bind(&key.node_id)
        .bind(&key.language)
        .bind(key.container_type.as_str())
        .bind(&successor.id)
        .execute(&mut *tx)
        .await
        .context("Failed to repoint container edge")?;

        tx.commit().await.context("Failed to commit container successor")?;
        Ok(true)
    }

    async fn is_container_referenced(&self, id: &Id) -> Result<bool> {
        let referenced: bool = sqlx::query("SELECT EXISTS (SELECT 1 FROM container_edges WHERE container_id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check container references")?
            .try_get(0)?;

        Ok(referenced)
    }

    async fn delete_container_version(&self, id: &Id) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let referenced: bool = sqlx::query("SELECT EXISTS (SELECT 1 FROM container_edges WHERE container_id = $1)")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?
            .try_get(0)?;
        if referenced {
            return Err(anyhow!("Container {} is still referenced by a branch", id));
        }

        let removed = sqlx::query("DELETE FROM field_containers WHERE id = $1 RETURNING previous, next")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to delete container")?;
        let Some(removed) = removed else {
            return Ok(false);
        };
        let previous: Option<String> = removed.try_get("previous")?;
        let next: Vec<String> = removed.try_get("next")?;

        if let Some(previous) = &previous {
            sqlx::query("UPDATE field_containers SET next = array_cat(array_remove(next, $1), $2) WHERE id = $3")
                .bind(id)
                .bind(&next)
                .bind(previous)
                .execute(&mut *tx)
                .await
                .context("Failed to relink predecessor")?;
        }
        if !next.is_empty() {
            sqlx::query("UPDATE field_containers SET previous = $1 WHERE id = ANY($2)")
                .bind(&previous)
                .bind(&next)
                .execute(&mut *tx)
                .await
                .context("Failed to relink successors")?;
        }

        tx.commit().await.context("Failed to commit container deletion")?;
        Ok(true)
    }
}

async fn insert_container(conn: &mut sqlx::PgConnection, container: &FieldContainer) -> Result<()> {
    let micronode_versions: Vec<String> = container.micronode_versions().into_iter().collect();
    sqlx::query(
        r#"
        INSERT INTO field_containers (id, node_id, language, schema_version_id, fields, micronode_versions, previous, next, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(&container.id)
    .bind(&container.node_id)
    .bind(&container.language)
    .bind(&container.schema_version_id)
    .bind(Json(&container.fields))
    .bind(micronode_versions)
    .bind(&container.previous)
    .bind(container.next.iter().cloned().collect::<Vec<_>>())
    .bind(container.created_at)
    .execute(conn)
    .await
    .context("Failed to insert field container")?;

    Ok(())
}

impl Store for PostgresStore {}
