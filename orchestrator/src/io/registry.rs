//! Shared project registry backed by SQLite.
//!
//! Several daemon processes may open the same database file. Ownership of a
//! project is a compare-and-set on the `locked_by` column; all other writes go
//! through a single `UPDATE` per call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::core::types::{ProjectMeta, ProjectState};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS projects (
    project_id TEXT PRIMARY KEY,
    project_dir TEXT NOT NULL,
    state TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    failure_reason TEXT,
    locked_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    meta_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS projects_state_idx ON projects (state, created_at);";

const SELECT_COLUMNS: &str = "SELECT project_id, project_dir, state, retry_count, failure_reason, \
     locked_by, created_at, updated_at, meta_json FROM projects";

/// One registry row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectRecord {
    pub project_id: String,
    pub project_dir: PathBuf,
    pub state: ProjectState,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last snapshot written by `update_state` (or `register`).
    pub meta: ProjectMeta,
}

/// Row as stored, before parsing the text columns.
struct RawRecord {
    project_id: String,
    project_dir: String,
    state: String,
    retry_count: i64,
    failure_reason: Option<String>,
    locked_by: Option<String>,
    created_at: String,
    updated_at: String,
    meta_json: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project_id: row.get(0)?,
            project_dir: row.get(1)?,
            state: row.get(2)?,
            retry_count: row.get(3)?,
            failure_reason: row.get(4)?,
            locked_by: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            meta_json: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<ProjectRecord> {
        let id = self.project_id;
        let meta: ProjectMeta = serde_json::from_str(&self.meta_json)
            .with_context(|| format!("parse stored snapshot for {id}"))?;
        Ok(ProjectRecord {
            state: self
                .state
                .parse()
                .with_context(|| format!("state column for {id}"))?,
            retry_count: u32::try_from(self.retry_count)
                .map_err(|_| anyhow!("negative retry_count for {id}"))?,
            created_at: parse_timestamp(&self.created_at)
                .with_context(|| format!("created_at for {id}"))?,
            updated_at: parse_timestamp(&self.updated_at)
                .with_context(|| format!("updated_at for {id}"))?,
            project_dir: PathBuf::from(self.project_dir),
            failure_reason: self.failure_reason,
            locked_by: self.locked_by,
            meta,
            project_id: id,
        })
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    // Fixed width so lexical order in SQL matches time order.
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

/// Handle to the registry database. One per thread; open another for
/// concurrent access.
pub struct Registry {
    conn: Connection,
}

impl Registry {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create registry dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open registry {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("set registry busy timeout")?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("enable WAL journal")?;
        conn.pragma_update(None, "synchronous", "FULL")
            .context("set synchronous=FULL")?;
        conn.execute_batch(SCHEMA)
            .context("create registry schema")?;
        debug!(path = %path.display(), journal_mode = %mode, "registry opened");
        Ok(Self { conn })
    }

    /// Insert a new project row. Registering a known id is a no-op.
    pub fn register(&self, meta: &ProjectMeta, project_dir: &Path) -> Result<()> {
        let meta_json = serde_json::to_string(meta).context("serialize snapshot")?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO projects
                 (project_id, project_dir, state, retry_count, failure_reason, locked_by,
                  created_at, updated_at, meta_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8)",
                params![
                    meta.project_id,
                    project_dir.display().to_string(),
                    meta.state.as_str(),
                    meta.retry_count,
                    meta.failure_reason,
                    format_timestamp(meta.created_at),
                    format_timestamp(meta.updated_at),
                    meta_json,
                ],
            )
            .with_context(|| format!("register {}", meta.project_id))?;
        if inserted == 1 {
            info!(project_id = %meta.project_id, dir = %project_dir.display(), "project registered");
        } else {
            debug!(project_id = %meta.project_id, "project already registered");
        }
        Ok(())
    }

    /// Claim the project for `owner`. Returns `true` only if no one held it.
    pub fn try_lock(&self, project_id: &str, owner: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE projects SET locked_by = ?1 WHERE project_id = ?2 AND locked_by IS NULL",
                params![owner, project_id],
            )
            .with_context(|| format!("lock {project_id}"))?;
        let acquired = changed == 1;
        debug!(project_id, owner, acquired, "try_lock");
        Ok(acquired)
    }

    /// Release the project regardless of who holds it.
    pub fn unlock(&self, project_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE projects SET locked_by = NULL WHERE project_id = ?1",
                params![project_id],
            )
            .with_context(|| format!("unlock {project_id}"))?;
        debug!(project_id, "unlocked");
        Ok(())
    }

    /// Persist a snapshot. Errors if the project was never registered.
    pub fn update_state(&self, project_id: &str, meta: &ProjectMeta) -> Result<()> {
        let meta_json = serde_json::to_string(meta).context("serialize snapshot")?;
        let changed = self
            .conn
            .execute(
                "UPDATE projects
                 SET state = ?1, retry_count = ?2, failure_reason = ?3, updated_at = ?4,
                     meta_json = ?5
                 WHERE project_id = ?6",
                params![
                    meta.state.as_str(),
                    meta.retry_count,
                    meta.failure_reason,
                    format_timestamp(meta.updated_at),
                    meta_json,
                    project_id,
                ],
            )
            .with_context(|| format!("update {project_id}"))?;
        if changed != 1 {
            bail!("project {project_id} is not registered");
        }
        Ok(())
    }

    pub fn get_project(&self, project_id: &str) -> Result<Option<ProjectRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE project_id = ?1"),
                params![project_id],
                RawRecord::from_row,
            )
            .optional()
            .with_context(|| format!("query {project_id}"))?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// Unlocked projects in `state`, oldest first.
    pub fn list_by_state(&self, state: ProjectState) -> Result<Vec<ProjectRecord>> {
        self.query_records(
            &format!(
                "{SELECT_COLUMNS} WHERE state = ?1 AND locked_by IS NULL ORDER BY created_at"
            ),
            params![state.as_str()],
        )
    }

    /// Every project not yet `DONE` or `ABORT`, oldest first.
    pub fn list_active(&self) -> Result<Vec<ProjectRecord>> {
        self.query_records(
            &format!(
                "{SELECT_COLUMNS} WHERE state NOT IN (?1, ?2) ORDER BY created_at"
            ),
            params![ProjectState::Done.as_str(), ProjectState::Abort.as_str()],
        )
    }

    fn query_records(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ProjectRecord>> {
        let mut stmt = self.conn.prepare(sql).context("prepare registry query")?;
        let raw = stmt
            .query_map(params, RawRecord::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("read registry rows")?;
        raw.into_iter().map(RawRecord::into_record).collect()
    }
}
