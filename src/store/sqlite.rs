//! SQLite-backed store for playbooks, bullets and learn jobs

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{default_playbook_name, BulletChange};
use crate::error::{AceError, AceResult};
use crate::types::{
    validate_bullet_content, Bullet, BulletMetadata, Curation, JobStatus, LearnJob, LearnRequest,
    Playbook, Reflection, Tag,
};

const PLAYBOOK_COLUMNS: &str = "id, name, description, created_at, modified_at";
const BULLET_COLUMNS: &str = "id, playbook_id, content, metadata, created_at, modified_at";
const JOB_COLUMNS: &str =
    "id, playbook_id, status, error, reflection, curation, created_at, modified_at";

/// Jobs in these states may still be written to
const OPEN_JOB: &str = "status IN ('pending', 'running')";

/// Playbook, bullet and learn job records behind one SQLite connection
#[derive(Clone)]
pub struct PlaybookStore {
    conn: Arc<Mutex<Connection>>,
}

impl PlaybookStore {
    /// Open (or create) the database at `path`
    pub async fn open<P: AsRef<Path>>(path: P) -> AceResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        debug!("Opened playbook store at {}", path.display());
        Self::from_connection(conn)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> AceResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> AceResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> AceResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS playbooks (
                id TEXT PRIMARY KEY,
                name TEXT,
                description TEXT,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bullets (
                id TEXT PRIMARY KEY,
                playbook_id TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                FOREIGN KEY (playbook_id) REFERENCES playbooks(id) ON DELETE CASCADE
            );

            -- input holds the original learn request so interrupted jobs can resume
            CREATE TABLE IF NOT EXISTS learn_jobs (
                id TEXT PRIMARY KEY,
                playbook_id TEXT NOT NULL,
                status TEXT NOT NULL,
                input TEXT NOT NULL,
                error TEXT,
                reflection TEXT,
                curation TEXT,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                FOREIGN KEY (playbook_id) REFERENCES playbooks(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_bullets_playbook ON bullets(playbook_id, created_at, id);
            CREATE INDEX IF NOT EXISTS idx_learn_jobs_playbook ON learn_jobs(playbook_id);
            CREATE INDEX IF NOT EXISTS idx_learn_jobs_status ON learn_jobs(status);
            "#,
        )?;

        Ok(())
    }

    // --- playbooks ---

    pub async fn create_playbook(
        &self,
        name: Option<String>,
        description: Option<String>,
    ) -> AceResult<Playbook> {
        let now = Utc::now();
        let playbook = Playbook {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            modified_at: now,
            name,
            description,
        };

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO playbooks (id, name, description, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                playbook.id,
                playbook.name,
                playbook.description,
                timestamp(now),
                timestamp(now),
            ],
        )?;

        Ok(playbook)
    }

    pub async fn get_playbook(&self, id: &str) -> AceResult<Option<Playbook>> {
        let conn = self.conn.lock().await;
        Self::select_playbook(&conn, id)
    }

    /// Fetch a playbook, creating an empty one under `id` if it is unknown
    pub async fn get_or_create_playbook(&self, id: &str) -> AceResult<Playbook> {
        let conn = self.conn.lock().await;
        let now = timestamp(Utc::now());

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO playbooks (id, name, description, created_at, modified_at)
             VALUES (?1, ?2, NULL, ?3, ?3)",
            params![id, default_playbook_name(id), now],
        )?;
        if inserted > 0 {
            debug!(playbook_id = %id, "Auto-created playbook");
        }

        Self::select_playbook(&conn, id)?
            .ok_or_else(|| AceError::Internal(format!("playbook {} vanished after insert", id)))
    }

    pub async fn list_playbooks(&self) -> AceResult<Vec<Playbook>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM playbooks ORDER BY created_at, id",
            PLAYBOOK_COLUMNS
        ))?;
        let playbooks = stmt
            .query_map([], playbook_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(playbooks)
    }

    /// Change name and/or description; `None` leaves the field as is
    pub async fn update_playbook(
        &self,
        id: &str,
        name: Option<String>,
        description: Option<String>,
    ) -> AceResult<Playbook> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE playbooks
             SET name = COALESCE(?1, name),
                 description = COALESCE(?2, description),
                 modified_at = ?3
             WHERE id = ?4",
            params![name, description, timestamp(Utc::now()), id],
        )?;
        if updated == 0 {
            return Err(AceError::not_found(format!("playbook {}", id)));
        }

        Self::select_playbook(&conn, id)?
            .ok_or_else(|| AceError::not_found(format!("playbook {}", id)))
    }

    fn select_playbook(conn: &Connection, id: &str) -> AceResult<Option<Playbook>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM playbooks WHERE id = ?1",
            PLAYBOOK_COLUMNS
        ))?;
        Ok(stmt.query_row(params![id], playbook_from_row).optional()?)
    }

    // --- bullets ---

    /// All bullets of a playbook, oldest first
    pub async fn list_bullets(&self, playbook_id: &str) -> AceResult<Vec<Bullet>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM bullets WHERE playbook_id = ?1 ORDER BY created_at, id",
            BULLET_COLUMNS
        ))?;
        let bullets = stmt
            .query_map(params![playbook_id], bullet_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bullets)
    }

    pub async fn get_bullet(&self, playbook_id: &str, bullet_id: &str) -> AceResult<Option<Bullet>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM bullets WHERE playbook_id = ?1 AND id = ?2",
            BULLET_COLUMNS
        ))?;
        Ok(stmt
            .query_row(params![playbook_id, bullet_id], bullet_from_row)
            .optional()?)
    }

    /// Add a single bullet with zeroed counters
    pub async fn create_bullet(&self, playbook_id: &str, content: &str) -> AceResult<Bullet> {
        validate_bullet_content(content).map_err(AceError::Validation)?;

        let bullet = Bullet::new(playbook_id, content);
        self.commit_curation(playbook_id, &[BulletChange::Insert(bullet.clone())], None)
            .await?;
        Ok(bullet)
    }

    pub async fn update_bullet_content(
        &self,
        playbook_id: &str,
        bullet_id: &str,
        content: &str,
    ) -> AceResult<Bullet> {
        validate_bullet_content(content).map_err(AceError::Validation)?;

        let change = BulletChange::UpdateContent {
            bullet_id: bullet_id.to_string(),
            content: content.to_string(),
        };
        self.commit_curation(playbook_id, &[change], None).await?;
        self.require_bullet(playbook_id, bullet_id).await
    }

    /// Bump one counter by exactly one
    pub async fn increment_counter(
        &self,
        playbook_id: &str,
        bullet_id: &str,
        tag: Tag,
    ) -> AceResult<Bullet> {
        let change = BulletChange::Increment {
            bullet_id: bullet_id.to_string(),
            tag,
        };
        self.commit_curation(playbook_id, &[change], None).await?;
        self.require_bullet(playbook_id, bullet_id).await
    }

    async fn require_bullet(&self, playbook_id: &str, bullet_id: &str) -> AceResult<Bullet> {
        self.get_bullet(playbook_id, bullet_id)
            .await?
            .ok_or_else(|| AceError::not_found(format!("bullet {}", bullet_id)))
    }

    /// Commit a staged change set in one transaction.
    ///
    /// Bumps the playbook's modification time and, when `complete_job` is
    /// given, moves that job to `completed` in the same transaction. A change
    /// that targets a missing bullet rolls everything back.
    pub async fn commit_curation(
        &self,
        playbook_id: &str,
        changes: &[BulletChange],
        complete_job: Option<&str>,
    ) -> AceResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = timestamp(Utc::now());

        for change in changes {
            let affected = match change {
                BulletChange::Insert(bullet) => tx.execute(
                    "INSERT INTO bullets (id, playbook_id, content, metadata, created_at, modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        bullet.id,
                        playbook_id,
                        bullet.content,
                        serde_json::to_string(&bullet.metadata)?,
                        timestamp(bullet.created_at),
                        timestamp(bullet.modified_at),
                    ],
                )?,
                BulletChange::UpdateContent { bullet_id, content } => tx.execute(
                    "UPDATE bullets SET content = ?1, modified_at = ?2
                     WHERE id = ?3 AND playbook_id = ?4",
                    params![content, now, bullet_id, playbook_id],
                )?,
                BulletChange::Increment { bullet_id, tag } => {
                    let raw: Option<String> = tx
                        .query_row(
                            "SELECT metadata FROM bullets WHERE id = ?1 AND playbook_id = ?2",
                            params![bullet_id, playbook_id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    match raw {
                        Some(raw) => {
                            let mut metadata: BulletMetadata = serde_json::from_str(&raw)?;
                            metadata.record(*tag);
                            tx.execute(
                                "UPDATE bullets SET metadata = ?1, modified_at = ?2
                                 WHERE id = ?3 AND playbook_id = ?4",
                                params![serde_json::to_string(&metadata)?, now, bullet_id, playbook_id],
                            )?
                        }
                        None => 0,
                    }
                }
                BulletChange::Delete { bullet_id } => tx.execute(
                    "DELETE FROM bullets WHERE id = ?1 AND playbook_id = ?2",
                    params![bullet_id, playbook_id],
                )?,
            };

            if affected == 0 {
                return Err(AceError::not_found(format!("bullet {}", change.bullet_id())));
            }
        }

        if !changes.is_empty() {
            let touched = tx.execute(
                "UPDATE playbooks SET modified_at = ?1 WHERE id = ?2",
                params![now, playbook_id],
            )?;
            if touched == 0 {
                return Err(AceError::not_found(format!("playbook {}", playbook_id)));
            }
        }

        if let Some(job_id) = complete_job {
            let completed = tx.execute(
                &format!(
                    "UPDATE learn_jobs SET status = 'completed', error = NULL, modified_at = ?1
                     WHERE id = ?2 AND {}",
                    OPEN_JOB
                ),
                params![now, job_id],
            )?;
            if completed == 0 {
                return Err(AceError::Internal(format!(
                    "learn job {} is already finished",
                    job_id
                )));
            }
        }

        tx.commit()?;
        Ok(())
    }

    // --- learn jobs ---

    /// Persist a new pending job together with its input
    pub async fn create_job(&self, playbook_id: &str, input: &LearnRequest) -> AceResult<LearnJob> {
        let now = Utc::now();
        let job = LearnJob {
            id: uuid::Uuid::new_v4().to_string(),
            playbook_id: playbook_id.to_string(),
            status: JobStatus::Pending,
            error: None,
            reflection: None,
            curation: None,
            created_at: now,
            modified_at: now,
        };

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO learn_jobs (id, playbook_id, status, input, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id,
                job.playbook_id,
                job.status.as_str(),
                serde_json::to_string(input)?,
                timestamp(now),
                timestamp(now),
            ],
        )?;

        Ok(job)
    }

    /// Job lookup scoped to its playbook
    pub async fn get_job(&self, playbook_id: &str, job_id: &str) -> AceResult<Option<LearnJob>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM learn_jobs WHERE id = ?1 AND playbook_id = ?2",
            JOB_COLUMNS
        ))?;
        Ok(stmt
            .query_row(params![job_id, playbook_id], job_from_row)
            .optional()?)
    }

    /// Job and the request it was started with
    pub async fn get_job_with_input(
        &self,
        job_id: &str,
    ) -> AceResult<Option<(LearnJob, LearnRequest)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {}, input FROM learn_jobs WHERE id = ?1",
            JOB_COLUMNS
        ))?;
        Ok(stmt
            .query_row(params![job_id], |row| {
                Ok((job_from_row(row)?, json_column(row, 8)?))
            })
            .optional()?)
    }

    /// Ids of pending and running jobs, oldest first
    pub async fn list_incomplete_jobs(&self) -> AceResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT id FROM learn_jobs WHERE {} ORDER BY created_at, id",
            OPEN_JOB
        ))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Returns false if the job is already terminal
    pub async fn mark_job_running(&self, job_id: &str) -> AceResult<bool> {
        self.update_open_job(
            job_id,
            "status = 'running', modified_at = ?2",
            "",
            None,
        )
        .await
    }

    /// Store the reflection once; later writes and writes to finished jobs are ignored
    pub async fn store_reflection(&self, job_id: &str, reflection: &Reflection) -> AceResult<bool> {
        let raw = serde_json::to_string(reflection)?;
        self.update_open_job(
            job_id,
            "reflection = ?3, modified_at = ?2",
            "AND reflection IS NULL",
            Some(raw),
        )
        .await
    }

    /// Store the curation once; later writes and writes to finished jobs are ignored
    pub async fn store_curation(&self, job_id: &str, curation: &Curation) -> AceResult<bool> {
        let raw = serde_json::to_string(curation)?;
        self.update_open_job(
            job_id,
            "curation = ?3, modified_at = ?2",
            "AND curation IS NULL",
            Some(raw),
        )
        .await
    }

    /// Returns false if the job is already terminal
    pub async fn mark_job_failed(&self, job_id: &str, error: &str) -> AceResult<bool> {
        self.update_open_job(
            job_id,
            "status = 'failed', error = ?3, modified_at = ?2",
            "",
            Some(error.to_string()),
        )
        .await
    }

    async fn update_open_job(
        &self,
        job_id: &str,
        set: &str,
        extra_condition: &str,
        value: Option<String>,
    ) -> AceResult<bool> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "UPDATE learn_jobs SET {} WHERE id = ?1 AND {} {}",
            set, OPEN_JOB, extra_condition
        );
        let now = timestamp(Utc::now());
        let updated = match value {
            Some(value) => conn.execute(&sql, params![job_id, now, value])?,
            None => conn.execute(&sql, params![job_id, now])?,
        };
        Ok(updated > 0)
    }
}

/// RFC 3339 with fixed precision so text ordering matches time ordering
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_json_column<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        serde_json::from_str(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn playbook_from_row(row: &Row<'_>) -> rusqlite::Result<Playbook> {
    Ok(Playbook {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: timestamp_column(row, 3)?,
        modified_at: timestamp_column(row, 4)?,
    })
}

fn bullet_from_row(row: &Row<'_>) -> rusqlite::Result<Bullet> {
    Ok(Bullet {
        id: row.get(0)?,
        playbook_id: row.get(1)?,
        content: row.get(2)?,
        metadata: json_column(row, 3)?,
        created_at: timestamp_column(row, 4)?,
        modified_at: timestamp_column(row, 5)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<LearnJob> {
    let status: String = row.get(2)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(LearnJob {
        id: row.get(0)?,
        playbook_id: row.get(1)?,
        status,
        error: row.get(3)?,
        reflection: optional_json_column(row, 4)?,
        curation: optional_json_column(row, 5)?,
        created_at: timestamp_column(row, 6)?,
        modified_at: timestamp_column(row, 7)?,
    })
}
