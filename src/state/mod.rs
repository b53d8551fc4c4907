//! Central agent list (`.atelier/state.db`).
//!
//! Advisory only: the per-worktree metadata is what recovery trusts. The
//! central copy lets collaborators list agents without walking the worktree
//! directory.

use crate::agent::PersistedAgent;
use crate::config::ATELIER_DIR;
use crate::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Storage collaborator for the central Persisted Agent list.
pub trait AgentStore: Send + Sync {
    fn save(&self, agent: &PersistedAgent) -> Result<()>;
    fn remove(&self, id: u32) -> Result<()>;
    fn list(&self) -> Result<Vec<PersistedAgent>>;
}

/// SQLite-backed [`AgentStore`].
pub struct SqliteAgentStore {
    db_path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteAgentStore {
    pub fn open(repo_path: impl AsRef<Path>) -> Result<Self> {
        let dir = repo_path.as_ref().join(ATELIER_DIR);
        std::fs::create_dir_all(&dir)?;
        let db_path = dir.join("state.db");
        let conn = Connection::open(&db_path)?;
        let store = Self {
            db_path: Some(db_path),
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            db_path: None,
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(f(&conn)?)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;

                CREATE TABLE IF NOT EXISTS schema_migrations (
                  version INTEGER PRIMARY KEY,
                  applied_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS agents (
                  id INTEGER PRIMARY KEY,
                  name TEXT NOT NULL UNIQUE,
                  session_id TEXT NOT NULL UNIQUE,
                  branch TEXT NOT NULL,
                  worktree_path TEXT NOT NULL,
                  repo_path TEXT NOT NULL,
                  task_file TEXT,
                  isolation TEXT NOT NULL,
                  base_branch TEXT,
                  created_at TEXT NOT NULL,
                  updated_at TEXT NOT NULL
                );
                "#,
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES(1, ?1)",
                [Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }
}

impl AgentStore for SqliteAgentStore {
    fn save(&self, agent: &PersistedAgent) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO agents (
                  id, name, session_id, branch, worktree_path, repo_path,
                  task_file, isolation, base_branch, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(id) DO UPDATE SET
                  name = excluded.name,
                  session_id = excluded.session_id,
                  branch = excluded.branch,
                  worktree_path = excluded.worktree_path,
                  repo_path = excluded.repo_path,
                  task_file = excluded.task_file,
                  isolation = excluded.isolation,
                  base_branch = excluded.base_branch,
                  updated_at = excluded.updated_at
                "#,
                params![
                    agent.id,
                    agent.name,
                    agent.session_id,
                    agent.branch,
                    agent.worktree_path.to_string_lossy().to_string(),
                    agent.repo_path.to_string_lossy().to_string(),
                    agent
                        .task_file
                        .as_ref()
                        .map(|p| p.to_string_lossy().to_string()),
                    agent.isolation,
                    agent.base_branch,
                    agent.created_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn remove(&self, id: u32) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM agents WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    fn list(&self) -> Result<Vec<PersistedAgent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, name, session_id, branch, worktree_path, repo_path,
                       task_file, isolation, base_branch, created_at
                FROM agents
                ORDER BY id
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(PersistedAgent {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    session_id: row.get(2)?,
                    branch: row.get(3)?,
                    worktree_path: PathBuf::from(row.get::<_, String>(4)?),
                    repo_path: PathBuf::from(row.get::<_, String>(5)?),
                    task_file: row.get::<_, Option<String>>(6)?.map(PathBuf::from),
                    isolation: row.get(7)?,
                    base_branch: row.get(8)?,
                    created_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
                })
            })?;
            rows.collect()
        })
    }
}

fn parse_rfc3339(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: u32, name: &str) -> PersistedAgent {
        PersistedAgent {
            id,
            name: name.into(),
            session_id: format!("session-{}", id),
            branch: format!("atelier/{}", name),
            worktree_path: format!("/repo/.atelier/worktrees/atelier-{}", name).into(),
            repo_path: "/repo".into(),
            task_file: None,
            isolation: "none".into(),
            base_branch: Some("main".into()),
            created_at: DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn open_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteAgentStore::open(dir.path()).unwrap();
        assert!(store.db_path().unwrap().exists());
        store.save(&agent(1, "dou")).unwrap();

        let reopened = SqliteAgentStore::open(dir.path()).unwrap();
        assert_eq!(reopened.list().unwrap(), vec![agent(1, "dou")]);
    }

    #[test]
    fn save_upserts_and_remove_deletes() {
        let store = SqliteAgentStore::in_memory().unwrap();
        store.save(&agent(2, "flinck")).unwrap();
        store.save(&agent(1, "dou")).unwrap();

        let mut moved = agent(1, "dou");
        moved.isolation = "sandbox".into();
        moved.task_file = Some("plan.json".into());
        store.save(&moved).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed, vec![moved, agent(2, "flinck")]);

        store.remove(1).unwrap();
        store.remove(1).unwrap();
        assert_eq!(store.list().unwrap(), vec![agent(2, "flinck")]);
    }
}
