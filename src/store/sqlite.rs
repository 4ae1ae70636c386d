//! SQLite row access for the configuration store.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};

use super::schema::{initialize_schema, is_initialized};
use super::{ContextRule, LogSourceType, Project, ProjectEnv, PromptRecord, SettingRecord};

/// SQLite-backed store for prompts, settings, projects, and context rules.
pub struct SqliteConfigStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConfigStore {
    /// Open or create a store at the given path (or `:memory:`).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::DbUnavailable(e.to_string()))?;
        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::DbUnavailable(e.to_string()))?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::DbUnavailable(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::DbUnavailable(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {e}")))?;
        f(&conn).map_err(|e| Error::DbUnavailable(e.to_string()))
    }

    // ==================== Prompts ====================

    /// Fetch the active version of a named prompt.
    pub fn fetch_active_prompt(&self, name: &str) -> Result<Option<PromptRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT name, version, template, variables
                 FROM prompts WHERE name = ?1 AND active = 1
                 ORDER BY version DESC LIMIT 1",
                params![name],
                Self::row_to_prompt,
            )
            .optional()
        })
    }

    /// Append a new prompt version and mark it active.
    pub fn upsert_prompt(&self, record: &PromptRecord) -> Result<()> {
        let variables = serde_json::to_string(&record.variables)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE prompts SET active = 0 WHERE name = ?1",
                params![record.name],
            )?;
            conn.execute(
                "INSERT INTO prompts (name, version, template, variables, active)
                 VALUES (?1, ?2, ?3, ?4, 1)",
                params![record.name, record.version, record.template, variables],
            )?;
            Ok(())
        })
    }

    fn row_to_prompt(row: &Row<'_>) -> rusqlite::Result<PromptRecord> {
        let variables: String = row.get(3)?;
        Ok(PromptRecord {
            name: row.get(0)?,
            version: row.get(1)?,
            template: row.get(2)?,
            variables: serde_json::from_str(&variables).unwrap_or_default(),
        })
    }

    // ==================== Settings ====================

    /// Fetch every setting within a category.
    pub fn fetch_settings_category(&self, category: &str) -> Result<Vec<SettingRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT category, key, value, value_type FROM settings WHERE category = ?1",
            )?;
            let rows = stmt.query_map(params![category], |row| {
                Ok(SettingRecord {
                    category: row.get(0)?,
                    key: row.get(1)?,
                    value: row.get(2)?,
                    value_type: row.get(3)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Insert or replace a setting.
    pub fn set_setting(&self, record: &SettingRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (category, key, value, value_type)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(category, key)
                 DO UPDATE SET value = ?3, value_type = ?4, updated_at = datetime('now')",
                params![
                    record.category,
                    record.key,
                    record.value,
                    record.value_type
                ],
            )?;
            Ok(())
        })
    }

    // ==================== Projects ====================

    /// Fetch a project routing record.
    pub fn fetch_project(&self, code: &str) -> Result<Option<Project>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT project_code, project_name, log_source_type
                 FROM projects WHERE project_code = ?1",
                params![code],
                |row| {
                    let source: String = row.get(2)?;
                    Ok(Project {
                        project_code: row.get(0)?,
                        project_name: row.get(1)?,
                        source: LogSourceType::parse(&source),
                    })
                },
            )
            .optional()
        })
    }

    /// Insert or replace a project.
    pub fn upsert_project(&self, project: &Project) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO projects (project_code, project_name, log_source_type)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(project_code)
                 DO UPDATE SET project_name = ?2, log_source_type = ?3",
                params![
                    project.project_code,
                    project.project_name,
                    project.source.as_str()
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch environment-specific backend parameters.
    pub fn fetch_project_env(&self, code: &str, env: &str) -> Result<Option<ProjectEnv>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT project_code, env, namespace, base_path
                 FROM project_envs WHERE project_code = ?1 AND env = ?2",
                params![code, env],
                |row| {
                    Ok(ProjectEnv {
                        project_code: row.get(0)?,
                        env: row.get(1)?,
                        namespace: row.get(2)?,
                        base_path: row.get::<_, Option<String>>(3)?.map(Into::into),
                    })
                },
            )
            .optional()
        })
    }

    /// Insert or replace environment parameters.
    pub fn upsert_project_env(&self, env: &ProjectEnv) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO project_envs (project_code, env, namespace, base_path)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(project_code, env)
                 DO UPDATE SET namespace = ?3, base_path = ?4",
                params![
                    env.project_code,
                    env.env,
                    env.namespace,
                    env.base_path.as_ref().map(|p| p.display().to_string())
                ],
            )?;
            Ok(())
        })
    }

    // ==================== Context rules ====================

    /// Fetch the rules for a domain, ordered by position.
    pub fn fetch_context_rules(&self, domain: &str) -> Result<Vec<ContextRule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT domain, rule, position FROM context_rules
                 WHERE domain = ?1 ORDER BY position, id",
            )?;
            let rows = stmt.query_map(params![domain], |row| {
                Ok(ContextRule {
                    domain: row.get(0)?,
                    rule: row.get(1)?,
                    position: row.get(2)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Append a rule for a domain.
    pub fn add_context_rule(&self, rule: &ContextRule) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO context_rules (domain, rule, position) VALUES (?1, ?2, ?3)",
                params![rule.domain, rule.rule, rule.position],
            )?;
            Ok(())
        })
    }
}
