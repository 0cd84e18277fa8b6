use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{ClaimOutcome, Result, StoreError, TaskFilter, TaskStore};
use crate::types::{
    Agent, AgentStatus, AgentType, ContextEntry, ProjectSnapshot, Task, TaskStatus, TaskUpdate,
};

/// Async SQLite-backed task store.
pub struct SqliteStore {
    conn: Connection,
}

const TASK_COLUMNS: &str = "id, title, description, status, task_type, required_skills,
    priority, dependencies, project_id, parent_task_id, assigned_to, progress, result,
    created_at, updated_at, completed_at, metadata";

const AGENT_COLUMNS: &str = "id, name, role, skills, model, agent_type, status,
    current_workload, max_workload, created_at, updated_at";

// ---------------------------------------------------------------------------
// helpers – enum / uuid / time <-> SQLite text
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> std::result::Result<String, serde_json::Error> {
    let s = serde_json::to_string(val)?;
    Ok(s.trim_matches('"').to_string())
}

fn conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).map_err(|e| conversion_err(idx, e))
}

fn json_from_sql<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| conversion_err(idx, e))
}

fn uuid_from_sql(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| conversion_err(idx, e))
}

fn time_from_sql(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

/// Fixed-width UTC timestamps so that text ordering matches time ordering.
fn time_to_sql(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_sql() -> String {
    time_to_sql(&Utc::now())
}

impl SqliteStore {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        info!(path = %path.as_ref().display(), "task store opened");
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS tasks (
                        id              TEXT PRIMARY KEY,
                        title           TEXT NOT NULL,
                        description     TEXT NOT NULL DEFAULT '',
                        status          TEXT NOT NULL,
                        task_type       TEXT,
                        required_skills TEXT NOT NULL DEFAULT '[]',
                        priority        INTEGER NOT NULL DEFAULT 0,
                        dependencies    TEXT NOT NULL DEFAULT '[]',
                        project_id      TEXT,
                        parent_task_id  TEXT,
                        assigned_to     TEXT,
                        progress        INTEGER NOT NULL DEFAULT 0,
                        result          TEXT,
                        created_at      TEXT NOT NULL,
                        updated_at      TEXT NOT NULL,
                        completed_at    TEXT,
                        metadata        TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_status   ON tasks(status);
                    CREATE INDEX IF NOT EXISTS idx_tasks_project  ON tasks(project_id);
                    CREATE INDEX IF NOT EXISTS idx_tasks_assigned ON tasks(assigned_to);

                    CREATE TABLE IF NOT EXISTS agents (
                        id               TEXT PRIMARY KEY,
                        name             TEXT NOT NULL,
                        role             TEXT NOT NULL,
                        skills           TEXT NOT NULL DEFAULT '[]',
                        model            TEXT NOT NULL,
                        agent_type       TEXT NOT NULL,
                        status           TEXT NOT NULL,
                        current_workload INTEGER NOT NULL DEFAULT 0,
                        max_workload     INTEGER NOT NULL,
                        created_at       TEXT NOT NULL,
                        updated_at       TEXT NOT NULL,
                        CHECK (current_workload >= 0 AND current_workload <= max_workload)
                    );

                    CREATE UNIQUE INDEX IF NOT EXISTS idx_agents_name_type
                        ON agents(name, agent_type);

                    CREATE TABLE IF NOT EXISTS context_entries (
                        task_id    TEXT NOT NULL,
                        key        TEXT NOT NULL,
                        value      TEXT NOT NULL,
                        updated_at TEXT NOT NULL,
                        PRIMARY KEY (task_id, key)
                    );

                    CREATE TABLE IF NOT EXISTS task_updates (
                        seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                        id         TEXT NOT NULL UNIQUE,
                        task_id    TEXT NOT NULL,
                        agent_id   TEXT,
                        content    TEXT NOT NULL,
                        level      TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_updates_task ON task_updates(task_id);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transaction bodies (run on the connection thread)
// ---------------------------------------------------------------------------

/// Owned column values for one `tasks` row.
struct TaskRow {
    id: String,
    title: String,
    description: String,
    status: String,
    task_type: Option<String>,
    skills: String,
    priority: i32,
    dependencies: String,
    project_id: Option<String>,
    parent_task_id: Option<String>,
    assigned_to: Option<String>,
    progress: u8,
    result: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    metadata: Option<String>,
}

impl TaskRow {
    fn from_task(task: &Task) -> Result<Self> {
        Ok(Self {
            id: task.id.to_string(),
            title: task.title.clone(),
            description: task.description.clone(),
            status: enum_to_sql(&task.status)?,
            task_type: task.task_type.as_ref().map(enum_to_sql).transpose()?,
            skills: serde_json::to_string(&task.required_skills)?,
            priority: task.priority,
            dependencies: serde_json::to_string(&task.dependencies)?,
            project_id: task.project_id.map(|u| u.to_string()),
            parent_task_id: task.parent_task_id.map(|u| u.to_string()),
            assigned_to: task.assigned_to.map(|u| u.to_string()),
            progress: task.progress,
            result: task.result.clone(),
            created_at: time_to_sql(&task.created_at),
            updated_at: time_to_sql(&task.updated_at),
            completed_at: task.completed_at.as_ref().map(time_to_sql),
            metadata: task.metadata.as_ref().map(|v| v.to_string()),
        })
    }

    fn insert(&self, conn: &rusqlite::Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO tasks (id, title, description, status, task_type,
                required_skills, priority, dependencies, project_id, parent_task_id,
                assigned_to, progress, result, created_at, updated_at, completed_at,
                metadata)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            rusqlite::params![
                self.id,
                self.title,
                self.description,
                self.status,
                self.task_type,
                self.skills,
                self.priority,
                self.dependencies,
                self.project_id,
                self.parent_task_id,
                self.assigned_to,
                self.progress,
                self.result,
                self.created_at,
                self.updated_at,
                self.completed_at,
                self.metadata,
            ],
        )?;
        Ok(())
    }
}

fn load_task(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<Option<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    conn.query_row(&sql, rusqlite::params![id], row_to_task)
        .optional()
}

fn claim_in_tx(
    conn: &mut rusqlite::Connection,
    task_id: Uuid,
    agent_id: Uuid,
) -> rusqlite::Result<Result<ClaimOutcome>> {
    let tx = conn.transaction()?;
    let id = task_id.to_string();
    let agent = agent_id.to_string();

    let Some(task) = load_task(&tx, &id)? else {
        return Ok(Err(StoreError::TaskNotFound(task_id)));
    };
    if !task.status.is_claimable() || task.assigned_to.is_some() {
        return Ok(Ok(ClaimOutcome::NotClaimable));
    }

    for dep in &task.dependencies {
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                rusqlite::params![dep.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        let done = match status {
            Some(raw) => enum_from_sql::<TaskStatus>(0, &raw)?.is_done(),
            None => false,
        };
        if !done {
            return Ok(Ok(ClaimOutcome::DependenciesUnmet));
        }
    }

    let now = now_sql();
    let bumped = tx.execute(
        "UPDATE agents SET current_workload = current_workload + 1, updated_at = ?2
         WHERE id = ?1 AND current_workload < max_workload",
        rusqlite::params![agent, now],
    )?;
    if bumped == 0 {
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM agents WHERE id = ?1",
                rusqlite::params![agent],
                |r| r.get(0),
            )
            .optional()?;
        return Ok(match exists {
            Some(_) => Ok(ClaimOutcome::AgentAtCapacity),
            None => Err(StoreError::AgentNotFound(agent_id)),
        });
    }

    let claimed = tx.execute(
        "UPDATE tasks SET status = 'in_progress', assigned_to = ?2, updated_at = ?3
         WHERE id = ?1 AND status IN ('pending', 'unassigned') AND assigned_to IS NULL",
        rusqlite::params![id, agent, now],
    )?;
    if claimed == 0 {
        // dropping the transaction rolls back the workload bump
        return Ok(Ok(ClaimOutcome::NotClaimable));
    }

    tx.commit()?;
    Ok(Ok(ClaimOutcome::Claimed))
}

fn release_slot(tx: &rusqlite::Transaction<'_>, agent_id: Option<Uuid>) -> rusqlite::Result<()> {
    if let Some(agent) = agent_id {
        tx.execute(
            "UPDATE agents SET current_workload = current_workload - 1, updated_at = ?2
             WHERE id = ?1 AND current_workload > 0",
            rusqlite::params![agent.to_string(), now_sql()],
        )?;
    }
    Ok(())
}

fn finish_in_tx(
    conn: &mut rusqlite::Connection,
    task_id: Uuid,
    agent_id: Uuid,
    status: TaskStatus,
    result: String,
    spawn: Vec<TaskRow>,
) -> rusqlite::Result<Result<Task>> {
    let tx = conn.transaction()?;
    let id = task_id.to_string();
    let agent = agent_id.to_string();

    let Some(task) = load_task(&tx, &id)? else {
        return Ok(Err(StoreError::TaskNotFound(task_id)));
    };
    let terminal = matches!(status, TaskStatus::Completed | TaskStatus::Failed);
    if !terminal || !task.status.can_transition_to(&status) {
        return Ok(Err(StoreError::InvalidTransition {
            task_id,
            from: task.status,
            to: status,
        }));
    }
    if task.assigned_to != Some(agent_id) {
        return Ok(Err(StoreError::NotOwner { task_id, agent_id }));
    }

    let now = now_sql();
    let (progress, completed_at) = match status {
        TaskStatus::Completed => (100u8, Some(now.clone())),
        _ => (0u8, None),
    };
    let changed = tx.execute(
        "UPDATE tasks SET status = ?2, result = ?3, progress = ?4, completed_at = ?5,
                updated_at = ?6
         WHERE id = ?1 AND status = 'in_progress' AND assigned_to = ?7",
        rusqlite::params![id, status.as_str(), result, progress, completed_at, now, agent],
    )?;
    if changed == 0 {
        return Ok(Err(StoreError::NotOwner { task_id, agent_id }));
    }
    release_slot(&tx, Some(agent_id))?;
    for row in &spawn {
        row.insert(&tx)?;
    }

    let updated = load_task(&tx, &id)?;
    tx.commit()?;
    Ok(updated.ok_or(StoreError::TaskNotFound(task_id)))
}

fn insert_claimed_in_tx(
    conn: &mut rusqlite::Connection,
    row: TaskRow,
    agent_id: Uuid,
) -> rusqlite::Result<Result<ClaimOutcome>> {
    let tx = conn.transaction()?;
    let agent = agent_id.to_string();

    let bumped = tx.execute(
        "UPDATE agents SET current_workload = current_workload + 1, updated_at = ?2
         WHERE id = ?1 AND current_workload < max_workload",
        rusqlite::params![agent, now_sql()],
    )?;
    if bumped == 0 {
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM agents WHERE id = ?1",
                rusqlite::params![agent],
                |r| r.get(0),
            )
            .optional()?;
        return Ok(match exists {
            Some(_) => Ok(ClaimOutcome::AgentAtCapacity),
            None => Err(StoreError::AgentNotFound(agent_id)),
        });
    }

    row.insert(&tx)?;
    tx.commit()?;
    Ok(Ok(ClaimOutcome::Claimed))
}

fn release_in_tx(
    conn: &mut rusqlite::Connection,
    task_id: Uuid,
) -> rusqlite::Result<Result<Option<Uuid>>> {
    let tx = conn.transaction()?;
    let id = task_id.to_string();

    let Some(task) = load_task(&tx, &id)? else {
        return Ok(Err(StoreError::TaskNotFound(task_id)));
    };
    if task.status != TaskStatus::InProgress {
        return Ok(Err(StoreError::InvalidTransition {
            task_id,
            from: task.status,
            to: TaskStatus::Pending,
        }));
    }

    tx.execute(
        "UPDATE tasks SET status = 'pending', assigned_to = NULL, progress = 0, updated_at = ?2
         WHERE id = ?1 AND status = 'in_progress'",
        rusqlite::params![id, now_sql()],
    )?;
    release_slot(&tx, task.assigned_to)?;
    tx.commit()?;
    Ok(Ok(task.assigned_to))
}

fn transition_in_tx(
    conn: &mut rusqlite::Connection,
    task_id: Uuid,
    status: TaskStatus,
) -> rusqlite::Result<Result<()>> {
    let tx = conn.transaction()?;
    let id = task_id.to_string();

    let Some(task) = load_task(&tx, &id)? else {
        return Ok(Err(StoreError::TaskNotFound(task_id)));
    };
    // Transitions into or out of in_progress move a workload slot and
    // must go through claim / finish / release.
    let touches_workload =
        task.status == TaskStatus::InProgress || status == TaskStatus::InProgress;
    if touches_workload || !task.status.can_transition_to(&status) {
        return Ok(Err(StoreError::InvalidTransition {
            task_id,
            from: task.status,
            to: status,
        }));
    }

    let progress_reset = status == TaskStatus::Pending;
    tx.execute(
        "UPDATE tasks SET status = ?2, updated_at = ?3,
                progress = CASE WHEN ?4 THEN 0 ELSE progress END
         WHERE id = ?1 AND status = ?5",
        rusqlite::params![id, status.as_str(), now_sql(), progress_reset, task.status.as_str()],
    )?;
    tx.commit()?;
    Ok(Ok(()))
}

fn register_agent_in_tx(conn: &mut rusqlite::Connection, agent: Agent) -> rusqlite::Result<Agent> {
    let tx = conn.transaction()?;
    let agent_type = enum_to_sql(&agent.agent_type).map_err(|e| conversion_err(5, e))?;

    let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE name = ?1 AND agent_type = ?2");
    let existing = tx
        .query_row(&sql, rusqlite::params![agent.name, agent_type], row_to_agent)
        .optional()?;
    if let Some(existing) = existing {
        return Ok(existing);
    }

    let role = enum_to_sql(&agent.role).map_err(|e| conversion_err(2, e))?;
    let status = enum_to_sql(&agent.status).map_err(|e| conversion_err(6, e))?;
    let skills = serde_json::to_string(&agent.skills).map_err(|e| conversion_err(3, e))?;
    tx.execute(
        "INSERT INTO agents (id, name, role, skills, model, agent_type, status,
            current_workload, max_workload, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        rusqlite::params![
            agent.id.to_string(),
            agent.name,
            role,
            skills,
            agent.model,
            agent_type,
            status,
            agent.current_workload,
            agent.max_workload,
            time_to_sql(&agent.created_at),
            time_to_sql(&agent.updated_at),
        ],
    )?;
    tx.commit()?;
    Ok(agent)
}

// ---------------------------------------------------------------------------
// TaskStore impl
// ---------------------------------------------------------------------------

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        let row = TaskRow::from_task(task)?;
        self.conn
            .call(move |conn| {
                row.insert(conn)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn insert_tasks(&self, tasks: &[Task]) -> Result<()> {
        let rows = tasks
            .iter()
            .map(TaskRow::from_task)
            .collect::<Result<Vec<_>>>()?;
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for row in &rows {
                    row.insert(&tx)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let id = id.to_string();
        let task = self
            .conn
            .call(move |conn| Ok(load_task(conn, &id)?))
            .await?;
        Ok(task)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<String> = Vec::new();

        let mut push = |column: &str, value: String| {
            params.push(value);
            clauses.push(format!("{column} = ?{}", params.len()));
        };
        if let Some(status) = &filter.status {
            push("status", enum_to_sql(status)?);
        }
        if let Some(task_type) = &filter.task_type {
            push("task_type", enum_to_sql(task_type)?);
        }
        if let Some(project_id) = filter.project_id {
            push("project_id", project_id.to_string());
        }
        if let Some(parent) = filter.parent_task_id {
            push("parent_task_id", parent.to_string());
        }
        if let Some(agent) = filter.assigned_to {
            push("assigned_to", agent.to_string());
        }
        if filter.unassigned_only {
            clauses.push("assigned_to IS NULL".to_string());
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks {where_clause}
             ORDER BY priority DESC, created_at ASC, id ASC"
        );

        let tasks = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(tasks)
    }

    async fn claim_task(&self, task_id: Uuid, agent_id: Uuid) -> Result<ClaimOutcome> {
        self.conn
            .call(move |conn| Ok(claim_in_tx(conn, task_id, agent_id)?))
            .await?
    }

    async fn insert_claimed(&self, task: &Task, agent_id: Uuid) -> Result<ClaimOutcome> {
        let claimed = Task {
            status: TaskStatus::InProgress,
            assigned_to: Some(agent_id),
            ..task.clone()
        };
        let row = TaskRow::from_task(&claimed)?;
        self.conn
            .call(move |conn| Ok(insert_claimed_in_tx(conn, row, agent_id)?))
            .await?
    }

    async fn finish_and_spawn(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        status: TaskStatus,
        result: &str,
        spawn: &[Task],
    ) -> Result<Task> {
        let result = result.to_string();
        let rows = spawn
            .iter()
            .map(TaskRow::from_task)
            .collect::<Result<Vec<_>>>()?;
        self.conn
            .call(move |conn| Ok(finish_in_tx(conn, task_id, agent_id, status, result, rows)?))
            .await?
    }

    async fn release_task(&self, task_id: Uuid) -> Result<Option<Uuid>> {
        let owner = self
            .conn
            .call(move |conn| Ok(release_in_tx(conn, task_id)?))
            .await??;
        debug!(task_id = %task_id, owner = ?owner, "task released");
        Ok(owner)
    }

    async fn transition_task(&self, task_id: Uuid, status: TaskStatus) -> Result<()> {
        self.conn
            .call(move |conn| Ok(transition_in_tx(conn, task_id, status)?))
            .await?
    }

    async fn set_progress(&self, task_id: Uuid, progress: u8) -> Result<()> {
        let id = task_id.to_string();
        let progress = progress.min(100);
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE tasks SET progress = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, progress, now_sql()],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn project_snapshot(&self, project_id: Uuid) -> Result<ProjectSnapshot> {
        let id = project_id.to_string();
        let counts: Vec<(String, u64)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*) FROM tasks
                     WHERE project_id = ?1 AND (task_type IS NULL OR task_type != 'project')
                     GROUP BY status",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut snapshot = ProjectSnapshot {
            project_id,
            timestamp: Utc::now(),
            ..ProjectSnapshot::default()
        };
        for (raw, count) in counts {
            let status: TaskStatus = enum_from_sql(0, &raw).map_err(tokio_rusqlite::Error::from)?;
            snapshot.total += count;
            match status {
                TaskStatus::Pending => snapshot.pending += count,
                TaskStatus::InProgress => snapshot.in_progress += count,
                TaskStatus::Completed => snapshot.completed += count,
                TaskStatus::Failed => snapshot.failed += count,
                TaskStatus::Archived => snapshot.archived += count,
                TaskStatus::Unassigned => snapshot.unassigned += count,
            }
        }
        Ok(snapshot)
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    async fn register_agent(&self, agent: &Agent) -> Result<Agent> {
        let agent = agent.clone();
        let stored = self
            .conn
            .call(move |conn| Ok(register_agent_in_tx(conn, agent)?))
            .await?;
        Ok(stored)
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        let id = id.to_string();
        let agent = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1");
                Ok(conn
                    .query_row(&sql, rusqlite::params![id], row_to_agent)
                    .optional()?)
            })
            .await?;
        Ok(agent)
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let agents = self
            .conn
            .call(|conn| {
                let sql = format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY created_at, name");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], row_to_agent)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(agents)
    }

    async fn set_agent_status(&self, id: Uuid, status: AgentStatus) -> Result<()> {
        let agent = id.to_string();
        let status = enum_to_sql(&status)?;
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE agents SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![agent, status, now_sql()],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::AgentNotFound(id));
        }
        Ok(())
    }

    async fn find_agent(&self, name: &str, agent_type: AgentType) -> Result<Option<Agent>> {
        let name = name.to_string();
        let agent_type = enum_to_sql(&agent_type)?;
        let agent = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {AGENT_COLUMNS} FROM agents WHERE name = ?1 AND agent_type = ?2"
                );
                Ok(conn
                    .query_row(&sql, rusqlite::params![name, agent_type], row_to_agent)
                    .optional()?)
            })
            .await?;
        Ok(agent)
    }

    // -----------------------------------------------------------------------
    // Context entries
    // -----------------------------------------------------------------------

    async fn set_context(&self, task_id: Uuid, key: &str, value: &str) -> Result<()> {
        let id = task_id.to_string();
        let key = key.to_string();
        let value = value.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO context_entries (task_id, key, value, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(task_id, key) DO UPDATE SET
                        value = excluded.value, updated_at = excluded.updated_at",
                    rusqlite::params![id, key, value, now_sql()],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_context(&self, task_id: Uuid) -> Result<BTreeMap<String, String>> {
        Ok(self
            .list_context_entries(task_id)
            .await?
            .into_iter()
            .map(|e| (e.key, e.value))
            .collect())
    }

    async fn list_context_entries(&self, task_id: Uuid) -> Result<Vec<ContextEntry>> {
        let id = task_id.to_string();
        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_id, key, value, updated_at FROM context_entries
                     WHERE task_id = ?1 ORDER BY key",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id], |row| {
                        let task_id: String = row.get(0)?;
                        let updated_at: String = row.get(3)?;
                        Ok(ContextEntry {
                            task_id: uuid_from_sql(0, &task_id)?,
                            key: row.get(1)?,
                            value: row.get(2)?,
                            updated_at: time_from_sql(3, &updated_at)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(entries)
    }

    // -----------------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------------

    async fn append_update(&self, update: &TaskUpdate) -> Result<()> {
        let id = update.id.to_string();
        let task_id = update.task_id.to_string();
        let agent_id = update.agent_id.map(|u| u.to_string());
        let content = update.content.clone();
        let level = enum_to_sql(&update.level)?;
        let created_at = time_to_sql(&update.created_at);

        let touched = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let touched = tx.execute(
                    "UPDATE tasks SET updated_at = ?2 WHERE id = ?1",
                    rusqlite::params![task_id, created_at],
                )?;
                if touched > 0 {
                    tx.execute(
                        "INSERT INTO task_updates (id, task_id, agent_id, content, level, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        rusqlite::params![id, task_id, agent_id, content, level, created_at],
                    )?;
                    tx.commit()?;
                }
                Ok(touched)
            })
            .await?;
        if touched == 0 {
            return Err(StoreError::TaskNotFound(update.task_id));
        }
        Ok(())
    }

    async fn list_updates(&self, task_id: Uuid) -> Result<Vec<TaskUpdate>> {
        let id = task_id.to_string();
        let updates = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, agent_id, content, level, created_at
                     FROM task_updates WHERE task_id = ?1 ORDER BY seq ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id], row_to_update)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(updates)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let status: String = row.get(3)?;
    let task_type: Option<String> = row.get(4)?;
    let skills: String = row.get(5)?;
    let dependencies: String = row.get(7)?;
    let project_id: Option<String> = row.get(8)?;
    let parent_task_id: Option<String> = row.get(9)?;
    let assigned_to: Option<String> = row.get(10)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    let completed_at: Option<String> = row.get(15)?;
    let metadata: Option<String> = row.get(16)?;

    Ok(Task {
        id: uuid_from_sql(0, &id)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: enum_from_sql(3, &status)?,
        task_type: task_type.map(|t| enum_from_sql(4, &t)).transpose()?,
        required_skills: json_from_sql(5, &skills)?,
        priority: row.get(6)?,
        dependencies: json_from_sql(7, &dependencies)?,
        project_id: project_id.map(|s| uuid_from_sql(8, &s)).transpose()?,
        parent_task_id: parent_task_id.map(|s| uuid_from_sql(9, &s)).transpose()?,
        assigned_to: assigned_to.map(|s| uuid_from_sql(10, &s)).transpose()?,
        progress: row.get(11)?,
        result: row.get(12)?,
        created_at: time_from_sql(13, &created_at)?,
        updated_at: time_from_sql(14, &updated_at)?,
        completed_at: completed_at.map(|s| time_from_sql(15, &s)).transpose()?,
        metadata: metadata.map(|s| json_from_sql(16, &s)).transpose()?,
    })
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let id: String = row.get(0)?;
    let role: String = row.get(2)?;
    let skills: String = row.get(3)?;
    let agent_type: String = row.get(5)?;
    let status: String = row.get(6)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(Agent {
        id: uuid_from_sql(0, &id)?,
        name: row.get(1)?,
        role: enum_from_sql(2, &role)?,
        skills: json_from_sql(3, &skills)?,
        model: row.get(4)?,
        agent_type: enum_from_sql(5, &agent_type)?,
        status: enum_from_sql(6, &status)?,
        current_workload: row.get(7)?,
        max_workload: row.get(8)?,
        created_at: time_from_sql(9, &created_at)?,
        updated_at: time_from_sql(10, &updated_at)?,
    })
}

fn row_to_update(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskUpdate> {
    let id: String = row.get(0)?;
    let task_id: String = row.get(1)?;
    let agent_id: Option<String> = row.get(2)?;
    let level: String = row.get(4)?;
    let created_at: String = row.get(5)?;

    Ok(TaskUpdate {
        id: uuid_from_sql(0, &id)?,
        task_id: uuid_from_sql(1, &task_id)?,
        agent_id: agent_id.map(|s| uuid_from_sql(2, &s)).transpose()?,
        content: row.get(3)?,
        level: enum_from_sql(4, &level)?,
        created_at: time_from_sql(5, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_sort_lexicographically() {
        let early = Utc::now() - chrono::Duration::milliseconds(1500);
        let late = Utc::now();
        assert!(time_to_sql(&early) < time_to_sql(&late));
        assert!(time_to_sql(&late).ends_with('Z'));
    }

    #[test]
    fn enum_sql_roundtrip() {
        let raw = enum_to_sql(&TaskStatus::InProgress).unwrap();
        assert_eq!(raw, "in_progress");
        let back: TaskStatus = enum_from_sql(0, &raw).unwrap();
        assert_eq!(back, TaskStatus::InProgress);
        assert!(enum_from_sql::<TaskStatus>(0, "bogus").is_err());
    }
}
