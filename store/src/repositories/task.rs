//! Task repository: upsert/list/tree/progress for task states.
use crate::errors::RepositoryError;
use crate::json::{decode_optional, decode_optional_value, encode_optional, encode_optional_value};
use crate::models::{
    format_timestamp, parse_timestamp, ComponentType, ExecutionType, ProgressInfo, StatusType, TaskState, UsageSummary,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Executor, Row, Sqlite, Transaction};
use std::collections::HashMap;
use std::future::Future;

const TASK_COLUMNS: &str = "task_exec_id, component, status, task_id, workflow_exec_id, workflow_id, \
     execution_type, usage, agent_id, tool_id, action_id, parent_state_id, input, output, error, \
     created_at, updated_at";

/// Any subset of filters over `task_states` used by `ListStates`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<StatusType>,
    pub workflow_id: Option<String>,
    pub workflow_exec_id: Option<String>,
    pub task_id: Option<String>,
    pub task_exec_id: Option<String>,
    pub parent_state_id: Option<String>,
    pub agent_id: Option<String>,
    pub tool_id: Option<String>,
    pub action_id: Option<String>,
    pub execution_type: Option<String>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: StatusType) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_workflow_exec_id(mut self, workflow_exec_id: impl Into<String>) -> Self {
        self.workflow_exec_id = Some(workflow_exec_id.into());
        self
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_tool_id(mut self, tool_id: impl Into<String>) -> Self {
        self.tool_id = Some(tool_id.into());
        self
    }

    /// Render the accumulated filters into a `WHERE` clause and bind list, in the
    /// style of `TaskQueryBuilder`'s accumulate-then-render approach.
    fn render(&self) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();

        macro_rules! push {
            ($field:expr, $col:literal) => {
                if let Some(v) = &$field {
                    clauses.push(format!("{} = ?", $col));
                    binds.push(v.clone());
                }
            };
        }

        if let Some(status) = self.status {
            clauses.push("status = ?".to_string());
            binds.push(status.as_str().to_string());
        }
        push!(self.workflow_id, "workflow_id");
        push!(self.workflow_exec_id, "workflow_exec_id");
        push!(self.task_id, "task_id");
        push!(self.task_exec_id, "task_exec_id");
        push!(self.parent_state_id, "parent_state_id");
        push!(self.agent_id, "agent_id");
        push!(self.tool_id, "tool_id");
        push!(self.action_id, "action_id");
        push!(self.execution_type, "execution_type");

        if clauses.is_empty() {
            (String::new(), binds)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), binds)
        }
    }
}

pub(crate) struct TaskRow {
    task_exec_id: String,
    component: String,
    status: String,
    task_id: String,
    workflow_exec_id: String,
    workflow_id: String,
    execution_type: String,
    usage: Option<String>,
    agent_id: Option<String>,
    tool_id: Option<String>,
    action_id: Option<String>,
    parent_state_id: Option<String>,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

pub(crate) fn task_row_from(row: &SqliteRow) -> Result<TaskRow, RepositoryError> {
    Ok(TaskRow {
        task_exec_id: row.try_get("task_exec_id")?,
        component: row.try_get("component")?,
        status: row.try_get("status")?,
        task_id: row.try_get("task_id")?,
        workflow_exec_id: row.try_get("workflow_exec_id")?,
        workflow_id: row.try_get("workflow_id")?,
        execution_type: row.try_get("execution_type")?,
        usage: row.try_get("usage")?,
        agent_id: row.try_get("agent_id")?,
        tool_id: row.try_get("tool_id")?,
        action_id: row.try_get("action_id")?,
        parent_state_id: row.try_get("parent_state_id")?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl TryFrom<TaskRow> for TaskState {
    type Error = RepositoryError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(TaskState {
            task_exec_id: row.task_exec_id,
            component: row.component.parse::<ComponentType>()?,
            status: row.status.parse::<StatusType>()?,
            task_id: row.task_id,
            workflow_exec_id: row.workflow_exec_id,
            workflow_id: row.workflow_id,
            execution_type: row.execution_type.parse::<ExecutionType>()?,
            usage: decode_optional::<UsageSummary>(row.usage)?,
            agent_id: row.agent_id,
            tool_id: row.tool_id,
            action_id: row.action_id,
            parent_state_id: row.parent_state_id,
            input: decode_optional_value(row.input)?,
            output: decode_optional_value(row.output)?,
            error: decode_optional_value(row.error)?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn list_states(&self, filter: &TaskFilter) -> Result<Vec<TaskState>, RepositoryError>;
    async fn get_state(&self, task_exec_id: &str) -> Result<TaskState, RepositoryError>;
    async fn get_usage_summary(&self, task_exec_id: &str) -> Result<Option<UsageSummary>, RepositoryError>;
    async fn list_tasks_in_workflow(
        &self,
        workflow_exec_id: &str,
    ) -> Result<HashMap<String, TaskState>, RepositoryError>;
    async fn list_tasks_by_status(&self, status: StatusType) -> Result<Vec<TaskState>, RepositoryError>;
    async fn list_tasks_by_agent(&self, agent_id: &str) -> Result<Vec<TaskState>, RepositoryError>;
    async fn list_tasks_by_tool(&self, tool_id: &str) -> Result<Vec<TaskState>, RepositoryError>;
    async fn list_children(&self, parent_state_id: &str) -> Result<Vec<TaskState>, RepositoryError>;
    async fn list_children_outputs(
        &self,
        parent_state_id: &str,
    ) -> Result<HashMap<String, serde_json::Value>, RepositoryError>;
    async fn get_child_by_task_id(
        &self,
        parent_state_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskState>, RepositoryError>;
    async fn get_task_tree(&self, root_state_id: &str, max_depth: u32) -> Result<Vec<TaskState>, RepositoryError>;
    async fn get_progress_info(&self, parent_state_id: &str) -> Result<ProgressInfo, RepositoryError>;
    async fn list_by_ids(&self, ids: &[String]) -> Result<Vec<TaskState>, RepositoryError>;
    async fn upsert_state(&self, state: &TaskState) -> Result<(), RepositoryError>;
    async fn merge_usage(&self, task_exec_id: &str, delta: &UsageSummary, max_attempts: u32) -> Result<UsageSummary, RepositoryError>;

    /// Fetch a task state for update. SQLite has no `SELECT ... FOR UPDATE`, so this
    /// is only meaningful inside an already-open transaction (see [`TaskTx`]); the
    /// plain pool-backed repository fails fast rather than returning a state with no
    /// locking guarantee behind it.
    async fn get_state_for_update(&self, task_exec_id: &str) -> Result<TaskState, RepositoryError>;
}

/// Concrete SQLite-backed [`TaskRepository`].
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Bind a dynamic set of string parameters onto a query built from
/// [`TaskFilter::render`].
fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: Vec<String>,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for b in binds {
        query = query.bind(b);
    }
    query
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn list_states(&self, filter: &TaskFilter) -> Result<Vec<TaskState>, RepositoryError> {
        let (where_clause, binds) = filter.render();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM task_states{where_clause} ORDER BY created_at ASC"
        );
        let rows = bind_all(sqlx::query(&sql), binds).fetch_all(self.pool()).await?;
        rows.iter().map(|r| task_row_from(r)?.try_into()).collect()
    }

    async fn get_state(&self, task_exec_id: &str) -> Result<TaskState, RepositoryError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM task_states WHERE task_exec_id = ?");
        let row = sqlx::query(&sql)
            .bind(task_exec_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| RepositoryError::TaskNotFound(task_exec_id.to_string()))?;
        task_row_from(&row)?.try_into()
    }

    async fn get_usage_summary(&self, task_exec_id: &str) -> Result<Option<UsageSummary>, RepositoryError> {
        let raw: Option<String> = sqlx::query_scalar("SELECT usage FROM task_states WHERE task_exec_id = ?")
            .bind(task_exec_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| RepositoryError::TaskNotFound(task_exec_id.to_string()))?;
        decode_optional::<UsageSummary>(raw)
    }

    async fn list_tasks_in_workflow(
        &self,
        workflow_exec_id: &str,
    ) -> Result<HashMap<String, TaskState>, RepositoryError> {
        // Latest row per task_id, per the window-function dedup variant named
        // normative in the design's open questions.
        let sql = format!(
            "WITH ranked AS (
                SELECT {TASK_COLUMNS},
                       ROW_NUMBER() OVER (
                           PARTITION BY task_id
                           ORDER BY created_at DESC, updated_at DESC
                       ) AS rn
                FROM task_states
                WHERE workflow_exec_id = ?
             )
             SELECT {TASK_COLUMNS} FROM ranked WHERE rn = 1"
        );
        let rows = sqlx::query(&sql).bind(workflow_exec_id).fetch_all(self.pool()).await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let state: TaskState = task_row_from(row)?.try_into()?;
            out.insert(state.task_id.clone(), state);
        }
        Ok(out)
    }

    async fn list_tasks_by_status(&self, status: StatusType) -> Result<Vec<TaskState>, RepositoryError> {
        self.list_states(&TaskFilter::new().with_status(status)).await
    }

    async fn list_tasks_by_agent(&self, agent_id: &str) -> Result<Vec<TaskState>, RepositoryError> {
        self.list_states(&TaskFilter::new().with_agent_id(agent_id)).await
    }

    async fn list_tasks_by_tool(&self, tool_id: &str) -> Result<Vec<TaskState>, RepositoryError> {
        self.list_states(&TaskFilter::new().with_tool_id(tool_id)).await
    }

    async fn list_children(&self, parent_state_id: &str) -> Result<Vec<TaskState>, RepositoryError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM task_states WHERE parent_state_id = ? ORDER BY created_at ASC");
        let rows = sqlx::query(&sql).bind(parent_state_id).fetch_all(self.pool()).await?;
        rows.iter().map(|r| task_row_from(r)?.try_into()).collect()
    }

    async fn list_children_outputs(
        &self,
        parent_state_id: &str,
    ) -> Result<HashMap<String, serde_json::Value>, RepositoryError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM task_states WHERE parent_state_id = ? AND output IS NOT NULL ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql).bind(parent_state_id).fetch_all(self.pool()).await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let state: TaskState = task_row_from(row)?.try_into()?;
            if let Some(output) = state.output {
                out.insert(state.task_id, output);
            }
        }
        Ok(out)
    }

    async fn get_child_by_task_id(
        &self,
        parent_state_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskState>, RepositoryError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM task_states WHERE parent_state_id = ? AND task_id = ? \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(parent_state_id)
            .bind(task_id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| task_row_from(&r)?.try_into()).transpose()
    }

    async fn get_task_tree(&self, root_state_id: &str, max_depth: u32) -> Result<Vec<TaskState>, RepositoryError> {
        let sql = format!(
            "WITH RECURSIVE tree(task_exec_id, depth) AS (
                SELECT task_exec_id, 0 FROM task_states WHERE task_exec_id = ?
                UNION ALL
                SELECT t.task_exec_id, tree.depth + 1
                FROM task_states t
                JOIN tree ON t.parent_state_id = tree.task_exec_id
                WHERE tree.depth + 1 <= ?
             )
             SELECT {TASK_COLUMNS}, tree.depth AS depth
             FROM task_states
             JOIN tree ON task_states.task_exec_id = tree.task_exec_id
             ORDER BY tree.depth ASC, task_states.created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(root_state_id)
            .bind(max_depth as i64)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(|r| task_row_from(r)?.try_into()).collect()
    }

    async fn get_progress_info(&self, parent_state_id: &str) -> Result<ProgressInfo, RepositoryError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS cnt FROM task_states WHERE parent_state_id = ? GROUP BY status",
        )
        .bind(parent_state_id)
        .fetch_all(self.pool())
        .await?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let cnt: i64 = row.try_get("cnt")?;
            counts.insert(status, cnt.max(0) as u64);
        }
        Ok(ProgressInfo::from_counts(counts))
    }

    async fn list_by_ids(&self, ids: &[String]) -> Result<Vec<TaskState>, RepositoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = std::iter::repeat("?").take(ids.len()).collect::<Vec<_>>().join(", ");
        let sql = format!("SELECT {TASK_COLUMNS} FROM task_states WHERE task_exec_id IN ({placeholders})");
        let rows = bind_all(sqlx::query(&sql), ids.to_vec()).fetch_all(self.pool()).await?;
        rows.iter().map(|r| task_row_from(r)?.try_into()).collect()
    }

    async fn upsert_state(&self, state: &TaskState) -> Result<(), RepositoryError> {
        upsert_task_state(self.pool(), state).await
    }

    async fn merge_usage(&self, task_exec_id: &str, delta: &UsageSummary, max_attempts: u32) -> Result<UsageSummary, RepositoryError> {
        crate::retry::with_retry(self.pool(), max_attempts, move |mut tx| {
            let delta = delta.clone();
            let task_exec_id = task_exec_id.to_string();
            async move {
                let merged = merge_usage_in_tx(&mut tx, &task_exec_id, &delta).await?;
                Ok((tx, merged))
            }
        })
        .await
    }

    /// Intentionally fails fast: without an open transaction there is no lock to
    /// honour, so returning a plain fetched state here would silently misrepresent
    /// the guarantee callers ask for by name.
    async fn get_state_for_update(&self, _task_exec_id: &str) -> Result<TaskState, RepositoryError> {
        Err(RepositoryError::Usage(
            "get_state_for_update requires a transaction-scoped repository (see with_transaction); \
             SQLite has no row-level FOR UPDATE outside a transaction"
                .to_string(),
        ))
    }
}

/// A [`TaskRepository`]-shaped handle bound to a single open transaction, handed to
/// the callback of [`SqliteTaskRepository::with_transaction`]. Unlike the pool-backed
/// repository, [`TaskTx::get_state_for_update`] is valid here: the transaction already
/// holds whatever lock SQLite is willing to give, so a plain fetch is the correct
/// (and only available) approximation of row-level locking.
pub struct TaskTx<'t> {
    tx: Transaction<'t, Sqlite>,
}

impl<'t> TaskTx<'t> {
    pub async fn get_state_for_update(&mut self, task_exec_id: &str) -> Result<TaskState, RepositoryError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM task_states WHERE task_exec_id = ?");
        let row = sqlx::query(&sql)
            .bind(task_exec_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify_busy)?
            .ok_or_else(|| RepositoryError::TaskNotFound(task_exec_id.to_string()))?;
        task_row_from(&row)?.try_into()
    }

    pub async fn upsert_state(&mut self, state: &TaskState) -> Result<(), RepositoryError> {
        upsert_task_state(&mut *self.tx, state).await
    }

    pub async fn merge_usage(&mut self, task_exec_id: &str, delta: &UsageSummary) -> Result<UsageSummary, RepositoryError> {
        merge_usage_in_tx(&mut self.tx, task_exec_id, delta).await
    }
}

impl SqliteTaskRepository {
    /// Run `body` against a transaction-scoped repository, retrying the whole
    /// transaction under the same busy-retry policy as every other write path. The
    /// transaction commits if `body` returns `Ok`; a returned `Err`, or a panic
    /// unwinding through `body`, rolls it back — a panic drops the `Transaction`
    /// without committing, which `sqlx` rolls back on drop, and then continues
    /// unwinding rather than being swallowed.
    pub async fn with_transaction<F, Fut, T>(&self, max_attempts: u32, mut body: F) -> Result<T, RepositoryError>
    where
        F: FnMut(TaskTx<'static>) -> Fut,
        Fut: Future<Output = Result<(TaskTx<'static>, T), RepositoryError>>,
    {
        crate::retry::with_retry(self.pool(), max_attempts, move |tx| {
            let scoped = TaskTx { tx };
            let fut = body(scoped);
            async move {
                let (scoped, value) = fut.await?;
                Ok((scoped.tx, value))
            }
        })
        .await
    }
}

/// Insert-or-update keyed on `task_exec_id`, preserving `created_at` on update.
pub(crate) async fn upsert_task_state<'e, E>(executor: E, state: &TaskState) -> Result<(), RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let usage = encode_optional(&state.usage)?;
    let input = encode_optional_value(&state.input)?;
    let output = encode_optional_value(&state.output)?;
    let error = encode_optional_value(&state.error)?;
    let created_at = format_timestamp(&state.created_at);
    let updated_at = format_timestamp(&state.updated_at);

    sqlx::query(
        "INSERT INTO task_states (
            task_exec_id, component, status, task_id, workflow_exec_id, workflow_id,
            execution_type, usage, agent_id, tool_id, action_id, parent_state_id,
            input, output, error, created_at, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(task_exec_id) DO UPDATE SET
            component = excluded.component,
            status = excluded.status,
            task_id = excluded.task_id,
            workflow_exec_id = excluded.workflow_exec_id,
            workflow_id = excluded.workflow_id,
            execution_type = excluded.execution_type,
            usage = excluded.usage,
            agent_id = excluded.agent_id,
            tool_id = excluded.tool_id,
            action_id = excluded.action_id,
            parent_state_id = excluded.parent_state_id,
            input = excluded.input,
            output = excluded.output,
            error = excluded.error,
            updated_at = excluded.updated_at",
    )
    .bind(&state.task_exec_id)
    .bind(state.component.as_str())
    .bind(state.status.as_str())
    .bind(&state.task_id)
    .bind(&state.workflow_exec_id)
    .bind(&state.workflow_id)
    .bind(state.execution_type.as_str())
    .bind(&usage)
    .bind(&state.agent_id)
    .bind(&state.tool_id)
    .bind(&state.action_id)
    .bind(&state.parent_state_id)
    .bind(&input)
    .bind(&output)
    .bind(&error)
    .bind(&created_at)
    .bind(&updated_at)
    .execute(executor)
    .await
    .map_err(|e| {
        if RepositoryError::is_foreign_key_violation(&e) {
            RepositoryError::ForeignKey(format!(
                "workflow {} or parent {:?} does not exist",
                state.workflow_exec_id, state.parent_state_id
            ))
        } else {
            RepositoryError::Database(e)
        }
    })?;

    Ok(())
}

/// Read-modify-write the `usage` column within an already-open transaction,
/// shared by both the task and workflow `MergeUsage` protocols.
pub(crate) async fn merge_usage_in_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    task_exec_id: &str,
    delta: &UsageSummary,
) -> Result<UsageSummary, RepositoryError> {
    let raw: Option<String> = sqlx::query_scalar("SELECT usage FROM task_states WHERE task_exec_id = ?")
        .bind(task_exec_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify_busy)?
        .ok_or_else(|| RepositoryError::TaskNotFound(task_exec_id.to_string()))?;

    let mut current = decode_optional::<UsageSummary>(raw)?.unwrap_or_default();
    let mut delta = delta.clone();
    delta.sort();
    current.merge_all(&delta);
    current.sort();

    let encoded = encode_optional(&Some(current.clone()))?;
    sqlx::query("UPDATE task_states SET usage = ? WHERE task_exec_id = ?")
        .bind(&encoded)
        .bind(task_exec_id)
        .execute(&mut *tx)
        .await
        .map_err(classify_busy)?;

    Ok(current)
}

fn classify_busy(err: sqlx::Error) -> RepositoryError {
    if RepositoryError::is_busy(&err) {
        RepositoryError::Busy(err.to_string())
    } else {
        RepositoryError::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;
    use crate::models::{ComponentType, ExecutionType, StatusType, UsageEntry};
    use sqlx::sqlite::SqlitePoolOptions;
    use uuid::Uuid;

    async fn repo_with_workflow(workflow_exec_id: &str) -> SqliteTaskRepository {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        migrations::apply(&pool).await.unwrap();
        sqlx::query("INSERT INTO workflow_states (workflow_exec_id, workflow_id, status, created_at, updated_at) VALUES (?, 'wf-1', 'running', ?, ?)")
            .bind(workflow_exec_id)
            .bind(format_timestamp(&chrono::Utc::now()))
            .bind(format_timestamp(&chrono::Utc::now()))
            .execute(&pool)
            .await
            .unwrap();
        SqliteTaskRepository::new(pool)
    }

    fn new_task(task_id: &str, workflow_exec_id: &str, parent: Option<&str>) -> TaskState {
        let mut state = TaskState::new(
            Uuid::new_v4().to_string(),
            ComponentType::Task,
            StatusType::Running,
            task_id,
            workflow_exec_id,
            "wf-1",
            ExecutionType::Basic,
        );
        state.parent_state_id = parent.map(|s| s.to_string());
        state
    }

    #[tokio::test]
    async fn upsert_then_get() {
        let repo = repo_with_workflow("wfx-1").await;
        let task = new_task("t1", "wfx-1", None);
        repo.upsert_state(&task).await.unwrap();

        let fetched = repo.get_state(&task.task_exec_id).await.unwrap();
        assert_eq!(fetched.task_id, "t1");
        assert_eq!(fetched.status, StatusType::Running);
    }

    #[tokio::test]
    async fn upsert_preserves_created_at_and_is_idempotent() {
        let repo = repo_with_workflow("wfx-1").await;
        let mut task = new_task("t1", "wfx-1", None);
        repo.upsert_state(&task).await.unwrap();
        let first = repo.get_state(&task.task_exec_id).await.unwrap();

        task.status = StatusType::Success;
        task.updated_at = chrono::Utc::now();
        repo.upsert_state(&task).await.unwrap();
        let second = repo.get_state(&task.task_exec_id).await.unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.status, StatusType::Success);
    }

    #[tokio::test]
    async fn list_tasks_in_workflow_returns_latest_per_task_id() {
        let repo = repo_with_workflow("wfx-1").await;
        let task_exec_id = Uuid::new_v4().to_string();

        let mut first = new_task("t1", "wfx-1", None);
        first.task_exec_id = task_exec_id.clone();
        first.status = StatusType::Running;
        repo.upsert_state(&first).await.unwrap();

        first.status = StatusType::Success;
        first.updated_at = chrono::Utc::now();
        repo.upsert_state(&first).await.unwrap();

        let latest = repo.list_tasks_in_workflow("wfx-1").await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest["t1"].status, StatusType::Success);
    }

    #[tokio::test]
    async fn task_tree_respects_depth_cap() {
        let repo = repo_with_workflow("wfx-1").await;
        let root = new_task("root", "wfx-1", None);
        repo.upsert_state(&root).await.unwrap();

        let mut parent_id = root.task_exec_id.clone();
        let mut all_ids = vec![root.task_exec_id.clone()];
        for i in 0..5 {
            let child = new_task(&format!("t{i}"), "wfx-1", Some(&parent_id));
            repo.upsert_state(&child).await.unwrap();
            parent_id = child.task_exec_id.clone();
            all_ids.push(child.task_exec_id);
        }

        let full_tree = repo.get_task_tree(&root.task_exec_id, 100).await.unwrap();
        assert_eq!(full_tree.len(), 6);

        let capped = repo.get_task_tree(&root.task_exec_id, 2).await.unwrap();
        assert_eq!(capped.len(), 3);
    }

    #[tokio::test]
    async fn progress_info_counts_children_by_status() {
        let repo = repo_with_workflow("wfx-1").await;
        let root = new_task("root", "wfx-1", None);
        repo.upsert_state(&root).await.unwrap();

        let mut child_a = new_task("a", "wfx-1", Some(&root.task_exec_id));
        child_a.status = StatusType::Success;
        repo.upsert_state(&child_a).await.unwrap();

        let mut child_b = new_task("b", "wfx-1", Some(&root.task_exec_id));
        child_b.status = StatusType::Failed;
        repo.upsert_state(&child_b).await.unwrap();

        let progress = repo.get_progress_info(&root.task_exec_id).await.unwrap();
        assert_eq!(progress.total_children(), 2);
        assert_eq!(progress.success_count(), 1);
        assert_eq!(progress.failed_count(), 1);
    }

    #[tokio::test]
    async fn merge_usage_is_additive_and_idempotent_on_empty_delta() {
        let repo = repo_with_workflow("wfx-1").await;
        let task = new_task("t1", "wfx-1", None);
        repo.upsert_state(&task).await.unwrap();

        repo.merge_usage(&task.task_exec_id, &UsageSummary::single(UsageEntry::new("openai", "gpt-4", 5, 5)), 10)
            .await
            .unwrap();
        let merged = repo
            .merge_usage(&task.task_exec_id, &UsageSummary::new(), 10)
            .await
            .unwrap();
        assert_eq!(merged.0[0].effective_total(), 10);
    }

    #[tokio::test]
    async fn get_state_for_update_fails_fast_outside_a_transaction() {
        let repo = repo_with_workflow("wfx-1").await;
        let task = new_task("t1", "wfx-1", None);
        repo.upsert_state(&task).await.unwrap();

        let err = repo.get_state_for_update(&task.task_exec_id).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Usage(_)));
    }

    #[tokio::test]
    async fn with_transaction_commits_and_allows_get_state_for_update() {
        let repo = repo_with_workflow("wfx-1").await;
        let task = new_task("t1", "wfx-1", None);
        repo.upsert_state(&task).await.unwrap();

        let task_exec_id = task.task_exec_id.clone();
        let status = repo
            .with_transaction(5, move |mut scoped| {
                let task_exec_id = task_exec_id.clone();
                async move {
                    let mut locked = scoped.get_state_for_update(&task_exec_id).await?;
                    locked.status = StatusType::Success;
                    scoped.upsert_state(&locked).await?;
                    Ok((scoped, locked.status))
                }
            })
            .await
            .unwrap();
        assert_eq!(status, StatusType::Success);

        let reloaded = repo.get_state(&task.task_exec_id).await.unwrap();
        assert_eq!(reloaded.status, StatusType::Success);
    }

    #[tokio::test]
    async fn with_transaction_rolls_back_on_error() {
        let repo = repo_with_workflow("wfx-1").await;
        let task = new_task("t1", "wfx-1", None);
        repo.upsert_state(&task).await.unwrap();

        let task_exec_id = task.task_exec_id.clone();
        let result: Result<(), RepositoryError> = repo
            .with_transaction(5, move |mut scoped| {
                let task_exec_id = task_exec_id.clone();
                async move {
                    let mut locked = scoped.get_state_for_update(&task_exec_id).await?;
                    locked.status = StatusType::Failed;
                    scoped.upsert_state(&locked).await?;
                    Err(RepositoryError::Validation("reject this write".into()))
                }
            })
            .await;
        assert!(result.is_err());

        let reloaded = repo.get_state(&task.task_exec_id).await.unwrap();
        assert_eq!(reloaded.status, StatusType::Running);
    }
}
