//! Workflow repository: upsert/list/get, the completion protocol, and usage merge
//! under contention. This is where the hardest invariants in the system live.
use crate::errors::RepositoryError;
use crate::json::{decode_optional, decode_optional_value, encode_optional, encode_optional_value};
use crate::models::{format_timestamp, parse_timestamp, StatusType, TaskState, UsageSummary, WorkflowState};
use crate::repositories::task::task_row_from;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::BTreeMap;

const WORKFLOW_COLUMNS: &str = "workflow_exec_id, workflow_id, status, usage, input, output, error, created_at, updated_at";

/// Any subset of {status, workflow_id, workflow_exec_id} used by `ListStates`.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<StatusType>,
    pub workflow_id: Option<String>,
    pub workflow_exec_id: Option<String>,
}

impl WorkflowFilter {
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

    fn render(&self) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        if let Some(status) = self.status {
            clauses.push("status = ?".to_string());
            binds.push(status.as_str().to_string());
        }
        if let Some(v) = &self.workflow_id {
            clauses.push("workflow_id = ?".to_string());
            binds.push(v.clone());
        }
        if let Some(v) = &self.workflow_exec_id {
            clauses.push("workflow_exec_id = ?".to_string());
            binds.push(v.clone());
        }
        if clauses.is_empty() {
            (String::new(), binds)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), binds)
        }
    }
}

/// Caller-supplied projection from a completed workflow's tasks to a final output.
/// Implemented as a boxed closure rather than a trait object hierarchy since callers
/// need only one shot at this.
pub type OutputTransformer =
    Box<dyn Fn(&WorkflowState, &BTreeMap<String, TaskState>) -> Result<serde_json::Value, String> + Send + Sync>;

struct WorkflowRow {
    workflow_exec_id: String,
    workflow_id: String,
    status: String,
    usage: Option<String>,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

fn workflow_row_from(row: &SqliteRow) -> Result<WorkflowRow, RepositoryError> {
    Ok(WorkflowRow {
        workflow_exec_id: row.try_get("workflow_exec_id")?,
        workflow_id: row.try_get("workflow_id")?,
        status: row.try_get("status")?,
        usage: row.try_get("usage")?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl TryFrom<WorkflowRow> for WorkflowState {
    type Error = RepositoryError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        Ok(WorkflowState {
            workflow_exec_id: row.workflow_exec_id,
            workflow_id: row.workflow_id,
            status: row.status.parse::<StatusType>()?,
            usage: decode_optional::<UsageSummary>(row.usage)?,
            input: decode_optional_value(row.input)?,
            output: decode_optional_value(row.output)?,
            error: decode_optional_value(row.error)?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn upsert_state(&self, state: &WorkflowState) -> Result<(), RepositoryError>;
    async fn update_status(&self, workflow_exec_id: &str, status: StatusType) -> Result<(), RepositoryError>;
    async fn get_state(&self, workflow_exec_id: &str) -> Result<WorkflowState, RepositoryError>;
    async fn get_state_by_id(&self, workflow_exec_id: &str) -> Result<WorkflowState, RepositoryError>;
    async fn get_state_by_task_id(&self, task_id: &str) -> Result<WorkflowState, RepositoryError>;
    async fn get_state_by_agent_id(&self, agent_id: &str) -> Result<WorkflowState, RepositoryError>;
    async fn get_state_by_tool_id(&self, tool_id: &str) -> Result<WorkflowState, RepositoryError>;
    async fn list_states(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowState>, RepositoryError>;
    async fn merge_usage(&self, workflow_exec_id: &str, delta: &UsageSummary, max_attempts: u32) -> Result<UsageSummary, RepositoryError>;
    async fn complete_workflow(
        &self,
        workflow_exec_id: &str,
        transformer: Option<&OutputTransformer>,
        max_depth: u32,
        max_attempts: u32,
    ) -> Result<WorkflowState, RepositoryError>;
}

/// Concrete SQLite-backed [`WorkflowRepository`].
pub struct SqliteWorkflowRepository {
    pool: SqlitePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn get_state_where(&self, clause: &str, bind: &str) -> Result<WorkflowState, RepositoryError> {
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflow_states WHERE {clause} LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(bind)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| RepositoryError::WorkflowNotFound(bind.to_string()))?;
        workflow_row_from(&row)?.try_into()
    }
}

#[async_trait]
impl WorkflowRepository for SqliteWorkflowRepository {
    async fn upsert_state(&self, state: &WorkflowState) -> Result<(), RepositoryError> {
        upsert_workflow_state(self.pool(), state).await
    }

    async fn update_status(&self, workflow_exec_id: &str, status: StatusType) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_states SET status = ?, updated_at = ? WHERE workflow_exec_id = ?",
        )
        .bind(status.as_str())
        .bind(format_timestamp(&chrono::Utc::now()))
        .bind(workflow_exec_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::WorkflowNotFound(workflow_exec_id.to_string()));
        }
        Ok(())
    }

    async fn get_state(&self, workflow_exec_id: &str) -> Result<WorkflowState, RepositoryError> {
        self.get_state_where("workflow_exec_id = ?", workflow_exec_id).await
    }

    async fn get_state_by_id(&self, workflow_exec_id: &str) -> Result<WorkflowState, RepositoryError> {
        self.get_state(workflow_exec_id).await
    }

    async fn get_state_by_task_id(&self, task_id: &str) -> Result<WorkflowState, RepositoryError> {
        let sql = "SELECT workflow_exec_id FROM task_states WHERE task_id = ? ORDER BY created_at DESC LIMIT 1";
        let workflow_exec_id: String = sqlx::query_scalar(sql)
            .bind(task_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| RepositoryError::WorkflowNotFound(format!("no workflow for task_id {task_id}")))?;
        self.get_state(&workflow_exec_id).await
    }

    async fn get_state_by_agent_id(&self, agent_id: &str) -> Result<WorkflowState, RepositoryError> {
        let sql = "SELECT workflow_exec_id FROM task_states WHERE agent_id = ? ORDER BY created_at DESC LIMIT 1";
        let workflow_exec_id: String = sqlx::query_scalar(sql)
            .bind(agent_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| RepositoryError::WorkflowNotFound(format!("no workflow for agent_id {agent_id}")))?;
        self.get_state(&workflow_exec_id).await
    }

    async fn get_state_by_tool_id(&self, tool_id: &str) -> Result<WorkflowState, RepositoryError> {
        let sql = "SELECT workflow_exec_id FROM task_states WHERE tool_id = ? ORDER BY created_at DESC LIMIT 1";
        let workflow_exec_id: String = sqlx::query_scalar(sql)
            .bind(tool_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| RepositoryError::WorkflowNotFound(format!("no workflow for tool_id {tool_id}")))?;
        self.get_state(&workflow_exec_id).await
    }

    async fn list_states(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowState>, RepositoryError> {
        let (where_clause, binds) = filter.render();
        let sql = format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflow_states{where_clause} ORDER BY created_at DESC"
        );
        let mut query = sqlx::query(&sql);
        for b in binds {
            query = query.bind(b);
        }
        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(|r| workflow_row_from(r)?.try_into()).collect()
    }

    async fn merge_usage(&self, workflow_exec_id: &str, delta: &UsageSummary, max_attempts: u32) -> Result<UsageSummary, RepositoryError> {
        crate::retry::with_retry(self.pool(), max_attempts, move |mut tx| {
            let delta = delta.clone();
            let workflow_exec_id = workflow_exec_id.to_string();
            async move {
                let merged = merge_workflow_usage_in_tx(&mut tx, &workflow_exec_id, &delta).await?;
                Ok((tx, merged))
            }
        })
        .await
    }

    async fn complete_workflow(
        &self,
        workflow_exec_id: &str,
        transformer: Option<&OutputTransformer>,
        max_depth: u32,
        max_attempts: u32,
    ) -> Result<WorkflowState, RepositoryError> {
        crate::retry::with_retry(self.pool(), max_attempts, move |mut tx| {
            let workflow_exec_id = workflow_exec_id.to_string();
            async move {
                let state = run_completion(&mut tx, &workflow_exec_id, transformer, max_depth).await?;
                Ok((tx, state))
            }
        })
        .await
    }
}

/// Insert-or-update keyed on `workflow_exec_id`, preserving `created_at` on update.
pub(crate) async fn upsert_workflow_state(pool: &SqlitePool, state: &WorkflowState) -> Result<(), RepositoryError> {
    let usage = encode_optional(&state.usage)?;
    let input = encode_optional_value(&state.input)?;
    let output = encode_optional_value(&state.output)?;
    let error = encode_optional_value(&state.error)?;
    let created_at = format_timestamp(&state.created_at);
    let updated_at = format_timestamp(&state.updated_at);

    sqlx::query(
        "INSERT INTO workflow_states (
            workflow_exec_id, workflow_id, status, usage, input, output, error, created_at, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(workflow_exec_id) DO UPDATE SET
            workflow_id = excluded.workflow_id,
            status = excluded.status,
            usage = excluded.usage,
            input = excluded.input,
            output = excluded.output,
            error = excluded.error,
            updated_at = excluded.updated_at",
    )
    .bind(&state.workflow_exec_id)
    .bind(&state.workflow_id)
    .bind(state.status.as_str())
    .bind(&usage)
    .bind(&input)
    .bind(&output)
    .bind(&error)
    .bind(&created_at)
    .bind(&updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

async fn merge_workflow_usage_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    workflow_exec_id: &str,
    delta: &UsageSummary,
) -> Result<UsageSummary, RepositoryError> {
    let raw: Option<String> = sqlx::query_scalar("SELECT usage FROM workflow_states WHERE workflow_exec_id = ?")
        .bind(workflow_exec_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify_busy)?
        .ok_or_else(|| RepositoryError::WorkflowNotFound(workflow_exec_id.to_string()))?;

    let mut current = decode_optional::<UsageSummary>(raw)?.unwrap_or_default();
    let mut delta = delta.clone();
    delta.sort();
    current.merge_all(&delta);
    current.sort();

    let encoded = encode_optional(&Some(current.clone()))?;
    sqlx::query("UPDATE workflow_states SET usage = ? WHERE workflow_exec_id = ?")
        .bind(&encoded)
        .bind(workflow_exec_id)
        .execute(&mut *tx)
        .await
        .map_err(classify_busy)?;

    Ok(current)
}

/// The seven-step completion protocol, run inside the transaction supplied by the
/// busy-retry wrapper.
async fn run_completion(
    tx: &mut Transaction<'_, Sqlite>,
    workflow_exec_id: &str,
    transformer: Option<&OutputTransformer>,
    max_depth: u32,
) -> Result<WorkflowState, RepositoryError> {
    // Step 1 (read half): existence check, no lock held yet. The row's trigger
    // bumps `updated_at` on any UPDATE that leaves `updated_at` looking untouched
    // (see the migration), so the lock below must not run until we know we are
    // actually going to mutate the row.
    let row = sqlx::query(&format!(
        "SELECT {WORKFLOW_COLUMNS} FROM workflow_states WHERE workflow_exec_id = ?"
    ))
    .bind(workflow_exec_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(classify_busy)?
    .ok_or_else(|| RepositoryError::WorkflowNotFound(workflow_exec_id.to_string()))?;
    let mut workflow: WorkflowState = workflow_row_from(&row)?.try_into()?;

    // Step 2: idempotence. Already-terminal workflows are returned unchanged, with
    // no write of any kind against the row.
    if matches!(workflow.status, StatusType::Success | StatusType::Failed) {
        return Ok(workflow);
    }

    // Step 1 (lock half): a no-op UPDATE escalates the transaction to a RESERVED
    // lock on this row, preventing a lost-update race between two concurrent
    // completers. Any completer that raced us into terminal state between the read
    // above and this lock will be caught by the commit-time snapshot check and
    // retried from scratch, landing back on the idempotence check above.
    let touched = sqlx::query(
        "UPDATE workflow_states SET updated_at = updated_at WHERE workflow_exec_id = ?",
    )
    .bind(workflow_exec_id)
    .execute(&mut *tx)
    .await
    .map_err(classify_busy)?;

    if touched.rows_affected() == 0 {
        return Err(RepositoryError::WorkflowNotFound(workflow_exec_id.to_string()));
    }

    let row = sqlx::query(&format!(
        "SELECT {WORKFLOW_COLUMNS} FROM workflow_states WHERE workflow_exec_id = ?"
    ))
    .bind(workflow_exec_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(classify_busy)?
    .ok_or_else(|| RepositoryError::WorkflowNotFound(workflow_exec_id.to_string()))?;
    workflow = workflow_row_from(&row)?.try_into()?;

    if matches!(workflow.status, StatusType::Success | StatusType::Failed) {
        return Ok(workflow);
    }

    // Step 3: task materialization via recursive CTE seeded at root tasks.
    let tasks = load_task_forest(tx, workflow_exec_id, max_depth).await?;
    let roots: Vec<&TaskState> = tasks.values().filter(|t| t.is_root()).collect();

    // Step 4: final-status determination over root tasks only.
    if roots.iter().any(|t| t.status.is_running_like()) {
        return Err(RepositoryError::WorkflowNotReady(workflow_exec_id.to_string()));
    }
    let mut final_status = if roots.iter().any(|t| t.status.is_failing_like()) {
        StatusType::Failed
    } else {
        StatusType::Success
    };

    let task_map: BTreeMap<String, TaskState> = tasks.into_iter().map(|t| (t.task_id.clone(), t)).collect();
    let deterministic_output = deterministic_output_map(&task_map);

    // Step 5: output projection.
    let mut error_value: Option<serde_json::Value> = None;
    let output_value = if let Some(transform) = transformer {
        match transform(&workflow, &task_map) {
            Ok(output) => output,
            Err(message) => {
                final_status = StatusType::Failed;
                error_value = Some(serde_json::json!({
                    "code": "OUTPUT_TRANSFORMATION_FAILED",
                    "message": message,
                }));
                deterministic_output.clone()
            }
        }
    } else {
        deterministic_output
    };

    // Step 6: atomic write-back.
    let now = format_timestamp(&chrono::Utc::now());
    let encoded_output = encode_optional_value(&Some(output_value))?;
    let encoded_error = encode_optional_value(&error_value)?;

    let updated = sqlx::query(
        "UPDATE workflow_states SET output = ?, status = ?, error = ?, updated_at = ? WHERE workflow_exec_id = ?",
    )
    .bind(&encoded_output)
    .bind(final_status.as_str())
    .bind(&encoded_error)
    .bind(&now)
    .bind(workflow_exec_id)
    .execute(&mut *tx)
    .await
    .map_err(classify_busy)?;

    if updated.rows_affected() == 0 {
        return Err(RepositoryError::WorkflowNotFound(workflow_exec_id.to_string()));
    }

    workflow.status = final_status;

    // Step 7: reload and return within the same transaction.
    reload(tx, workflow_exec_id).await
}

async fn reload(tx: &mut Transaction<'_, Sqlite>, workflow_exec_id: &str) -> Result<WorkflowState, RepositoryError> {
    let row = sqlx::query(&format!(
        "SELECT {WORKFLOW_COLUMNS} FROM workflow_states WHERE workflow_exec_id = ?"
    ))
    .bind(workflow_exec_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(classify_busy)?
    .ok_or_else(|| RepositoryError::WorkflowNotFound(workflow_exec_id.to_string()))?;
    workflow_row_from(&row)?.try_into()
}

async fn load_task_forest(
    tx: &mut Transaction<'_, Sqlite>,
    workflow_exec_id: &str,
    max_depth: u32,
) -> Result<Vec<TaskState>, RepositoryError> {
    let sql = format!(
        "WITH RECURSIVE forest(task_exec_id, depth) AS (
            SELECT task_exec_id, 0 FROM task_states
            WHERE workflow_exec_id = ? AND parent_state_id IS NULL
            UNION ALL
            SELECT t.task_exec_id, forest.depth + 1
            FROM task_states t
            JOIN forest ON t.parent_state_id = forest.task_exec_id
            WHERE forest.depth + 1 <= ?
        )
        SELECT task_exec_id, component, status, task_id, workflow_exec_id, workflow_id,
               execution_type, usage, agent_id, tool_id, action_id, parent_state_id,
               input, output, error, created_at, updated_at
        FROM task_states
        JOIN forest USING (task_exec_id)
        ORDER BY forest.depth ASC, task_states.created_at ASC"
    );

    let rows = sqlx::query(&sql)
        .bind(workflow_exec_id)
        .bind(max_depth as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(classify_busy)?;

    rows.iter().map(|row| task_row_from(row)?.try_into()).collect()
}

/// Deterministic fallback output used when no transformer is supplied: root task
/// ids sorted lexicographically, each mapped to `{output, parent_state_id?,
/// execution_type?}`.
fn deterministic_output_map(tasks: &BTreeMap<String, TaskState>) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (task_id, state) in tasks.iter().filter(|(_, t)| t.is_root()) {
        let mut entry = serde_json::Map::new();
        entry.insert("output".to_string(), state.output.clone().unwrap_or(serde_json::Value::Null));
        if let Some(parent) = &state.parent_state_id {
            entry.insert("parent_state_id".to_string(), serde_json::Value::String(parent.clone()));
        }
        if state.execution_type.as_str() == "parallel" {
            entry.insert("execution_type".to_string(), serde_json::Value::String("parallel".to_string()));
        }
        map.insert(task_id.clone(), serde_json::Value::Object(entry));
    }
    serde_json::Value::Object(map)
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
    use crate::models::{ComponentType, ExecutionType, UsageEntry};
    use crate::repositories::task::upsert_task_state;
    use sqlx::sqlite::SqlitePoolOptions;
    use uuid::Uuid;

    async fn pool_with_workflow(workflow_exec_id: &str) -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        migrations::apply(&pool).await.unwrap();
        let state = WorkflowState::new(workflow_exec_id, "wf-1", StatusType::Running);
        upsert_workflow_state(&pool, &state).await.unwrap();
        pool
    }

    fn new_root_task(task_id: &str, workflow_exec_id: &str, status: StatusType) -> TaskState {
        let mut task = TaskState::new(
            Uuid::new_v4().to_string(),
            ComponentType::Task,
            status,
            task_id,
            workflow_exec_id,
            "wf-1",
            ExecutionType::Basic,
        );
        task.output = Some(serde_json::json!({ "value": 1 }));
        task
    }

    #[tokio::test]
    async fn upsert_then_get() {
        let pool = pool_with_workflow("wfx-1").await;
        let repo = SqliteWorkflowRepository::new(pool);
        let state = repo.get_state("wfx-1").await.unwrap();
        assert_eq!(state.status, StatusType::Running);
    }

    #[tokio::test]
    async fn list_states_filters_by_status() {
        let pool = pool_with_workflow("wfx-1").await;
        let success = WorkflowState::new("wfx-2", "wf-2", StatusType::Success);
        upsert_workflow_state(&pool, &success).await.unwrap();

        let repo = SqliteWorkflowRepository::new(pool);
        let result = repo
            .list_states(&WorkflowFilter::new().with_status(StatusType::Success))
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].workflow_exec_id, "wfx-2");
    }

    #[tokio::test]
    async fn complete_workflow_happy_path_builds_deterministic_output() {
        let pool = pool_with_workflow("wfx-2").await;
        upsert_task_state(&pool, &new_root_task("t1", "wfx-2", StatusType::Success)).await.unwrap();

        let repo = SqliteWorkflowRepository::new(pool);
        let result = repo.complete_workflow("wfx-2", None, 100, 10).await.unwrap();

        assert_eq!(result.status, StatusType::Success);
        let output = result.output.unwrap();
        assert_eq!(output["t1"]["output"]["value"], 1);
    }

    #[tokio::test]
    async fn complete_workflow_transformer_error_forces_failed_with_fallback() {
        let pool = pool_with_workflow("wfx-3").await;
        upsert_task_state(&pool, &new_root_task("t1", "wfx-3", StatusType::Success)).await.unwrap();

        let repo = SqliteWorkflowRepository::new(pool);
        let transformer: OutputTransformer = Box::new(|_state, _tasks| Err("boom".to_string()));
        let result = repo
            .complete_workflow("wfx-3", Some(&transformer), 100, 10)
            .await
            .unwrap();

        assert_eq!(result.status, StatusType::Failed);
        assert_eq!(result.error.unwrap()["code"], "OUTPUT_TRANSFORMATION_FAILED");
        assert_eq!(result.output.unwrap()["t1"]["output"]["value"], 1);
    }

    #[tokio::test]
    async fn complete_workflow_not_ready_while_root_running() {
        let pool = pool_with_workflow("wfx-4").await;
        upsert_task_state(&pool, &new_root_task("t1", "wfx-4", StatusType::Running)).await.unwrap();

        let repo = SqliteWorkflowRepository::new(pool);
        let err = repo.complete_workflow("wfx-4", None, 100, 10).await.unwrap_err();
        assert!(matches!(err, RepositoryError::WorkflowNotReady(_)));

        let state = repo.get_state("wfx-4").await.unwrap();
        assert_eq!(state.status, StatusType::Running);
    }

    #[tokio::test]
    async fn complete_workflow_is_idempotent_once_terminal() {
        let pool = pool_with_workflow("wfx-5").await;
        upsert_task_state(&pool, &new_root_task("t1", "wfx-5", StatusType::Success)).await.unwrap();

        let repo = SqliteWorkflowRepository::new(pool);
        let first = repo.complete_workflow("wfx-5", None, 100, 10).await.unwrap();
        let second = repo.complete_workflow("wfx-5", None, 100, 10).await.unwrap();
        assert_eq!(first.output, second.output);
        assert_eq!(second.status, StatusType::Success);
        assert_eq!(first.updated_at, second.updated_at, "re-completing a terminal workflow must not touch it");
    }

    #[tokio::test]
    async fn complete_workflow_zero_tasks_succeeds_with_empty_output() {
        let pool = pool_with_workflow("wfx-6").await;
        let repo = SqliteWorkflowRepository::new(pool);
        let result = repo.complete_workflow("wfx-6", None, 100, 10).await.unwrap();
        assert_eq!(result.status, StatusType::Success);
        assert_eq!(result.output.unwrap(), serde_json::json!({}));
    }

    #[tokio::test]
    async fn merge_usage_accumulates() {
        let pool = pool_with_workflow("wfx-7").await;
        let repo = SqliteWorkflowRepository::new(pool);
        repo.merge_usage("wfx-7", &UsageSummary::single(UsageEntry::new("openai", "gpt-4", 5, 5)), 10)
            .await
            .unwrap();
        let merged = repo
            .merge_usage("wfx-7", &UsageSummary::single(UsageEntry::new("openai", "gpt-4", 1, 1)), 10)
            .await
            .unwrap();
        assert_eq!(merged.0[0].effective_total(), 12);
    }
}
