//! Embedded SQLite persistence layer for the workflow orchestration engine.
//!
//! Owns the connection lifecycle ([`store::Store`]), the schema and its migrations
//! ([`migrations`]), the JSON column codec ([`json`]), the domain model
//! ([`models`]), and the per-aggregate repositories ([`repositories`]) that
//! implement the read/write/completion protocols against that schema.
pub mod config;
pub mod errors;
pub mod json;
pub mod migrations;
pub mod models;
pub mod repositories;
pub mod retry;
pub mod secrets;
pub mod store;

pub use config::StoreConfig;
pub use errors::{MigrationError, RepositoryError, RepositoryResult, StoreError, StoreResult};
pub use models::{
    ApiKey, ComponentType, ExecutionType, ProgressInfo, StatusType, TaskState, UsageEntry, UsageSummary, User,
    UserRole, WorkflowState,
};
pub use repositories::{
    AuthRepository, OutputTransformer, Repositories, SqliteAuthRepository, SqliteTaskRepository,
    SqliteWorkflowRepository, TaskFilter, TaskRepository, TaskTx, WorkflowFilter, WorkflowRepository,
};
pub use store::Store;
