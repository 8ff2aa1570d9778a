//! Upstream client abstraction.
//!
//! Collectors never talk to the driver directly; they go through
//! [`DiagnosticClient`], which is implemented by [`MongoClient`] in production
//! and by [`MockClient`](crate::mock::MockClient) in tests. Every call carries
//! its own timeout; implementations must be safe to share across threads.

mod mongo;

use std::time::Duration;

use mongodb::bson::Document;

pub use mongo::{AuthMechanism, ConnectionSettings, MongoClient, TlsSettings};

/// Server error code for "replication is not enabled".
pub const NO_REPLICATION_ENABLED: i32 = 76;

/// Error type for upstream queries.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// The server rejected or failed the command.
    Command { code: Option<i32>, message: String },
    /// The query exceeded its deadline.
    Timeout(String),
    /// The exporter is shutting down and no longer issues queries.
    Cancelled,
    /// Connection, authentication or server selection failed.
    Connection(String),
}

impl ClientError {
    pub fn command(message: impl Into<String>) -> Self {
        ClientError::Command {
            code: None,
            message: message.into(),
        }
    }

    /// True for the error a standalone server returns to replication status
    /// queries. Expected on non-replicated deployments.
    pub fn is_not_replica_set(&self) -> bool {
        match self {
            ClientError::Command { code, message } => {
                *code == Some(NO_REPLICATION_ENABLED)
                    || message.contains("not running with --replSet")
                    || message.contains("NoReplicationEnabled")
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Command {
                code: Some(code),
                message,
            } => write!(f, "command failed ({}): {}", code, message),
            ClientError::Command { code: None, message } => {
                write!(f, "command failed: {}", message)
            }
            ClientError::Timeout(msg) => write!(f, "query timed out: {}", msg),
            ClientError::Cancelled => write!(f, "query cancelled: shutting down"),
            ClientError::Connection(msg) => write!(f, "connection error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

/// Options for [`DiagnosticClient::find`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<Document>,
    pub limit: Option<i64>,
}

/// Read-only administrative access to one server.
pub trait DiagnosticClient: Send + Sync {
    /// Runs `command` against `database`.
    fn run_command(
        &self,
        database: &str,
        command: Document,
        timeout: Duration,
    ) -> Result<Document, ClientError>;

    fn list_database_names(&self, timeout: Duration) -> Result<Vec<String>, ClientError>;

    fn list_collection_names(
        &self,
        database: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, ClientError>;

    fn find(
        &self,
        database: &str,
        collection: &str,
        filter: Document,
        options: FindOptions,
        timeout: Duration,
    ) -> Result<Vec<Document>, ClientError>;

    fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: Vec<Document>,
        timeout: Duration,
    ) -> Result<Vec<Document>, ClientError>;

    /// Round-trip check used by the health endpoint.
    fn ping(&self, timeout: Duration) -> Result<(), ClientError>;
}
