//! TollGate error taxonomy.
//!
//! Throttling errors are retryable; size-limit errors are not (the caller
//! must change the request). `Timeout` is raised when a request's deadline
//! expires while it is waiting on admission, and is deliberately distinct
//! from throttling.

use std::time::Duration;

use thiserror::Error;

use crate::types::{TableId, TenantId};

/// Result type alias for admission decisions.
pub type AdmissionResult<T> = Result<T, AdmissionError>;

/// Errors surfaced by the admission-control subsystem.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("read throttled on table {table}, retry after {retry_after:?}")]
    ReadThrottling {
        table: TableId,
        retry_after: Duration,
    },

    #[error("write throttled on table {table}, retry after {retry_after:?}")]
    WriteThrottling {
        table: TableId,
        retry_after: Duration,
    },

    #[error("operation rate exceeded for tenant {tenant}: {operation}")]
    OperationThrottling {
        tenant: TenantId,
        operation: String,
    },

    #[error("request size {actual} bytes exceeds the {limit} byte limit")]
    RequestSizeLimit { actual: u64, limit: u64 },

    #[error("row size {actual} bytes exceeds the {limit} byte limit")]
    RowSizeLimit { actual: u64, limit: u64 },

    #[error("key size {actual} bytes exceeds the {limit} byte limit")]
    KeySizeLimit { actual: u64, limit: u64 },

    #[error("batch of {actual} operations exceeds the {limit} operation limit")]
    BatchOperationNumberLimit { actual: u32, limit: u32 },

    #[error("deadline expired while waiting for admission on table {table}")]
    Timeout { table: TableId },
}

impl AdmissionError {
    /// Whether the caller may retry the same request unchanged.
    ///
    /// Size-limit violations require the caller to modify the request;
    /// a timeout means the request's own deadline is already gone.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            AdmissionError::ReadThrottling { .. }
                | AdmissionError::WriteThrottling { .. }
                | AdmissionError::OperationThrottling { .. }
        )
    }

    /// Whether this error is a throttling signal (capacity, not validity).
    pub fn is_throttling(&self) -> bool {
        matches!(
            self,
            AdmissionError::ReadThrottling { .. }
                | AdmissionError::WriteThrottling { .. }
                | AdmissionError::OperationThrottling { .. }
        )
    }
}
