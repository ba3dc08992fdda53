//! Backend-agnostic client contract.

use std::path::Path;

use gridpipe_ir::{QueryOp, Row, TablePath};

use crate::error::ClientError;
use crate::jobs::{JobOutcome, MapJobSpec, OperationHandle, VanillaJobSpec};

/// Lazy sequence of table rows.
pub type RowStream = Box<dyn Iterator<Item = Result<Row, ClientError>>>;

/// Table I/O, structured queries, and job submission against one backend.
///
/// Call sites depend only on this trait; the backend is chosen once at
/// startup from the mode setting. All operations address tables by logical
/// slash-delimited path, resolved to physical storage by the backend.
pub trait GridClient {
    /// Create a directory-like node. Recursive and idempotent.
    fn create_path(&self, path: &TablePath) -> Result<(), ClientError>;

    fn exists(&self, path: &TablePath) -> Result<bool, ClientError>;

    /// Write rows to a table. Replace semantics unless `append`; a replaced
    /// table becomes visible atomically, never partially written.
    fn write_table(&self, path: &TablePath, rows: &[Row], append: bool) -> Result<(), ClientError>;

    fn read_table(&self, path: &TablePath) -> Result<RowStream, ClientError>;

    fn row_count(&self, path: &TablePath) -> Result<u64, ClientError>;

    /// Run a structured query. With `dry_run` the generated statement text is
    /// returned without executing and without side effects; otherwise the
    /// statement is executed and the output table is replaced only on
    /// success. The text returned by a dry run is the exact text executed,
    /// produced by the same translation function.
    fn query(&self, op: &QueryOp, dry_run: bool) -> Result<Option<String>, ClientError>;

    fn submit_map(&self, spec: &MapJobSpec) -> Result<OperationHandle, ClientError>;

    fn submit_vanilla(&self, spec: &VanillaJobSpec) -> Result<OperationHandle, ClientError>;

    /// Block until the operation reaches a terminal state. Job-level failure
    /// comes back as a failed outcome, not an error.
    fn wait_operation(&self, handle: &OperationHandle) -> Result<JobOutcome, ClientError>;

    /// Stage a local file at a backend path, creating parents as needed.
    fn upload_file(&self, local: &Path, remote: &TablePath) -> Result<(), ClientError>;
}
