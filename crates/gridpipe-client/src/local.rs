//! File-based development backend.
//!
//! Tables are JSONL files mirrored under `<root>/store/` by their logical
//! path; structured queries run in an in-memory DuckDB session; jobs are
//! spawned as `bash` subprocesses inside `<root>/sandbox/` directories with
//! stderr collected under `<root>/logs/`. The root is exclusive to one
//! running pipeline instance; no locking is provided.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use gridpipe_duck::{EngineError, TableEngine};
use gridpipe_ir::{local, QueryOp, Row, TablePath};
use tracing::{debug, info};

use crate::client::{GridClient, RowStream};
use crate::error::ClientError;
use crate::jobs::{
    JobOutcome, MapJobSpec, OperationHandle, SandboxFile, SandboxSource, VanillaJobSpec,
};
use crate::rows;

pub struct LocalClient {
    root: PathBuf,
    operations: RefCell<HashMap<String, RunningOperation>>,
}

struct RunningOperation {
    child: Child,
    /// Worker output file promoted to this table on success.
    finalize: Option<(PathBuf, TablePath)>,
    log: PathBuf,
}

impl LocalClient {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ClientError> {
        let root = root.into();
        fs::create_dir_all(root.join("store"))?;
        fs::create_dir_all(root.join("sandbox"))?;
        fs::create_dir_all(root.join("logs"))?;
        Ok(Self {
            root,
            operations: RefCell::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn segments(path: &TablePath) -> Result<Vec<&str>, ClientError> {
        let parts: Vec<&str> = path
            .as_str()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            return Err(ClientError::Validation(format!(
                "empty table path: {}",
                path
            )));
        }
        if parts.iter().any(|s| *s == "..") {
            return Err(ClientError::Validation(format!(
                "table path escapes the storage root: {}",
                path
            )));
        }
        Ok(parts)
    }

    /// Physical file of a table: the logical path mirrored under the store
    /// with a `.jsonl` extension.
    fn table_file(&self, path: &TablePath) -> Result<PathBuf, ClientError> {
        let parts = Self::segments(path)?;
        let mut file = self.root.join("store");
        for part in &parts[..parts.len() - 1] {
            file.push(part);
        }
        file.push(format!("{}.jsonl", parts[parts.len() - 1]));
        Ok(file)
    }

    /// Physical location of a staged file or directory node.
    fn plain_file(&self, path: &TablePath) -> Result<PathBuf, ClientError> {
        let parts = Self::segments(path)?;
        let mut file = self.root.join("store");
        for part in parts {
            file.push(part);
        }
        Ok(file)
    }

    fn existing_table_file(&self, path: &TablePath) -> Result<PathBuf, ClientError> {
        let file = self.table_file(path)?;
        if !file.is_file() {
            return Err(ClientError::Validation(format!("table not found: {}", path)));
        }
        Ok(file)
    }

    fn sandbox_dir(&self, title: &str) -> Result<PathBuf, ClientError> {
        let dir = self.root.join("sandbox").join(format!(
            "{}-{}",
            sanitize(title),
            short_id()
        ));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn log_file(&self, name: &str) -> Result<File, ClientError> {
        Ok(File::create(self.root.join("logs").join(format!("{}.log", sanitize(name))))?)
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.root.join("logs").join(format!("{}.log", sanitize(name)))
    }

    /// Copy sandbox files in and collect the environment additions they
    /// advertise.
    fn stage_files(
        &self,
        sandbox: &Path,
        files: &[SandboxFile],
        env: &mut BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        for file in files {
            let source = match &file.source {
                SandboxSource::Staged(path) => {
                    let staged = self.plain_file(path)?;
                    if !staged.is_file() {
                        return Err(ClientError::Validation(format!(
                            "staged file not found: {}",
                            path
                        )));
                    }
                    staged
                }
                SandboxSource::Local(path) => {
                    if !path.is_file() {
                        return Err(ClientError::Validation(format!(
                            "sandbox file not found: {}",
                            path.display()
                        )));
                    }
                    path.clone()
                }
            };
            let dest = sandbox.join(&file.name);
            fs::copy(&source, &dest)?;
            if let Some(var) = &file.env_var {
                env.insert(var.clone(), dest.display().to_string());
            }
        }
        Ok(())
    }

    fn check_entry(entry: &Path) -> Result<(), ClientError> {
        if !entry.is_file() {
            return Err(ClientError::Validation(format!(
                "entry script not found: {}",
                entry.display()
            )));
        }
        Ok(())
    }

    fn track(&self, op: RunningOperation) -> OperationHandle {
        let id = short_id();
        self.operations.borrow_mut().insert(id.clone(), op);
        OperationHandle { id }
    }
}

impl GridClient for LocalClient {
    fn create_path(&self, path: &TablePath) -> Result<(), ClientError> {
        fs::create_dir_all(self.plain_file(path)?)?;
        Ok(())
    }

    fn exists(&self, path: &TablePath) -> Result<bool, ClientError> {
        Ok(self.table_file(path)?.is_file() || self.plain_file(path)?.exists())
    }

    fn write_table(&self, path: &TablePath, rows: &[Row], append: bool) -> Result<(), ClientError> {
        rows::write_jsonl(&self.table_file(path)?, rows, append)
    }

    fn read_table(&self, path: &TablePath) -> Result<RowStream, ClientError> {
        let file = self.existing_table_file(path)?;
        Ok(Box::new(rows::stream_jsonl(&file)?))
    }

    fn row_count(&self, path: &TablePath) -> Result<u64, ClientError> {
        let file = self.existing_table_file(path)?;
        rows::count_rows(&file)
    }

    fn query(&self, op: &QueryOp, dry_run: bool) -> Result<Option<String>, ClientError> {
        let plan = local::plan(op)?;
        if dry_run {
            return Ok(Some(plan.sql));
        }

        let engine = TableEngine::new().map_err(EngineError::Database)?;
        for binding in &plan.inputs {
            let file = self.existing_table_file(&binding.path)?;
            engine.load_table(&binding.table, &file)?;
        }
        let result = engine.run(&plan.sql)?;
        self.write_table(&plan.output, &result.to_rows(), false)?;

        info!(op = op.kind(), output = %plan.output, rows = result.row_count, "query executed");
        Ok(None)
    }

    fn submit_map(&self, spec: &MapJobSpec) -> Result<OperationHandle, ClientError> {
        Self::check_entry(&spec.entry)?;
        let input = self.existing_table_file(&spec.input)?;

        let sandbox = self.sandbox_dir(&spec.title)?;
        let mut env = spec.env.clone();
        self.stage_files(&sandbox, &spec.files, &mut env)?;

        let output = sandbox.join("out.jsonl");
        let log_name = spec.output.basename().to_string();
        let log = self.log_file(&log_name)?;

        // Replica count is forced to 1 here: one worker streams the whole
        // table through its standard streams.
        debug!(title = %spec.title, sandbox = %sandbox.display(), "spawning map worker");
        let child = Command::new("bash")
            .arg(&spec.entry)
            .current_dir(&sandbox)
            .envs(&env)
            .stdin(Stdio::from(File::open(&input)?))
            .stdout(Stdio::from(File::create(&output)?))
            .stderr(Stdio::from(log))
            .spawn()?;

        Ok(self.track(RunningOperation {
            child,
            finalize: Some((output, spec.output.clone())),
            log: self.log_path(&log_name),
        }))
    }

    fn submit_vanilla(&self, spec: &VanillaJobSpec) -> Result<OperationHandle, ClientError> {
        Self::check_entry(&spec.entry)?;

        let sandbox = self.sandbox_dir(&spec.title)?;
        let mut env = spec.env.clone();
        self.stage_files(&sandbox, &spec.files, &mut env)?;

        let log = self.log_file(&spec.title)?;
        let stdout = log.try_clone()?;

        debug!(title = %spec.title, sandbox = %sandbox.display(), "spawning vanilla worker");
        let child = Command::new("bash")
            .arg(&spec.entry)
            .current_dir(&sandbox)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(log))
            .spawn()?;

        Ok(self.track(RunningOperation {
            child,
            finalize: None,
            log: self.log_path(&spec.title),
        }))
    }

    fn wait_operation(&self, handle: &OperationHandle) -> Result<JobOutcome, ClientError> {
        let mut op = self
            .operations
            .borrow_mut()
            .remove(&handle.id)
            .ok_or_else(|| {
                ClientError::Validation(format!("unknown operation handle: {}", handle.id))
            })?;

        let status = op.child.wait()?;
        if !status.success() {
            let reason = match status.code() {
                Some(code) => format!("exit status {}", code),
                None => "terminated by signal".to_string(),
            };
            return Ok(JobOutcome::failure(
                1,
                format!("worker failed ({}); log: {}", reason, op.log.display()),
            ));
        }

        if let Some((worker_output, table)) = op.finalize.take() {
            let dest = self.table_file(&table)?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&worker_output, &dest)?;
        }
        Ok(JobOutcome::success())
    }

    fn upload_file(&self, local: &Path, remote: &TablePath) -> Result<(), ClientError> {
        if !local.is_file() {
            return Err(ClientError::Validation(format!(
                "upload source not found: {}",
                local.display()
            )));
        }
        rows::copy_replace(local, &self.plain_file(remote)?)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
