//! Cluster backend driven over the managed HTTP API.
//!
//! Table I/O, structured queries, and operations all go through a small set
//! of REST endpoints. The HTTP verbs sit behind `ClusterTransport` so tests
//! can swap in a recording fake and assert the exact wire shapes.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use gridpipe_ir::{remote, QueryOp, Row, TablePath};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::client::{GridClient, RowStream};
use crate::error::ClientError;
use crate::jobs::{
    ImageSpec, JobOutcome, JobState, MapJobSpec, OperationHandle, ResourceSpec, SandboxFile,
    SandboxSource, VanillaJobSpec,
};
use crate::rows;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport for the cluster's REST API.
pub trait ClusterTransport {
    /// GET a JSON document. `None` when the resource does not exist.
    fn get_json(&self, path: &str) -> Result<Option<Value>, ClientError>;

    /// GET a plain text body. `None` when the resource does not exist.
    fn get_text(&self, path: &str) -> Result<Option<String>, ClientError>;

    fn post_json(&self, path: &str, body: &Value) -> Result<Value, ClientError>;

    fn put_bytes(&self, path: &str, body: &[u8]) -> Result<(), ClientError>;
}

/// `ureq`-backed transport with bearer-token auth. Transfer failures are
/// surfaced as `ClientError::Transport` and never retried here.
pub struct HttpTransport {
    agent: ureq::Agent,
    base_url: Url,
    token: String,
}

impl HttpTransport {
    pub fn new(
        endpoint: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let base_url = Url::parse(endpoint).map_err(|err| {
            ClientError::Configuration(format!("invalid cluster endpoint: {}", err))
        })?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();

        Ok(Self {
            agent,
            base_url,
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        // Strip one leading slash so an endpoint with a base path keeps it.
        self.base_url
            .join(path.strip_prefix('/').unwrap_or(path))
            .map_err(|err| {
                ClientError::Transport(format!("failed to build URL for {}: {}", path, err))
            })
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        self.agent
            .request(method, url.as_str())
            .set("Authorization", format!("Bearer {}", self.token).as_str())
    }

    fn call_optional(request: ureq::Request) -> Result<Option<ureq::Response>, ClientError> {
        match request.call() {
            Ok(response) => Ok(Some(response)),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(ureq::Error::Status(code, resp)) => Err(ClientError::Transport(format!(
                "request failed with status {}: {}",
                code,
                resp.into_string().unwrap_or_default()
            ))),
            Err(err) => Err(ClientError::Transport(format!("request failed: {}", err))),
        }
    }
}

impl ClusterTransport for HttpTransport {
    fn get_json(&self, path: &str) -> Result<Option<Value>, ClientError> {
        let url = self.url(path)?;
        match Self::call_optional(self.request("GET", &url))? {
            Some(response) => response
                .into_json()
                .map(Some)
                .map_err(|err| ClientError::Transport(format!("failed to parse response: {}", err))),
            None => Ok(None),
        }
    }

    fn get_text(&self, path: &str) -> Result<Option<String>, ClientError> {
        let url = self.url(path)?;
        match Self::call_optional(self.request("GET", &url))? {
            Some(response) => response
                .into_string()
                .map(Some)
                .map_err(|err| ClientError::Transport(format!("failed to read response: {}", err))),
            None => Ok(None),
        }
    }

    fn post_json(&self, path: &str, body: &Value) -> Result<Value, ClientError> {
        let url = self.url(path)?;
        let response = self
            .request("POST", &url)
            .send_json(body.clone())
            .map_err(|err| ClientError::Transport(format!("request failed: {}", err)))?;
        response
            .into_json()
            .map_err(|err| ClientError::Transport(format!("failed to parse response: {}", err)))
    }

    fn put_bytes(&self, path: &str, body: &[u8]) -> Result<(), ClientError> {
        let url = self.url(path)?;
        self.request("PUT", &url)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(body)
            .map_err(|err| ClientError::Transport(format!("request failed: {}", err)))?;
        Ok(())
    }
}

/// Cluster-backed `GridClient`.
pub struct RemoteClient<T: ClusterTransport> {
    transport: T,
    poll_interval: Duration,
}

pub type HttpRemoteClient = RemoteClient<HttpTransport>;

impl RemoteClient<HttpTransport> {
    pub fn connect(
        endpoint: &str,
        token: impl Into<String>,
        poll_interval: Duration,
    ) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(endpoint, token, DEFAULT_TIMEOUT)?;
        Ok(Self::new(transport, poll_interval))
    }
}

impl<T: ClusterTransport> RemoteClient<T> {
    pub fn new(transport: T, poll_interval: Duration) -> Self {
        Self {
            transport,
            poll_interval,
        }
    }

    /// Poll a status resource until it reaches a terminal state.
    fn poll_terminal(&self, path: &str, what: &str) -> Result<(bool, Value), ClientError> {
        loop {
            let status = self.transport.get_json(path)?.ok_or_else(|| {
                ClientError::Transport(format!("{} not found while polling", what))
            })?;
            match status.get("state").and_then(Value::as_str) {
                Some("completed") => return Ok((true, status)),
                Some("failed") => return Ok((false, status)),
                Some("pending") | Some("running") => {}
                other => {
                    return Err(ClientError::Transport(format!(
                        "unexpected {} state: {:?}",
                        what, other
                    )))
                }
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn submit_spec(&self, spec: Value) -> Result<OperationHandle, ClientError> {
        let response = self.transport.post_json("/api/v1/operations", &spec)?;
        let id = response
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Transport("operation id missing from response".to_string()))?;
        info!(id = id, "operation submitted");
        Ok(OperationHandle { id: id.to_string() })
    }
}

fn path_query(base: &str, params: &[(&str, &str)]) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        query.append_pair(key, value);
    }
    format!("{}?{}", base, query.finish())
}

/// Build the JSON operation spec the cluster scheduler consumes.
fn operation_spec(
    kind: &str,
    title: &str,
    command: &str,
    env: &BTreeMap<String, String>,
    resources: &ResourceSpec,
    image: Option<&ImageSpec>,
    files: &[SandboxFile],
    io: Option<(&TablePath, &TablePath)>,
) -> Result<Value, ClientError> {
    resources.validate()?;

    let mut file_paths = Vec::new();
    for file in files {
        match &file.source {
            SandboxSource::Staged(path) => file_paths.push(json!({
                "path": path.as_str(),
                "name": file.name,
            })),
            SandboxSource::Local(path) => {
                return Err(ClientError::Configuration(format!(
                    "local sandbox file cannot be staged on the cluster: {}",
                    path.display()
                )))
            }
        }
    }

    let mut spec = json!({
        "kind": kind,
        "title": title,
        "command": command,
        "env": env,
        "resources": {
            "pool": resources.pool,
            "memory_limit": resources.memory_bytes(),
            "cpu_limit": resources.cpu,
            "gpu_limit": resources.gpu,
            "job_count": resources.job_count,
            "max_failed_jobs": resources.max_failed_jobs,
        },
        "files": file_paths,
    });

    if let Some(tree) = &resources.pool_tree {
        spec["resources"]["pool_tree"] = json!(tree);
    }
    if let Some(slots) = resources.user_slots {
        spec["resources"]["user_slots"] = json!(slots);
    }
    if let Some((input, output)) = io {
        spec["input"] = json!(input.as_str());
        spec["output"] = json!(output.as_str());
    }
    if let Some(image) = image {
        spec["image"] = json!(image.image);
        if let Some(auth) = &image.auth {
            spec["secure_vault"] = json!({
                "REGISTRY_USER": auth.username,
                "REGISTRY_PASSWORD": auth.password,
            });
        }
    }

    Ok(spec)
}

impl<T: ClusterTransport> GridClient for RemoteClient<T> {
    fn create_path(&self, path: &TablePath) -> Result<(), ClientError> {
        self.transport.post_json(
            "/api/v1/paths",
            &json!({ "path": path.as_str(), "recursive": true }),
        )?;
        Ok(())
    }

    fn exists(&self, path: &TablePath) -> Result<bool, ClientError> {
        let status = self
            .transport
            .get_json(&path_query("/api/v1/paths", &[("path", path.as_str())]))?;
        Ok(match status {
            Some(value) => value.get("exists").and_then(Value::as_bool).unwrap_or(true),
            None => false,
        })
    }

    fn write_table(&self, path: &TablePath, rows: &[Row], append: bool) -> Result<(), ClientError> {
        let query = path_query(
            "/api/v1/tables/rows",
            &[
                ("path", path.as_str()),
                ("append", if append { "true" } else { "false" }),
            ],
        );
        self.transport.put_bytes(&query, &rows::to_jsonl_bytes(rows)?)
    }

    fn read_table(&self, path: &TablePath) -> Result<RowStream, ClientError> {
        let query = path_query("/api/v1/tables/rows", &[("path", path.as_str())]);
        let body = self
            .transport
            .get_text(&query)?
            .ok_or_else(|| ClientError::Validation(format!("table not found: {}", path)))?;

        let lines: Vec<String> = body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        Ok(Box::new(lines.into_iter().map(|line| {
            serde_json::from_str::<Row>(&line).map_err(ClientError::from)
        })))
    }

    fn row_count(&self, path: &TablePath) -> Result<u64, ClientError> {
        let meta = self
            .transport
            .get_json(&path_query("/api/v1/tables/meta", &[("path", path.as_str())]))?
            .ok_or_else(|| ClientError::Validation(format!("table not found: {}", path)))?;
        meta.get("row_count")
            .and_then(Value::as_u64)
            .ok_or_else(|| ClientError::Transport("malformed table metadata".to_string()))
    }

    fn query(&self, op: &QueryOp, dry_run: bool) -> Result<Option<String>, ClientError> {
        let text = remote::render(op)?;
        if dry_run {
            return Ok(Some(text));
        }

        let response = self
            .transport
            .post_json("/api/v1/queries", &json!({ "query": text }))?;
        let id = response
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Transport("query id missing from response".to_string()))?;
        debug!(id = id, op = op.kind(), "query job submitted");

        let (completed, status) = self.poll_terminal(&format!("/api/v1/queries/{}", id), "query")?;
        if completed {
            info!(id = id, op = op.kind(), output = %op.output(), "query executed");
            Ok(None)
        } else {
            let message = status
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("query job failed");
            Err(ClientError::Query(message.to_string()))
        }
    }

    fn submit_map(&self, spec: &MapJobSpec) -> Result<OperationHandle, ClientError> {
        let body = operation_spec(
            "map",
            &spec.title,
            &spec.command,
            &spec.env,
            &spec.resources,
            spec.image.as_ref(),
            &spec.files,
            Some((&spec.input, &spec.output)),
        )?;
        self.submit_spec(body)
    }

    fn submit_vanilla(&self, spec: &VanillaJobSpec) -> Result<OperationHandle, ClientError> {
        let body = operation_spec(
            "vanilla",
            &spec.title,
            &spec.command,
            &spec.env,
            &spec.resources,
            spec.image.as_ref(),
            &spec.files,
            None,
        )?;
        self.submit_spec(body)
    }

    fn wait_operation(&self, handle: &OperationHandle) -> Result<JobOutcome, ClientError> {
        let (completed, status) =
            self.poll_terminal(&format!("/api/v1/operations/{}", handle.id), "operation")?;
        let failed_jobs = status
            .get("failed_jobs")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok(JobOutcome {
            state: if completed {
                JobState::Succeeded
            } else {
                JobState::Failed
            },
            failed_jobs,
            message: status
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn upload_file(&self, local: &Path, remote: &TablePath) -> Result<(), ClientError> {
        if !local.is_file() {
            return Err(ClientError::Validation(format!(
                "upload source not found: {}",
                local.display()
            )));
        }
        let bytes = fs::read(local)?;
        self.transport
            .put_bytes(&path_query("/api/v1/files", &[("path", remote.as_str())]), &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridpipe_ir::{JoinType, QueryOp};
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct RecordingTransport {
        calls: RefCell<Vec<(String, String)>>,
        post_bodies: RefCell<Vec<Value>>,
        put_payloads: RefCell<Vec<(String, Vec<u8>)>>,
        get_json_responses: RefCell<VecDeque<Option<Value>>>,
        get_text_responses: RefCell<VecDeque<Option<String>>>,
        post_responses: RefCell<VecDeque<Value>>,
    }

    impl RecordingTransport {
        fn record(&self, method: &str, path: &str) {
            self.calls
                .borrow_mut()
                .push((method.to_string(), path.to_string()));
        }
    }

    impl ClusterTransport for RecordingTransport {
        fn get_json(&self, path: &str) -> Result<Option<Value>, ClientError> {
            self.record("GET", path);
            Ok(self
                .get_json_responses
                .borrow_mut()
                .pop_front()
                .unwrap_or(None))
        }

        fn get_text(&self, path: &str) -> Result<Option<String>, ClientError> {
            self.record("GET", path);
            Ok(self
                .get_text_responses
                .borrow_mut()
                .pop_front()
                .unwrap_or(None))
        }

        fn post_json(&self, path: &str, body: &Value) -> Result<Value, ClientError> {
            self.record("POST", path);
            self.post_bodies.borrow_mut().push(body.clone());
            Ok(self
                .post_responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| json!({})))
        }

        fn put_bytes(&self, path: &str, body: &[u8]) -> Result<(), ClientError> {
            self.record("PUT", path);
            self.put_payloads
                .borrow_mut()
                .push((path.to_string(), body.to_vec()));
            Ok(())
        }
    }

    fn client(transport: RecordingTransport) -> RemoteClient<RecordingTransport> {
        RemoteClient::new(transport, Duration::ZERO)
    }

    fn map_spec() -> MapJobSpec {
        MapJobSpec {
            title: "extract".to_string(),
            input: TablePath::new("//home/in"),
            output: TablePath::new("//home/out"),
            command: "bash -c 'set -e\ntar -xzf code.tar.gz\n./operation_wrapper_extract_map.sh'"
                .to_string(),
            entry: "stages/extract/run.sh".into(),
            env: [("S3_ENDPOINT".to_string(), "http://minio".to_string())]
                .into_iter()
                .collect(),
            resources: ResourceSpec::default(),
            image: ImageSpec::from_parts(
                Some("registry.local/pipeline:1".to_string()),
                Some("bot".to_string()),
                Some("hunter2".to_string()),
            ),
            files: vec![SandboxFile {
                name: "code.tar.gz".to_string(),
                source: SandboxSource::Staged(TablePath::new("//deploy/.build/code.tar.gz")),
                env_var: None,
            }],
        }
    }

    #[test]
    fn test_map_operation_wire_shape() {
        let transport = RecordingTransport::default();
        transport
            .post_responses
            .borrow_mut()
            .push_back(json!({"id": "op-1"}));
        let client = client(transport);

        let handle = client.submit_map(&map_spec()).unwrap();
        assert_eq!(handle.id, "op-1");

        let bodies = client.transport.post_bodies.borrow();
        let spec = &bodies[0];
        assert_eq!(spec["kind"], "map");
        assert_eq!(spec["input"], "//home/in");
        assert_eq!(spec["output"], "//home/out");
        assert_eq!(spec["resources"]["memory_limit"], json!(4u64 << 30));
        assert_eq!(spec["resources"]["job_count"], 1);
        assert_eq!(spec["resources"]["max_failed_jobs"], 0);
        assert_eq!(spec["env"]["S3_ENDPOINT"], "http://minio");
        assert_eq!(spec["image"], "registry.local/pipeline:1");
        assert_eq!(spec["secure_vault"]["REGISTRY_USER"], "bot");
        assert_eq!(spec["files"][0]["path"], "//deploy/.build/code.tar.gz");
        assert_eq!(spec["files"][0]["name"], "code.tar.gz");
        assert!(spec["command"].as_str().unwrap().contains("tar -xzf"));
    }

    #[test]
    fn test_image_without_credentials_has_no_vault() {
        let transport = RecordingTransport::default();
        transport
            .post_responses
            .borrow_mut()
            .push_back(json!({"id": "op-1"}));
        let client = client(transport);

        let mut spec = map_spec();
        spec.image = ImageSpec::from_parts(Some("img".to_string()), None, None);
        client.submit_map(&spec).unwrap();

        let bodies = client.transport.post_bodies.borrow();
        assert_eq!(bodies[0]["image"], "img");
        assert!(bodies[0].get("secure_vault").is_none());
    }

    #[test]
    fn test_local_sandbox_file_rejected_on_cluster() {
        let client = client(RecordingTransport::default());
        let mut spec = map_spec();
        spec.files = vec![SandboxFile {
            name: "cfg".to_string(),
            source: SandboxSource::Local("/tmp/cfg.yaml".into()),
            env_var: None,
        }];

        let err = client.submit_map(&spec).unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));
        assert!(client.transport.calls.borrow().is_empty());
    }

    #[test]
    fn test_wait_operation_polls_to_terminal() {
        let transport = RecordingTransport::default();
        {
            let mut responses = transport.get_json_responses.borrow_mut();
            responses.push_back(Some(json!({"state": "running"})));
            responses.push_back(Some(json!({"state": "completed", "failed_jobs": 0})));
        }
        let client = client(transport);

        let outcome = client
            .wait_operation(&OperationHandle { id: "op-1".to_string() })
            .unwrap();
        assert!(outcome.succeeded());
        assert_eq!(client.transport.calls.borrow().len(), 2);
    }

    #[test]
    fn test_failed_operation_reports_outcome_not_error() {
        let transport = RecordingTransport::default();
        transport.get_json_responses.borrow_mut().push_back(Some(
            json!({"state": "failed", "failed_jobs": 2, "message": "2 workers crashed"}),
        ));
        let client = client(transport);

        let outcome = client
            .wait_operation(&OperationHandle { id: "op-1".to_string() })
            .unwrap();
        assert!(!outcome.succeeded());
        assert_eq!(outcome.failed_jobs, 2);
        assert_eq!(outcome.message.as_deref(), Some("2 workers crashed"));
    }

    #[test]
    fn test_dry_run_makes_no_network_calls() {
        let client = client(RecordingTransport::default());
        let op = QueryOp::join("//l", "//r", "//o", "id", JoinType::Left, None);

        let text = client.query(&op, true).unwrap();
        assert!(text.is_some_and(|t| t.starts_with("PRAGMA")));
        assert!(client.transport.calls.borrow().is_empty());
    }

    #[test]
    fn test_executed_query_text_matches_dry_run() {
        let op = QueryOp::join("//l", "//r", "//o", "id", JoinType::Left, None);
        let expected = remote::render(&op).unwrap();

        let transport = RecordingTransport::default();
        transport
            .post_responses
            .borrow_mut()
            .push_back(json!({"id": "q-1"}));
        transport
            .get_json_responses
            .borrow_mut()
            .push_back(Some(json!({"state": "completed"})));
        let client = client(transport);

        assert!(client.query(&op, false).unwrap().is_none());
        let bodies = client.transport.post_bodies.borrow();
        assert_eq!(bodies[0]["query"], json!(expected));
    }

    #[test]
    fn test_failed_query_is_query_error() {
        let transport = RecordingTransport::default();
        transport
            .post_responses
            .borrow_mut()
            .push_back(json!({"id": "q-1"}));
        transport
            .get_json_responses
            .borrow_mut()
            .push_back(Some(json!({"state": "failed", "message": "type clash"})));
        let client = client(transport);

        let op = QueryOp::select("//t", "//o", vec!["a".to_string()]);
        let err = client.query(&op, false).unwrap_err();
        assert!(matches!(err, ClientError::Query(m) if m == "type clash"));
    }

    #[test]
    fn test_write_then_read_round_trip_over_the_wire() {
        let transport = RecordingTransport::default();
        let client = client(transport);

        let rows: Vec<Row> = vec![
            serde_json::from_str(r#"{"id":1,"v":"a"}"#).unwrap(),
            serde_json::from_str(r#"{"id":2,"v":"b"}"#).unwrap(),
        ];
        let path = TablePath::new("//home/t");
        client.write_table(&path, &rows, false).unwrap();

        let payload = {
            let payloads = client.transport.put_payloads.borrow();
            String::from_utf8(payloads[0].1.clone()).unwrap()
        };
        client
            .transport
            .get_text_responses
            .borrow_mut()
            .push_back(Some(payload));

        let back: Vec<Row> = client
            .read_table(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn test_exists_false_when_path_missing() {
        let client = client(RecordingTransport::default());
        assert!(!client.exists(&TablePath::new("//nope")).unwrap());
    }
}
