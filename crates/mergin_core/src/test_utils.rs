//! In-process mock server and HTTP client for tests.
//!
//! [`MockServer`] implements the server side of the sync protocol over
//! in-memory project stores: metadata, raw chunk download, the push
//! transaction lifecycle, login, listing and the ping probe. The matching
//! [`MockHttpClient`] routes [`HttpRequest`]s straight into it without any
//! network, while still honoring the [`CancelToken`] and optional [`Gate`]s
//! that let tests freeze a request mid-flight to exercise cancellation
//! races deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::checksum::{self, CHUNK_SIZE};
use crate::error::Result;
use crate::http::{
    decode_query_component, BoxFuture, CancelToken, HttpClient, HttpRequest, HttpResponse, Method,
};

/// One project hosted by the mock server.
#[derive(Debug, Clone, Default)]
pub struct MockProject {
    /// Current version
    pub version: u32,
    /// Path → content of the current version
    pub files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
struct FileSpec {
    path: String,
    checksum: String,
    size: u64,
    chunks: Vec<String>,
}

#[derive(Debug, Default)]
struct PendingUpload {
    full_name: String,
    target_version: u32,
    added: Vec<FileSpec>,
    updated: Vec<FileSpec>,
    removed: Vec<String>,
    chunks: HashMap<String, Vec<u8>>,
}

struct FailRule {
    url_contains: String,
    status: u16,
    body: Vec<u8>,
    skip: u32,
    remaining: u32,
}

#[derive(Default)]
struct ServerState {
    server_version: String,
    users: HashMap<String, String>,
    tokens: Vec<String>,
    token_counter: u64,
    projects: BTreeMap<String, MockProject>,
    uploads: HashMap<String, PendingUpload>,
    requests: Vec<String>,
    failures: Vec<FailRule>,
}

/// In-memory Mergin server double.
#[derive(Clone)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
    gates: Arc<Mutex<Vec<Gate>>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    /// Fresh server with one registered user `alice`/`secret`.
    pub fn new() -> Self {
        let mut state = ServerState {
            server_version: "2019.4.1".to_string(),
            ..Default::default()
        };
        state
            .users
            .insert("alice".to_string(), "secret".to_string());
        Self {
            state: Arc::new(Mutex::new(state)),
            gates: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// An [`HttpClient`] wired to this server.
    pub fn client(&self) -> Arc<dyn HttpClient> {
        Arc::new(MockHttpClient {
            server: self.clone(),
        })
    }

    /// Register a user.
    pub fn add_user(&self, username: &str, password: &str) {
        self.state
            .lock()
            .unwrap()
            .users
            .insert(username.to_string(), password.to_string());
    }

    /// Invalidate every issued token; the next authorized request gets 401.
    pub fn revoke_tokens(&self) {
        self.state.lock().unwrap().tokens.clear();
    }

    /// Report what the `/ping` probe should answer.
    pub fn set_server_version(&self, version: &str) {
        self.state.lock().unwrap().server_version = version.to_string();
    }

    /// Host a project at the given version with the given files.
    pub fn add_project(&self, namespace: &str, name: &str, version: u32, files: &[(&str, &[u8])]) {
        let project = MockProject {
            version,
            files: files
                .iter()
                .map(|(path, content)| (path.to_string(), content.to_vec()))
                .collect(),
        };
        self.state
            .lock()
            .unwrap()
            .projects
            .insert(format!("{}/{}", namespace, name), project);
    }

    /// Mutate a project's files server-side and bump its version once.
    pub fn edit_project(&self, full_name: &str, edit: impl FnOnce(&mut BTreeMap<String, Vec<u8>>)) {
        let mut state = self.state.lock().unwrap();
        let project = state
            .projects
            .get_mut(full_name)
            .unwrap_or_else(|| panic!("no such mock project: {}", full_name));
        edit(&mut project.files);
        project.version += 1;
    }

    /// Snapshot of a hosted project.
    pub fn project(&self, full_name: &str) -> Option<MockProject> {
        self.state.lock().unwrap().projects.get(full_name).cloned()
    }

    /// Fail the next matching request (by URL substring) with a status.
    pub fn fail_once(&self, url_contains: &str, status: u16, body: &[u8]) {
        self.fail_nth(url_contains, 1, status, body);
    }

    /// Fail the `nth` (1-based) matching request with a status; earlier
    /// matches pass through.
    pub fn fail_nth(&self, url_contains: &str, nth: u32, status: u16, body: &[u8]) {
        self.state.lock().unwrap().failures.push(FailRule {
            url_contains: url_contains.to_string(),
            status,
            body: body.to_vec(),
            skip: nth.saturating_sub(1),
            remaining: 1,
        });
    }

    /// `"METHOD /path?query"` log of every request handled so far.
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Forget the request log.
    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    /// Install a gate freezing matching requests until released.
    pub fn gate(&self, url_contains: &str) -> Gate {
        let gate = Gate::new(url_contains);
        self.gates.lock().unwrap().push(gate.clone());
        gate
    }

    async fn pass_gates(&self, url: &str) {
        let matching: Vec<Gate> = self
            .gates
            .lock()
            .unwrap()
            .iter()
            .filter(|g| url.contains(&g.inner.url_contains))
            .cloned()
            .collect();
        for gate in matching {
            gate.enter().await;
        }
    }

    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let mut state = self.state.lock().unwrap();
        let path_query = path_and_query(&request.url);
        state
            .requests
            .push(format!("{} {}", request.method.as_str(), path_query));

        if let Some(response) = state.take_failure(&request.url) {
            return response;
        }

        let (path, query) = match path_query.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (path_query, String::new()),
        };

        match (request.method, path.as_str()) {
            (Method::Get, "/ping") => {
                json_response(200, &serde_json::json!({ "version": &state.server_version }))
            }
            (Method::Post, "/v1/auth/login") => state.login(&request.body),
            _ => {
                if !state.is_authorized(request) {
                    return json_response(401, &serde_json::json!({"detail": "Invalid token"}));
                }
                state.dispatch(request.method, &path, &query, &request.body)
            }
        }
    }
}

impl ServerState {
    fn take_failure(&mut self, url: &str) -> Option<HttpResponse> {
        for rule in self.failures.iter_mut() {
            if !url.contains(&rule.url_contains) || rule.remaining == 0 {
                continue;
            }
            if rule.skip > 0 {
                rule.skip -= 1;
                continue;
            }
            rule.remaining -= 1;
            return Some(HttpResponse {
                status: rule.status,
                body: rule.body.clone(),
            });
        }
        None
    }

    fn login(&mut self, body: &[u8]) -> HttpResponse {
        let parsed: serde_json::Value = match serde_json::from_slice(body) {
            Ok(parsed) => parsed,
            Err(_) => return json_response(400, &serde_json::json!({"detail": "Bad request"})),
        };
        let login = parsed.get("login").and_then(|v| v.as_str()).unwrap_or("");
        let password = parsed
            .get("password")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        match self.users.get(login) {
            Some(stored) if stored == password => {
                self.token_counter += 1;
                let token = format!(
                    "{}-{}",
                    base64::engine::general_purpose::STANDARD
                        .encode(format!("{}:{}", login, password)),
                    self.token_counter
                );
                self.tokens.push(token.clone());
                json_response(200, &serde_json::json!({ "token": token }))
            }
            _ => json_response(401, &serde_json::json!({"detail": "Invalid credentials"})),
        }
    }

    fn is_authorized(&self, request: &HttpRequest) -> bool {
        request
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("authorization"))
            .any(|(_, value)| {
                value
                    .strip_prefix("Bearer ")
                    .is_some_and(|token| self.tokens.iter().any(|t| t == token))
            })
    }

    fn dispatch(&mut self, method: Method, path: &str, query: &str, body: &[u8]) -> HttpResponse {
        if let Some(rest) = path.strip_prefix("/v1/project/raw/") {
            return self.download_chunk(rest, query);
        }
        if let Some(uuid) = path.strip_prefix("/v1/project/push/cancel/") {
            self.uploads.remove(uuid);
            return json_response(200, &serde_json::json!({}));
        }
        if let Some(uuid) = path.strip_prefix("/v1/project/push/finish/") {
            return self.push_finish(uuid);
        }
        if let Some(rest) = path.strip_prefix("/v1/project/push/chunk/") {
            return self.push_chunk(rest, body);
        }
        if let Some(full_name) = path.strip_prefix("/v1/project/push/") {
            return self.push_start(full_name, body);
        }
        if path == "/v1/project" {
            return self.listing();
        }
        if let Some(username) = path.strip_prefix("/v1/user/") {
            if self.users.contains_key(username) {
                return json_response(
                    200,
                    &serde_json::json!({"disk_usage": 1024u64, "storage": 104857600u64}),
                );
            }
            return json_response(404, &serde_json::json!({"detail": "User not found"}));
        }
        if let Some(full_name) = path.strip_prefix("/v1/project/") {
            return match method {
                Method::Get => self.project_info(full_name),
                Method::Post => {
                    self.projects
                        .insert(full_name.to_string(), MockProject::default());
                    json_response(200, &serde_json::json!({}))
                }
                Method::Delete => {
                    if self.projects.remove(full_name).is_some() {
                        json_response(200, &serde_json::json!({}))
                    } else {
                        json_response(404, &serde_json::json!({"detail": "Project not found"}))
                    }
                }
            };
        }
        json_response(404, &serde_json::json!({"detail": "No such endpoint"}))
    }

    fn listing(&self) -> HttpResponse {
        let projects: Vec<serde_json::Value> = self
            .projects
            .iter()
            .map(|(full_name, project)| {
                let (namespace, name) = full_name.split_once('/').unwrap_or(("", full_name));
                serde_json::json!({
                    "name": name,
                    "namespace": namespace,
                    "version": format!("v{}", project.version),
                })
            })
            .collect();
        json_response(200, &serde_json::Value::Array(projects))
    }

    fn project_info(&self, full_name: &str) -> HttpResponse {
        match self.projects.get(full_name) {
            Some(project) => json_response(200, &metadata_json(full_name, project)),
            None => json_response(404, &serde_json::json!({"detail": "Project not found"})),
        }
    }

    fn download_chunk(&self, full_name: &str, query: &str) -> HttpResponse {
        let project = match self.projects.get(full_name) {
            Some(project) => project,
            None => return json_response(404, &serde_json::json!({"detail": "Project not found"})),
        };
        let params: HashMap<&str, String> = query
            .split('&')
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k, decode_query_component(v)))
            .collect();
        let file = params.get("file").cloned().unwrap_or_default();
        let chunk_no: u64 = params
            .get("chunk")
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);

        match project.files.get(&file) {
            Some(content) => {
                let start = (chunk_no * CHUNK_SIZE) as usize;
                if start >= content.len() && !content.is_empty() {
                    return json_response(404, &serde_json::json!({"detail": "No such chunk"}));
                }
                let end = (start + CHUNK_SIZE as usize).min(content.len());
                HttpResponse {
                    status: 200,
                    body: content[start..end].to_vec(),
                }
            }
            None => json_response(404, &serde_json::json!({"detail": "File not found"})),
        }
    }

    fn push_start(&mut self, full_name: &str, body: &[u8]) -> HttpResponse {
        let project = match self.projects.get(full_name) {
            Some(project) => project,
            None => return json_response(404, &serde_json::json!({"detail": "Project not found"})),
        };
        let changes: serde_json::Value = match serde_json::from_slice(body) {
            Ok(changes) => changes,
            Err(_) => return json_response(400, &serde_json::json!({"detail": "Bad request"})),
        };
        let client_version = changes.get("version").and_then(|v| v.as_str()).unwrap_or("");
        if client_version != format!("v{}", project.version) {
            return json_response(
                409,
                &serde_json::json!({"detail": "There is a new version of the project"}),
            );
        }

        let parse_specs = |key: &str| -> Vec<FileSpec> {
            changes
                .get(key)
                .and_then(|v| v.as_array())
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|e| {
                            Some(FileSpec {
                                path: e.get("path")?.as_str()?.to_string(),
                                checksum: e.get("checksum")?.as_str()?.to_string(),
                                size: e.get("size")?.as_u64()?,
                                chunks: e
                                    .get("chunks")?
                                    .as_array()?
                                    .iter()
                                    .filter_map(|c| c.as_str().map(String::from))
                                    .collect(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        let removed: Vec<String> = changes
            .get("removed")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.get("path").and_then(|p| p.as_str()).map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let uuid = Uuid::new_v4().to_string();
        let target_version = project.version + 1;
        self.uploads.insert(
            uuid.clone(),
            PendingUpload {
                full_name: full_name.to_string(),
                target_version,
                added: parse_specs("added"),
                updated: parse_specs("updated"),
                removed,
                chunks: HashMap::new(),
            },
        );
        json_response(
            200,
            &serde_json::json!({
                "transaction": uuid,
                "version": format!("v{}", target_version),
            }),
        )
    }

    fn push_chunk(&mut self, rest: &str, body: &[u8]) -> HttpResponse {
        let (uuid, chunk_id) = match rest.split_once('/') {
            Some(parts) => parts,
            None => return json_response(400, &serde_json::json!({"detail": "Bad chunk URL"})),
        };
        match self.uploads.get_mut(uuid) {
            Some(upload) => {
                upload.chunks.insert(chunk_id.to_string(), body.to_vec());
                json_response(200, &serde_json::json!({}))
            }
            None => json_response(404, &serde_json::json!({"detail": "No such transaction"})),
        }
    }

    fn push_finish(&mut self, uuid: &str) -> HttpResponse {
        let upload = match self.uploads.remove(uuid) {
            Some(upload) => upload,
            None => return json_response(404, &serde_json::json!({"detail": "No such transaction"})),
        };

        // assemble the transferred files before mutating the project
        let mut assembled: Vec<(String, Vec<u8>)> = Vec::new();
        for spec in upload.added.iter().chain(upload.updated.iter()) {
            let mut content = Vec::with_capacity(spec.size as usize);
            for chunk_id in &spec.chunks {
                match upload.chunks.get(chunk_id) {
                    Some(bytes) => content.extend_from_slice(bytes),
                    None => {
                        return json_response(
                            400,
                            &serde_json::json!({"detail": format!("Missing chunk {}", chunk_id)}),
                        )
                    }
                }
            }
            if content.len() as u64 != spec.size
                || checksum::checksum_bytes(&content) != spec.checksum
            {
                return json_response(
                    400,
                    &serde_json::json!({"detail": format!("Checksum mismatch for {}", spec.path)}),
                );
            }
            assembled.push((spec.path.clone(), content));
        }

        let project = match self.projects.get_mut(&upload.full_name) {
            Some(project) => project,
            None => return json_response(404, &serde_json::json!({"detail": "Project not found"})),
        };
        for path in &upload.removed {
            project.files.remove(path);
        }
        for (path, content) in assembled {
            project.files.insert(path, content);
        }
        project.version = upload.target_version;
        json_response(200, &metadata_json(&upload.full_name, project))
    }
}

fn metadata_json(full_name: &str, project: &MockProject) -> serde_json::Value {
    let (namespace, name) = full_name.split_once('/').unwrap_or(("", full_name));
    let files: Vec<serde_json::Value> = project
        .files
        .iter()
        .map(|(path, content)| {
            serde_json::json!({
                "path": path,
                "checksum": checksum::checksum_bytes(content),
                "size": content.len() as u64,
            })
        })
        .collect();
    serde_json::json!({
        "name": name,
        "namespace": namespace,
        "version": format!("v{}", project.version),
        "files": files,
    })
}

fn json_response(status: u16, body: &serde_json::Value) -> HttpResponse {
    HttpResponse {
        status,
        body: body.to_string().into_bytes(),
    }
}

fn path_and_query(url: &str) -> String {
    let after_scheme = url.find("://").map(|i| i + 3).unwrap_or(0);
    match url[after_scheme..].find('/') {
        Some(i) => url[after_scheme + i..].to_string(),
        None => "/".to_string(),
    }
}

/// Freezes matching requests until released, so tests can interleave
/// cancellation with an in-flight request deterministically.
#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

struct GateInner {
    url_contains: String,
    entered: AtomicBool,
    entered_notify: Notify,
    released: AtomicBool,
    release_notify: Notify,
    hits: AtomicU64,
}

impl Gate {
    fn new(url_contains: &str) -> Self {
        Self {
            inner: Arc::new(GateInner {
                url_contains: url_contains.to_string(),
                entered: AtomicBool::new(false),
                entered_notify: Notify::new(),
                released: AtomicBool::new(false),
                release_notify: Notify::new(),
                hits: AtomicU64::new(0),
            }),
        }
    }

    /// Number of requests that reached this gate.
    pub fn hits(&self) -> u64 {
        self.inner.hits.load(Ordering::SeqCst)
    }

    /// Resolve once a matching request is waiting at the gate.
    pub async fn entered(&self) {
        loop {
            if self.inner.entered.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.inner.entered_notify.notified();
            if self.inner.entered.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Let the waiting (and all future) requests through.
    pub fn release(&self) {
        self.inner.released.store(true, Ordering::SeqCst);
        self.inner.release_notify.notify_waiters();
    }

    async fn enter(&self) {
        self.inner.hits.fetch_add(1, Ordering::SeqCst);
        self.inner.entered.store(true, Ordering::SeqCst);
        self.inner.entered_notify.notify_waiters();
        loop {
            if self.inner.released.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.inner.release_notify.notified();
            if self.inner.released.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// [`HttpClient`] implementation routing requests into a [`MockServer`].
///
/// Cancellation is observed once, before the request is handed to the
/// server: a request that is already past that point delivers its reply
/// even when the token fires meanwhile, which is exactly the race the
/// cancel-on-arrival sentinel exists for.
pub struct MockHttpClient {
    server: MockServer,
}

impl MockHttpClient {
    /// Wrap a server.
    pub fn new(server: MockServer) -> Self {
        Self { server }
    }
}

impl HttpClient for MockHttpClient {
    fn send<'a>(
        &'a self,
        request: HttpRequest,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<HttpResponse>> {
        Box::pin(async move {
            cancel.check()?;
            self.server.pass_gates(&request.url).await;
            Ok(self.server.handle(&request))
        })
    }
}
