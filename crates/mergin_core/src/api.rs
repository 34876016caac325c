//! Orchestrator entry points.
//!
//! [`MerginApi`] owns the collaborators (HTTP client, local project
//! registry, credentials, transaction registry, event subscribers) and
//! exposes the user-level operations: project listing, `update_project`,
//! `upload_project`, their cancel counterparts, and the administrative
//! calls. One instance represents one sync session; it is cheap to clone
//! and safe to share across tasks.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tracing::{info, warn};

use crate::auth::{ApiVersionStatus, AuthState, Credentials, LoginResponse};
use crate::config::ApiConfig;
use crate::error::{MerginError, Result};
use crate::events::{CallbackRegistry, EventCallback, SubscriptionId, SyncEvent};
use crate::http::{encode_query_component, CancelToken, HttpClient, HttpRequest, HttpResponse};
use crate::local_projects::LocalProjects;
use crate::metadata::ProjectListEntry;
use crate::transaction::{SyncStage, Transaction, TransactionKind};
use crate::{pull, push};

/// Filter parameters of the project listing request.
#[derive(Debug, Clone)]
pub struct ProjectFilter {
    /// Search expression on project names
    pub search: Option<String>,
    /// Username the `flag` filter applies to
    pub user: Option<String>,
    /// `"created"` or `"shared"` relative to `user`
    pub flag: Option<String>,
    /// Server-side tag filter
    pub tag: Option<String>,
}

impl Default for ProjectFilter {
    fn default() -> Self {
        Self {
            search: None,
            user: None,
            flag: None,
            tag: Some("input_use".to_string()),
        }
    }
}

/// Storage numbers of the logged-in user.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    /// Bytes currently used
    #[serde(default)]
    pub disk_usage: u64,
    /// Quota in bytes
    #[serde(default, alias = "storage_limit")]
    pub storage: u64,
}

struct Inner {
    config: ApiConfig,
    http: Arc<dyn HttpClient>,
    local_projects: Arc<dyn LocalProjects>,
    auth: Mutex<AuthState>,
    registry: crate::transaction::TransactionRegistry,
    events: CallbackRegistry,
    version_status: Mutex<ApiVersionStatus>,
}

/// The synchronization engine.
#[derive(Clone)]
pub struct MerginApi {
    inner: Arc<Inner>,
}

impl MerginApi {
    /// Create an engine instance over the given transport and local project
    /// registry.
    pub fn new(
        config: ApiConfig,
        http: Arc<dyn HttpClient>,
        local_projects: Arc<dyn LocalProjects>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                http,
                local_projects,
                auth: Mutex::new(AuthState::default()),
                registry: crate::transaction::TransactionRegistry::new(),
                events: CallbackRegistry::new(),
                version_status: Mutex::new(ApiVersionStatus::Unknown),
            }),
        }
    }

    /// The `namespace/name` full name of a project.
    pub fn full_project_name(namespace: &str, name: &str) -> String {
        format!("{}/{}", namespace, name)
    }

    /// Engine configuration.
    pub fn config(&self) -> &ApiConfig {
        &self.inner.config
    }

    /// The local project registry the engine records downloads in.
    pub fn local_projects(&self) -> &dyn LocalProjects {
        self.inner.local_projects.as_ref()
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self, callback: EventCallback) -> SubscriptionId {
        self.inner.events.subscribe(callback)
    }

    /// Remove an event subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub(crate) fn emit(&self, event: &SyncEvent) {
        self.inner.events.emit(event);
    }

    pub(crate) fn url(&self, path: &str) -> String {
        self.inner.config.url(path)
    }

    // ==================== authentication ====================

    /// Store credentials and exchange them for a bearer token.
    pub async fn authorize(&self, username: &str, password: &str) -> Result<()> {
        {
            let mut auth = self.inner.auth.lock().unwrap();
            auth.credentials = Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            });
            auth.token = None;
            auth.token_expiration = None;
        }
        self.login(&CancelToken::new()).await
    }

    /// Forget credentials and token.
    pub fn clear_auth(&self) {
        self.inner.auth.lock().unwrap().clear();
        self.emit(&SyncEvent::AuthChanged);
    }

    /// Whether credentials are stored.
    pub fn has_auth_data(&self) -> bool {
        self.inner.auth.lock().unwrap().credentials.is_some()
    }

    /// Username of the stored credentials.
    pub fn username(&self) -> Option<String> {
        self.inner
            .auth
            .lock()
            .unwrap()
            .credentials
            .as_ref()
            .map(|c| c.username.clone())
    }

    async fn login(&self, cancel: &CancelToken) -> Result<()> {
        let credentials = self
            .inner
            .auth
            .lock()
            .unwrap()
            .credentials
            .clone()
            .ok_or_else(|| MerginError::Unauthorized("no stored credentials".to_string()))?;

        let url = self.url("v1/auth/login");
        let request = HttpRequest::post_json(url, &credentials.login_request());
        let response = self.inner.http.send(request, cancel).await;
        let response = match response.and_then(|r| self.response_to_result(r)) {
            Ok(response) => response,
            Err(err) => {
                self.emit(&SyncEvent::AuthFailed);
                return Err(err);
            }
        };

        let login: LoginResponse = match serde_json::from_slice(&response.body) {
            Ok(login) => login,
            Err(e) => {
                self.emit(&SyncEvent::AuthFailed);
                return Err(MerginError::Unauthorized(format!(
                    "malformed login reply: {}",
                    e
                )));
            }
        };
        self.inner.auth.lock().unwrap().store_login(login);
        self.emit(&SyncEvent::AuthChanged);
        Ok(())
    }

    async fn ensure_token(&self, cancel: &CancelToken) -> Result<Option<String>> {
        {
            let auth = self.inner.auth.lock().unwrap();
            if let Some(token) = auth.valid_token() {
                return Ok(Some(token.to_string()));
            }
            if auth.credentials.is_none() {
                return Ok(None);
            }
        }
        self.login(cancel).await?;
        Ok(self.inner.auth.lock().unwrap().token.clone())
    }

    /// Send a request with the bearer token attached, refreshing it once on
    /// a 401 and mapping non-2xx replies onto the error taxonomy.
    pub(crate) async fn send_authorized(
        &self,
        request: HttpRequest,
        cancel: &CancelToken,
    ) -> Result<HttpResponse> {
        let token = self.ensure_token(cancel).await?;
        let first = match &token {
            Some(token) => request.clone().with_bearer(token),
            None => request.clone(),
        };
        let response = self.inner.http.send(first, cancel).await?;
        if response.status != 401 {
            return self.response_to_result(response);
        }

        // one re-authentication attempt with the stored credentials
        let mut last = response;
        if self.has_auth_data() && self.login(cancel).await.is_ok() {
            let token = self.inner.auth.lock().unwrap().token.clone();
            let retry = match &token {
                Some(token) => request.with_bearer(token),
                None => request,
            };
            let response = self.inner.http.send(retry, cancel).await?;
            if response.status != 401 {
                return self.response_to_result(response);
            }
            last = response;
        }

        self.emit(&SyncEvent::AuthRequested);
        Err(MerginError::Unauthorized(extract_server_error(&last.body)))
    }

    fn response_to_result(&self, response: HttpResponse) -> Result<HttpResponse> {
        if response.is_success() {
            return Ok(response);
        }
        let detail = extract_server_error(&response.body);
        Err(match response.status {
            401 => MerginError::Unauthorized(detail),
            404 => MerginError::NotFound(detail),
            409 => MerginError::Conflict(detail),
            413 => MerginError::StorageLimitExceeded(detail),
            code => MerginError::HttpStatus { code, detail },
        })
    }

    // ==================== server probing ====================

    /// Probe the server version and classify compatibility.
    pub async fn ping(&self) -> Result<String> {
        let cancel = CancelToken::new();
        let request = HttpRequest::get(self.url("ping"));
        let result = self.inner.http.send(request, &cancel).await;
        let result = result.and_then(|r| self.response_to_result(r));

        match result {
            Ok(response) => {
                let version = response
                    .json()
                    .ok()
                    .and_then(|v| v.get("version").and_then(|v| v.as_str()).map(String::from))
                    .unwrap_or_default();
                let status = ApiVersionStatus::from_server_version(&version);
                self.set_version_status(status);
                self.emit(&SyncEvent::PingFinished {
                    version: version.clone(),
                    message: String::new(),
                });
                if status == ApiVersionStatus::Incompatible {
                    return Err(MerginError::VersionIncompatible(version));
                }
                Ok(version)
            }
            Err(err) => {
                self.set_version_status(ApiVersionStatus::NotFound);
                self.emit(&SyncEvent::PingFinished {
                    version: String::new(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Latest verdict of the version probe.
    pub fn api_version_status(&self) -> ApiVersionStatus {
        *self.inner.version_status.lock().unwrap()
    }

    fn set_version_status(&self, status: ApiVersionStatus) {
        *self.inner.version_status.lock().unwrap() = status;
        self.emit(&SyncEvent::ApiVersionStatusChanged { status });
    }

    // ==================== project listing ====================

    /// Fetch the server project listing.
    pub async fn list_projects(&self, filter: &ProjectFilter) -> Result<Vec<ProjectListEntry>> {
        let mut query = Vec::new();
        if let Some(search) = &filter.search {
            query.push(format!("filter={}", encode_query_component(search)));
        }
        if let Some(user) = &filter.user {
            query.push(format!("user={}", encode_query_component(user)));
        }
        if let Some(flag) = &filter.flag {
            query.push(format!("flag={}", encode_query_component(flag)));
        }
        if let Some(tag) = &filter.tag {
            query.push(format!("tags={}", encode_query_component(tag)));
        }
        let url = if query.is_empty() {
            self.url("v1/project")
        } else {
            self.url(&format!("v1/project?{}", query.join("&")))
        };

        let cancel = CancelToken::new();
        let result = self.send_authorized(HttpRequest::get(&url), &cancel).await;
        let result = result.and_then(|response| {
            serde_json::from_slice::<Vec<ProjectListEntry>>(&response.body).map_err(|e| {
                MerginError::MetadataCorrupt {
                    path: url.clone(),
                    reason: e.to_string(),
                }
            })
        });

        match result {
            Ok(projects) => {
                self.emit(&SyncEvent::ListProjectsFinished {
                    projects: projects.clone(),
                });
                Ok(projects)
            }
            Err(err) => {
                warn!(error = %err, "project listing failed");
                self.emit(&SyncEvent::ListProjectsFailed);
                Err(err)
            }
        }
    }

    // ==================== sync operations ====================

    /// Pull the project to the server's current version.
    ///
    /// Creates the local working copy when this is the first download.
    /// Returns the project directory.
    pub async fn update_project(&self, namespace: &str, name: &str) -> Result<PathBuf> {
        let full_name = Self::full_project_name(namespace, name);
        info!(project = %full_name, "update requested");
        let handle = self
            .inner
            .registry
            .begin(TransactionKind::Pull, &full_name)?;

        match pull::execute(self, namespace, name, &handle).await {
            Ok(outcome) => {
                handle.set_stage(SyncStage::Done);
                if outcome.changed && !outcome.first_download {
                    self.emit(&SyncEvent::ReloadProject {
                        dir: outcome.project_dir.clone(),
                    });
                }
                self.emit(&SyncEvent::notify(format!(
                    "Project {} synchronized",
                    full_name
                )));
                self.finish_project_sync(&full_name, outcome.project_dir.clone(), true);
                Ok(outcome.project_dir)
            }
            Err(err) => {
                let dir = handle.snapshot().project_dir;
                handle.set_stage(terminal_stage(&err));
                self.report_sync_failure(&full_name, &err);
                self.finish_project_sync(&full_name, dir, false);
                Err(err)
            }
        }
    }

    /// Push local changes, pulling first so concurrent edits are resolved.
    ///
    /// Returns the project directory.
    pub async fn upload_project(&self, namespace: &str, name: &str) -> Result<PathBuf> {
        let full_name = Self::full_project_name(namespace, name);
        info!(project = %full_name, "upload requested");
        let handle = self
            .inner
            .registry
            .begin(TransactionKind::Push, &full_name)?;

        match push::execute(self, namespace, name, &handle).await {
            Ok(outcome) => {
                handle.set_stage(SyncStage::Done);
                if outcome.pulled_changed {
                    self.emit(&SyncEvent::ReloadProject {
                        dir: outcome.project_dir.clone(),
                    });
                }
                let message = if outcome.uploaded_any {
                    format!("Uploaded changes of {} (v{})", full_name, outcome.version)
                } else {
                    format!("No changes to upload in {}", full_name)
                };
                self.emit(&SyncEvent::notify(message));
                self.finish_project_sync(&full_name, outcome.project_dir.clone(), true);
                Ok(outcome.project_dir)
            }
            Err(err) => {
                let dir = handle.snapshot().project_dir;
                handle.set_stage(terminal_stage(&err));
                self.report_sync_failure(&full_name, &err);
                self.finish_project_sync(&full_name, dir, false);
                Err(err)
            }
        }
    }

    /// Cancel a running pull. Idempotent; false when nothing is running.
    pub fn update_cancel(&self, full_name: &str) -> bool {
        info!(project = %full_name, "update cancel requested");
        self.inner.registry.cancel(full_name)
    }

    /// Cancel a running push. Idempotent; false when nothing is running.
    ///
    /// Before the server issued the transaction UUID the cancellation is
    /// recorded locally and the UUID is cancelled on arrival; afterwards
    /// the in-flight transfer aborts and the server transaction is
    /// cancelled explicitly.
    pub fn upload_cancel(&self, full_name: &str) -> bool {
        info!(project = %full_name, "upload cancel requested");
        self.inner.registry.cancel(full_name)
    }

    /// Snapshots of the currently active transactions.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.inner.registry.snapshots()
    }

    fn finish_project_sync(&self, full_name: &str, dir: PathBuf, success: bool) {
        self.inner.registry.finish(full_name);
        self.emit(&SyncEvent::status_changed(full_name, -1.0));
        self.emit(&SyncEvent::sync_finished(dir, full_name, success));
    }

    fn report_sync_failure(&self, full_name: &str, err: &MerginError) {
        if err.is_cancelled() {
            info!(project = %full_name, "sync cancelled");
            return;
        }
        warn!(project = %full_name, error = %err, "sync failed");
        self.emit(&SyncEvent::network_error(
            err.to_string(),
            err.detail().unwrap_or_default(),
            false,
        ));
    }

    // ==================== administrative calls ====================

    /// Create an empty project on the server.
    pub async fn create_project(&self, namespace: &str, name: &str) -> Result<()> {
        let full_name = Self::full_project_name(namespace, name);
        let url = self.url(&format!("v1/project/{}/{}", namespace, name));
        let body = serde_json::json!({ "name": name, "public": false });
        let result = self
            .send_authorized(HttpRequest::post_json(url, &body), &CancelToken::new())
            .await;
        self.emit(&SyncEvent::ProjectCreated {
            name: full_name,
            success: result.is_ok(),
        });
        result.map(|_| ())
    }

    /// Delete a project on the server.
    pub async fn delete_project(&self, namespace: &str, name: &str) -> Result<()> {
        let full_name = Self::full_project_name(namespace, name);
        let url = self.url(&format!("v1/project/{}/{}", namespace, name));
        let result = self
            .send_authorized(HttpRequest::delete(url), &CancelToken::new())
            .await;
        self.emit(&SyncEvent::ServerProjectDeleted {
            full_name,
            success: result.is_ok(),
        });
        result.map(|_| ())
    }

    /// Fetch storage numbers of a user.
    pub async fn get_user_info(&self, username: &str) -> Result<UserInfo> {
        let url = self.url(&format!("v1/user/{}", encode_query_component(username)));
        let response = self
            .send_authorized(HttpRequest::get(&url), &CancelToken::new())
            .await?;
        let user_info: UserInfo =
            serde_json::from_slice(&response.body).map_err(|e| MerginError::MetadataCorrupt {
                path: url,
                reason: e.to_string(),
            })?;
        self.emit(&SyncEvent::UserInfoChanged {
            username: username.to_string(),
            disk_usage: user_info.disk_usage,
            storage_limit: user_info.storage,
        });
        Ok(user_info)
    }
}

fn terminal_stage(err: &MerginError) -> SyncStage {
    if err.is_cancelled() {
        SyncStage::Cancelled
    } else {
        SyncStage::Failed
    }
}

/// Extract the `detail` message of an error JSON body; falls back to the
/// raw body when it is not an error JSON.
pub(crate) fn extract_server_error(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(detail) = value.get("detail").and_then(|d| d.as_str()) {
            return detail.to_string();
        }
    }
    String::from_utf8_lossy(body).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_project_name() {
        assert_eq!(MerginApi::full_project_name("acme", "survey"), "acme/survey");
    }

    #[test]
    fn test_extract_server_error() {
        assert_eq!(
            extract_server_error(br#"{"detail": "quota exceeded"}"#),
            "quota exceeded"
        );
        assert_eq!(extract_server_error(b"plain text\n"), "plain text");
        assert_eq!(extract_server_error(br#"{"other": 1}"#), r#"{"other": 1}"#);
    }

    #[test]
    fn test_default_filter_carries_input_tag() {
        let filter = ProjectFilter::default();
        assert_eq!(filter.tag.as_deref(), Some("input_use"));
        assert!(filter.search.is_none());
    }
}
