//! Credentials, token exchange and server version probing.
//!
//! Authentication is a bearer token obtained from `/v1/auth/login` with the
//! stored username and password. The engine keeps the credentials and the
//! token in memory for the lifetime of the [`MerginApi`](crate::api::MerginApi)
//! instance; persisting them (or not) is the shell's decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Major part of the newest server API version this client understands.
pub const API_VERSION_MAJOR: u32 = 2019;

/// Minor part of the newest server API version this client understands.
pub const API_VERSION_MINOR: u32 = 4;

/// Compatibility verdict from the `/ping` version probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiVersionStatus {
    /// Version has not been checked yet (reset when the API root changes)
    Unknown,
    /// Server version is compatible
    Ok,
    /// Server is older than this client requires
    Incompatible,
    /// Server did not answer the probe
    NotFound,
}

impl ApiVersionStatus {
    /// Classify a server version string like `"2019.4.1"`.
    pub fn from_server_version(version: &str) -> Self {
        let mut parts = version.split('.');
        let major: u32 = match parts.next().and_then(|p| p.trim().parse().ok()) {
            Some(v) => v,
            None => return ApiVersionStatus::Incompatible,
        };
        let minor: u32 = parts
            .next()
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(0);

        if (major, minor) >= (API_VERSION_MAJOR, API_VERSION_MINOR) {
            ApiVersionStatus::Ok
        } else {
            ApiVersionStatus::Incompatible
        }
    }
}

/// Login credentials as entered by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username or registered e-mail
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Body of the `/v1/auth/login` request.
    pub fn login_request(&self) -> serde_json::Value {
        serde_json::json!({
            "login": &self.username,
            "password": &self.password,
        })
    }
}

/// Successful reply of `/v1/auth/login`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    /// Bearer token for subsequent requests
    pub token: String,
    /// Token expiration, when the server announces one
    #[serde(default)]
    pub expire: Option<DateTime<Utc>>,
}

/// In-memory authentication state.
#[derive(Debug, Default)]
pub(crate) struct AuthState {
    pub credentials: Option<Credentials>,
    pub token: Option<String>,
    pub token_expiration: Option<DateTime<Utc>>,
}

impl AuthState {
    /// Token that is present and not past its expiration.
    pub fn valid_token(&self) -> Option<&str> {
        let token = self.token.as_deref()?;
        if let Some(expiration) = self.token_expiration {
            if expiration <= Utc::now() {
                return None;
            }
        }
        Some(token)
    }

    pub fn store_login(&mut self, response: LoginResponse) {
        self.token = Some(response.token);
        self.token_expiration = response.expire;
    }

    pub fn clear(&mut self) {
        self.credentials = None;
        self.token = None;
        self.token_expiration = None;
    }
}
