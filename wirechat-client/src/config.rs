use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use wirechat_core::UserId;

pub const MAX_SERVER_URL_LEN: usize = 2048;
pub const MAX_TOKEN_LEN: usize = 4096;
pub const MAX_USERNAME_LEN: usize = 128;

/// Defensive bound: the credential file is expected to be tiny.
pub const MAX_CREDENTIALS_BYTES: u64 = 64 * 1024;

const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the chat server (ws:// or wss://).
    pub server_url: String,
    /// Base URL of the REST collaborator (chat list, message history).
    pub api_url: String,
    pub platform: String,
    pub data_dir: PathBuf,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered heartbeats tolerated before the link is
    /// declared dead and a reconnect is forced.
    pub max_missed_pongs: u32,
}

impl ClientConfig {
    pub fn new(
        server_url: impl Into<String>,
        api_url: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            api_url: api_url.into(),
            platform: "Pc".to_owned(),
            data_dir: data_dir.into(),
            connect_timeout: Duration::from_secs(12),
            request_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            max_missed_pongs: 3,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let server_url = self.server_url.trim();
        if server_url.is_empty() {
            return Err(ConfigError::MissingServerUrl);
        }
        if server_url.len() > MAX_SERVER_URL_LEN {
            return Err(ConfigError::ServerUrlTooLong(server_url.len()));
        }
        let parsed =
            Url::parse(server_url).map_err(|err| ConfigError::InvalidServerUrl(err.to_string()))?;
        match parsed.scheme() {
            "ws" | "wss" => {}
            other => return Err(ConfigError::InvalidServerUrl(format!(
                "scheme must be ws or wss, got {other}"
            ))),
        }

        let api_url = self.api_url.trim();
        if api_url.is_empty() {
            return Err(ConfigError::MissingApiUrl);
        }
        let parsed =
            Url::parse(api_url).map_err(|err| ConfigError::InvalidApiUrl(err.to_string()))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => return Err(ConfigError::InvalidApiUrl(format!(
                "scheme must be http or https, got {other}"
            ))),
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server URL is required")]
    MissingServerUrl,
    #[error("server URL is too long ({0} > {MAX_SERVER_URL_LEN} chars)")]
    ServerUrlTooLong(usize),
    #[error("server URL is invalid: {0}")]
    InvalidServerUrl(String),
    #[error("api URL is required")]
    MissingApiUrl,
    #[error("api URL is invalid: {0}")]
    InvalidApiUrl(String),
    #[error("credentials are invalid: {0}")]
    InvalidCredentials(String),
    #[error("credential file too large: {size} bytes (max {MAX_CREDENTIALS_BYTES})")]
    CredentialsTooLarge { size: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub user_id: UserId,
    pub username: String,
    pub token: String,
}

impl Credentials {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.username.trim().is_empty() {
            return Err(ConfigError::InvalidCredentials("username is empty".into()));
        }
        if self.username.len() > MAX_USERNAME_LEN {
            return Err(ConfigError::InvalidCredentials("username too long".into()));
        }
        if self.token.trim().is_empty() {
            return Err(ConfigError::InvalidCredentials("token is empty".into()));
        }
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(ConfigError::InvalidCredentials("token too long".into()));
        }
        Ok(())
    }
}

/// Where the session looks for its login identity. Absence of credentials
/// is a normal state, not an error: the session silently stays (or
/// becomes) disconnected.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Option<Credentials>;
}

/// Credentials persisted as JSON in the data dir, written atomically.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(CREDENTIALS_FILE),
        }
    }

    pub fn save(&self, credentials: &Credentials) -> Result<(), ConfigError> {
        credentials.validate()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(credentials)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload.as_bytes())?;
        if self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }

    fn try_load(&self) -> Result<Credentials, ConfigError> {
        let meta = fs::metadata(&self.path)?;
        if meta.len() > MAX_CREDENTIALS_BYTES {
            return Err(ConfigError::CredentialsTooLarge { size: meta.len() });
        }
        let data = fs::read_to_string(&self.path)?;
        let credentials: Credentials = serde_json::from_str(&data)?;
        credentials.validate()?;
        Ok(credentials)
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Option<Credentials> {
        self.try_load().ok()
    }
}

/// In-memory credential slot, used by the CLI (token passed by flag) and
/// by tests that simulate credential loss mid-session.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<Credentials>>,
}

impl MemoryCredentialStore {
    pub fn with(credentials: Credentials) -> Self {
        Self {
            slot: Mutex::new(Some(credentials)),
        }
    }

    pub fn set(&self, credentials: Credentials) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(credentials);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Option<Credentials> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }
}
