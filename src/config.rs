//! Runtime configuration read from the environment.
//!
//! The binary loads `.env` (or the bundled `assets/config.env`) before calling
//! [`ClientConfig::from_env`], so every value here can come from either place.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Origin attached to viewer events produced by the terminal front-end.
pub const LOCAL_VIEWER_ORIGIN: &str = "docchat://viewer";

/// How the credential travels with each request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthTransport {
    #[default]
    Bearer,
    Cookie,
}

impl FromStr for AuthTransport {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bearer" | "token" => Ok(AuthTransport::Bearer),
            "cookie" | "session" => Ok(AuthTransport::Cookie),
            other => Err(format!("unknown auth transport: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub api_url: String,
    pub auth_transport: AuthTransport,
    pub idle_timeout: Duration,
    pub trusted_origin: String,
    pub session_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            auth_transport: AuthTransport::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            trusted_origin: LOCAL_VIEWER_ORIGIN.to_string(),
            session_file: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("DOCCHAT_API_URL")
            && !url.trim().is_empty()
        {
            config.api_url = url.trim().trim_end_matches('/').to_string();
        }

        if let Ok(raw) = env::var("DOCCHAT_AUTH_TRANSPORT") {
            match raw.parse() {
                Ok(transport) => config.auth_transport = transport,
                Err(err) => tracing::warn!("{err}, falling back to bearer"),
            }
        }

        if let Ok(raw) = env::var("DOCCHAT_STREAM_IDLE_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.idle_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %raw, "invalid stream idle timeout, using default"),
            }
        }

        if let Ok(origin) = env::var("DOCCHAT_TRUSTED_ORIGIN")
            && !origin.trim().is_empty()
        {
            config.trusted_origin = origin.trim().to_string();
        }

        config.session_file = env::var("DOCCHAT_SESSION_FILE").ok().map(PathBuf::from);
        config
    }
}
