//! Client configuration from the environment

use crate::transport::Style;
use reqwest::Url;
use std::time::Duration;
use thiserror::Error;

pub const BASE_URL_VAR: &str = "REFINE_CHAT_BASE_URL";
pub const WS_URL_VAR: &str = "REFINE_CHAT_WS_URL";
pub const REQUEST_TIMEOUT_VAR: &str = "REFINE_CHAT_REQUEST_TIMEOUT_SECS";
pub const CONNECT_TIMEOUT_VAR: &str = "REFINE_CHAT_CONNECT_TIMEOUT_SECS";
pub const RECONNECT_INTERVAL_VAR: &str = "REFINE_CHAT_RECONNECT_MIN_INTERVAL_MS";
pub const STYLE_VAR: &str = "REFINE_CHAT_STYLE";
pub const STREAMING_VAR: &str = "REFINE_CHAT_STREAMING";
pub const SESSION_ID_VAR: &str = "REFINE_CHAT_SESSION_ID";

const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const WS_PATH: &str = "/api/ws/chat";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} must be a whole number, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} must be greater than zero")]
    ZeroTimeout { var: &'static str },

    #[error("{var} must be true/false/1/0, got {value:?}")]
    InvalidBool { var: &'static str, value: String },

    #[error("{var} must be formal or casual, got {value:?}")]
    InvalidStyle { var: &'static str, value: String },

    #[error("{var} is not a usable URL ({value:?}): {reason}")]
    InvalidUrl {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Endpoints, timeouts, and initial session settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub ws_url: String,
    /// Deadline of one synchronous request
    pub request_timeout: Duration,
    /// Deadline of one WebSocket handshake
    pub connect_timeout: Duration,
    pub reconnect_min_interval: Duration,
    pub style: Style,
    pub streaming: bool,
    pub session_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            ws_url: format!("ws://localhost:8000{WS_PATH}"),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect_min_interval: Duration::from_secs(1),
            style: Style::Formal,
            streaming: true,
            session_id: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| {
            lookup(var)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let base_url = match get(BASE_URL_VAR) {
            Some(value) => {
                parse_url(BASE_URL_VAR, &value)?;
                value.trim_end_matches('/').to_string()
            }
            None => defaults.base_url,
        };
        let ws_url = match get(WS_URL_VAR) {
            Some(value) => {
                parse_url(WS_URL_VAR, &value)?;
                value
            }
            None => derive_ws_url(&base_url)?,
        };

        let request_timeout = match get(REQUEST_TIMEOUT_VAR) {
            Some(value) => parse_timeout_secs(REQUEST_TIMEOUT_VAR, &value)?,
            None => defaults.request_timeout,
        };
        let connect_timeout = match get(CONNECT_TIMEOUT_VAR) {
            Some(value) => parse_timeout_secs(CONNECT_TIMEOUT_VAR, &value)?,
            None => defaults.connect_timeout,
        };
        let reconnect_min_interval = match get(RECONNECT_INTERVAL_VAR) {
            Some(value) => Duration::from_millis(parse_number(RECONNECT_INTERVAL_VAR, &value)?),
            None => defaults.reconnect_min_interval,
        };

        let style = match get(STYLE_VAR) {
            Some(value) => value.parse::<Style>().map_err(|_| ConfigError::InvalidStyle {
                var: STYLE_VAR,
                value,
            })?,
            None => defaults.style,
        };
        let streaming = match get(STREAMING_VAR) {
            Some(value) => parse_bool(STREAMING_VAR, &value)?,
            None => defaults.streaming,
        };

        Ok(Self {
            base_url,
            ws_url,
            request_timeout,
            connect_timeout,
            reconnect_min_interval,
            style,
            streaming,
            session_id: get(SESSION_ID_VAR),
        })
    }
}

/// WebSocket endpoint for a backend base URL: `http` becomes `ws`,
/// `https` becomes `wss`, and the chat path is appended
pub fn derive_ws_url(base_url: &str) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidUrl {
        var: BASE_URL_VAR,
        value: base_url.to_string(),
        reason: reason.to_string(),
    };

    let mut url = parse_url(BASE_URL_VAR, base_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid("scheme must be http or https")),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid("scheme cannot be changed"))?;

    let path = format!("{}{WS_PATH}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.into())
}

fn parse_url(var: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_number(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: value.to_string(),
    })
}

/// A zero deadline would fail every request before it is sent
fn parse_timeout_secs(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match parse_number(var, value)? {
        0 => Err(ConfigError::ZeroTimeout { var }),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: value.to_string(),
        }),
    }
}
