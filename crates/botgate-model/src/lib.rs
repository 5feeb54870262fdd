use std::fmt;

use chrono::{DateTime, Utc};

/// Identity of a control-plane instance. Two registrations with the same
/// host and port describe the same instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct InstanceKey {
    pub host: String,
    pub port: u16,
}

impl InstanceKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn health_url(&self) -> String {
        format!("http://{}:{}/api/healthcheck", self.host, self.port)
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotInstance {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub is_active: bool,
    pub last_checked: DateTime<Utc>,
}

impl BotInstance {
    /// A freshly registered instance has never been probed.
    pub fn new(name: impl Into<String>, key: InstanceKey) -> Self {
        Self {
            name: name.into(),
            host: key.host,
            port: key.port,
            is_active: false,
            last_checked: Utc::now(),
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.host.clone(), self.port)
    }

    pub fn matches(&self, key: &InstanceKey) -> bool {
        self.port == key.port && self.host == key.host
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ServerState {
    /// States in which a second start must be refused.
    pub fn is_live(self) -> bool {
        matches!(self, ServerState::Starting | ServerState::Running)
    }
}

/// Row returned by `GET /api/bots`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotSummary {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub paused: bool,
    pub routine: String,
    /// Wall clock of the bot's last activity, `HH:MM:SS`.
    pub last_time: String,
    pub last_logged: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Generic `{success, message}` reply used by mutating endpoints.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ApiMessage {
    pub success: bool,
    pub message: String,
}

impl ApiMessage {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotInfo {
    pub count: usize,
    pub is_running: bool,
}

/// Entry of `GET /api/log/files`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFileInfo {
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}
