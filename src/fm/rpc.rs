use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Configuration of the current run. Replaced wholesale on every start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub fork_url: String,
    #[serde(default)]
    pub chain_id: Option<u64>,
    pub port: u16,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub fork_url: String,
    #[serde(default)]
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOutcome {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
}

impl StartOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { ok: true, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { ok: false, message: message.into() }
    }
}

/// Point-in-time view of the supervisor. `pid` and `config` are only populated while running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub running: bool,
    pub pid: Option<u32>,
    /// Serialized as `{}` when empty so web clients can always read `config.<field>`.
    #[serde(serialize_with = "config_or_empty_object")]
    pub config: Option<RunConfig>,
}

impl Status {
    pub fn stopped() -> Self {
        Self { running: false, pid: None, config: None }
    }
}

fn config_or_empty_object<S: Serializer>(cfg: &Option<RunConfig>, s: S) -> Result<S::Ok, S::Error> {
    match cfg {
        Some(c) => c.serialize(s),
        None => serde_json::Map::new().serialize(s),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub ts: String,
    pub component: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsResponse {
    pub events: Vec<EventEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub stopped: bool,
}
