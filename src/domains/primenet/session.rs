use super::result_buffer::SharedResultBuffer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: String,
    pub computer_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorHealth {
    Healthy,
    /// Recent calls failed; possibly running from local work only.
    Degraded,
    /// Operator switched communication off.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommMode {
    Online,
    /// Entered after repeated failures; left on the first successful probe.
    AutoManual,
    /// Entered and left only by the operator.
    ForcedManual,
}

/// Connection state with the assignment server.
#[derive(Debug, Clone)]
pub struct CoordinatorSession {
    pub endpoint: String,
    pub credentials: Credentials,
    pub proxy: Option<String>,
    pub last_contact: Option<DateTime<Utc>>,
    pub connected_at: DateTime<Utc>,
    pub results: SharedResultBuffer,
}

impl CoordinatorSession {
    pub fn new(
        endpoint: impl Into<String>,
        credentials: Credentials,
        proxy: Option<String>,
        results: SharedResultBuffer,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials,
            proxy,
            last_contact: None,
            connected_at: Utc::now(),
            results,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if self.last_contact.is_none() {
            self.connected_at = now;
        }
        self.last_contact = Some(now);
    }

    /// Start over after a reconnect.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        self.connected_at = now;
        self.last_contact = Some(now);
    }
}
