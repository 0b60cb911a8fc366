//! Chat room hook.
//!
//! Messages are JSON envelopes:
//!
//! ```text
//! {"action": "message", "data": "hi all"}                  client -> server
//! {"action": "message", "data": "hi all", "user": "user-7"} server -> others
//! {"action": "users",   "data": ["you", "user-7"]}          per recipient
//! {"action": "welcome", "data": "..."}                      on join
//! {"action": "ping",    "data": ""}                         heartbeat
//! ```
//!
//! Server announcements are `message` envelopes labelled `server`.

use crate::runtime::{CloseReason, ConnectionId, Handler, Hub, Transport};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

const SERVER_LABEL: &str = "server";

/// Label a recipient sees for itself in the user list.
const SELF_LABEL: &str = "you";

const DEFAULT_WELCOME: &str = "==========================================\n\
                \x20             Welcome to\n\
                \x20          WebSocket Chat\n\
                ==========================================";

/// Envelope action tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Message,
    Users,
    Welcome,
    Ping,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Message => "message",
            Action::Users => "users",
            Action::Welcome => "welcome",
            Action::Ping => "ping",
        }
    }
}

/// Outbound message envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub action: Action,
    pub data: Value,
    pub user: Option<String>,
}

impl Envelope {
    pub fn new(action: Action, data: impl Into<Value>) -> Self {
        Self {
            action,
            data: data.into(),
            user: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Serialize, leaving `user` out when unset.
    pub fn to_json(&self) -> Vec<u8> {
        let mut value = json!({
            "action": self.action.as_str(),
            "data": self.data,
        });
        if let Some(user) = &self.user {
            value["user"] = Value::String(user.clone());
        }
        value.to_string().into_bytes()
    }
}

/// Inbound envelope; unknown actions are tolerated and ignored.
#[derive(Debug, Deserialize)]
struct Inbound {
    action: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Chat room: relays messages between users and keeps user lists fresh.
#[derive(Debug, Clone)]
pub struct ChatHandler {
    welcome: String,
}

impl Default for ChatHandler {
    fn default() -> Self {
        Self::new(DEFAULT_WELCOME)
    }
}

impl ChatHandler {
    pub fn new(welcome: impl Into<String>) -> Self {
        Self {
            welcome: welcome.into(),
        }
    }

    fn announce<T: Transport>(
        &self,
        hub: &mut Hub<'_, T>,
        text: String,
        exclude: Option<&ConnectionId>,
    ) {
        let envelope = Envelope::new(Action::Message, text).with_user(SERVER_LABEL);
        if let Err(e) = hub.broadcast(&envelope.to_json(), exclude) {
            warn!(error = %e, "Announcement dropped");
        }
    }

    /// Send every connection its own view of the user list.
    fn refresh_users<T: Transport>(&self, hub: &mut Hub<'_, T>) {
        if hub.is_empty() {
            return;
        }
        hub.broadcast_with(None, |to, ids| {
            Some(Envelope::new(Action::Users, user_list(to, ids)).to_json())
        });
    }
}

/// `you` first, then every other connection in registry order.
fn user_list(recipient: &ConnectionId, ids: &[ConnectionId]) -> Vec<String> {
    std::iter::once(SELF_LABEL.to_string())
        .chain(
            ids.iter()
                .filter(|id| *id != recipient)
                .map(|id| id.to_string()),
        )
        .collect()
}

impl<T: Transport> Handler<T> for ChatHandler {
    fn on_open(&mut self, hub: &mut Hub<'_, T>, id: &ConnectionId) {
        let welcome = Envelope::new(Action::Welcome, self.welcome.as_str());
        if let Err(e) = hub.send_to(id, &welcome.to_json()) {
            warn!(conn = %id, error = %e, "Welcome not sent");
        }
        self.announce(hub, format!("user {id} joined to chat"), Some(id));
        self.refresh_users(hub);
        debug!(conn = %id, users = hub.len(), "User joined");
    }

    fn on_message(&mut self, hub: &mut Hub<'_, T>, id: &ConnectionId, message: &[u8]) {
        let inbound: Inbound = match serde_json::from_slice(message) {
            Ok(inbound) => inbound,
            Err(e) => {
                debug!(conn = %id, error = %e, "Ignoring non-envelope message");
                return;
            }
        };

        match (inbound.action.as_str(), inbound.data) {
            ("message", Some(data)) => {
                let envelope = Envelope::new(Action::Message, data).with_user(id.as_str());
                if let Err(e) = hub.broadcast(&envelope.to_json(), Some(id)) {
                    warn!(conn = %id, error = %e, "Message dropped");
                }
            }
            ("users", _) => {
                let envelope = Envelope::new(Action::Users, user_list(id, &hub.ids()));
                if let Err(e) = hub.send_to(id, &envelope.to_json()) {
                    warn!(conn = %id, error = %e, "User list not sent");
                }
            }
            // heartbeat replies only matter as activity
            ("ping", _) => {}
            (action, _) => debug!(conn = %id, action, "Ignoring envelope"),
        }
    }

    fn on_close(&mut self, hub: &mut Hub<'_, T>, id: &ConnectionId, _reason: &CloseReason) {
        self.announce(hub, format!("user {id} disconnected"), None);
        self.refresh_users(hub);
    }

    fn heartbeat(&self) -> Vec<u8> {
        super::ping_envelope()
    }
}
