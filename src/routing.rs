use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::channel::SessionId;
use crate::message::Message;

/// Prefix of the request ids the proxy assigns on shared backend channels.
pub const ROUTING_KEY_PREFIX: &str = "mcpx-";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("backend message carries no routing key")]
    Untagged,
    #[error("no session is waiting on routing key {0}")]
    Unmatched(String),
}

struct Route {
    session: SessionId,
    original_id: Value,
}

#[derive(Default)]
struct RoutingState {
    next_key: u64,
    routes: HashMap<String, Route>,
    by_session: HashMap<SessionId, HashSet<String>>,
}

/// Maps proxy-assigned request ids back to the session and id they replaced.
///
/// Requests a session sends to a shared backend get a fresh `mcpx-<n>` id; the
/// backend echoes it in its response, which is how the response finds its way home.
#[derive(Default)]
pub struct RoutingTable {
    state: Mutex<RoutingState>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrites the ids of every request in `message` to routing keys owned by
    /// `session`. Notifications, responses and non-JSON frames pass through as-is.
    pub fn tag(&self, session: &SessionId, message: &Message) -> Message {
        let Some(mut value) = message.parse() else {
            return message.clone();
        };

        let mut state = self.state.lock();
        let tagged = match &mut value {
            Value::Array(items) => items
                .iter_mut()
                .fold(false, |tagged, item| state.tag_member(session, item) || tagged),
            member => state.tag_member(session, member),
        };

        if tagged {
            Message::from_value(&value)
        } else {
            message.clone()
        }
    }

    /// Finds the session a backend message belongs to and restores the id that
    /// session originally used. Each routing key is good for one response.
    pub fn route(&self, message: &Message) -> Result<(SessionId, Message), RoutingError> {
        let Some(Value::Object(mut obj)) = message.parse() else {
            return Err(RoutingError::Untagged);
        };
        let key = match obj.get("id") {
            Some(Value::String(key)) if key.starts_with(ROUTING_KEY_PREFIX) => key.clone(),
            _ => return Err(RoutingError::Untagged),
        };

        let route = {
            let mut state = self.state.lock();
            let route = state
                .routes
                .remove(&key)
                .ok_or_else(|| RoutingError::Unmatched(key.clone()))?;
            if let Some(keys) = state.by_session.get_mut(&route.session) {
                keys.remove(&key);
                if keys.is_empty() {
                    state.by_session.remove(&route.session);
                }
            }
            route
        };

        obj.insert("id".to_string(), route.original_id);
        Ok((route.session, Message::from_value(&Value::Object(obj))))
    }

    /// Forgets every route owned by `session`. Late responses for it are then
    /// unmatched and dropped.
    pub fn release_session(&self, session: &SessionId) -> usize {
        let mut state = self.state.lock();
        let Some(keys) = state.by_session.remove(session) else {
            return 0;
        };
        for key in &keys {
            state.routes.remove(key);
        }
        keys.len()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().routes.len()
    }
}

impl RoutingState {
    fn tag_member(&mut self, session: &SessionId, member: &mut Value) -> bool {
        let Value::Object(obj) = member else {
            return false;
        };
        if !obj.contains_key("method") {
            return false;
        }
        let Some(original_id) = obj.get("id").filter(|id| !id.is_null()).cloned() else {
            return false;
        };

        self.next_key += 1;
        let key = format!("{ROUTING_KEY_PREFIX}{}", self.next_key);
        obj.insert("id".to_string(), Value::String(key.clone()));
        self.routes.insert(
            key.clone(),
            Route {
                session: session.clone(),
                original_id,
            },
        );
        self.by_session
            .entry(session.clone())
            .or_default()
            .insert(key);
        true
    }
}
