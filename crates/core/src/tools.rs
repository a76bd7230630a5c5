//! Local functions the remote model may call during a session.
//!
//! Handlers are registered by name in a [`ToolCallDispatcher`]. The dispatcher
//! advertises their declarations in the connection handshake and answers
//! each request with a response carrying the same call id.

use chrono::Local;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// A function call issued by the remote model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// The local answer to a [`ToolCallRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub name: String,
    pub result: Value,
}

/// What the model is told about a function: its name, purpose and a JSON
/// schema for its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
}

#[cfg_attr(test, mockall::automock)]
pub trait ToolHandler: Send + Sync {
    fn declaration(&self) -> ToolDeclaration;

    /// Runs the function. Must not block on the network.
    fn call(&self, args: &Value) -> Result<Value, ToolError>;

    /// Short text shown while the call runs.
    fn status_text(&self) -> String;
}

#[derive(Clone, Default)]
pub struct ToolCallDispatcher {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl ToolCallDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher with the built-in clock and dice functions registered.
    pub fn with_builtins() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(Arc::new(CurrentTime));
        dispatcher.register(Arc::new(RollDice));
        dispatcher
    }

    /// Registers a handler under its declared name, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.declaration().name;
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!(tool = %name, "Replaced an already registered tool handler");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.handlers.values().map(|h| h.declaration()).collect()
    }

    /// Status text for a batch of requests, taken from the first known handler.
    pub fn status_text(&self, requests: &[ToolCallRequest]) -> String {
        requests
            .iter()
            .find_map(|request| self.handlers.get(&request.name))
            .map(|handler| handler.status_text())
            .unwrap_or_else(|| "Working on it...".to_string())
    }

    /// Executes one request. Failures become an `error` result so the model
    /// always gets an answer for the call id.
    pub fn dispatch(&self, request: &ToolCallRequest) -> ToolCallResponse {
        let outcome = match self.handlers.get(&request.name) {
            Some(handler) => handler.call(&request.args),
            None => Err(ToolError::UnknownFunction(request.name.clone())),
        };

        let result = match outcome {
            Ok(value) => {
                info!(tool = %request.name, id = %request.id, "Tool call succeeded");
                value
            }
            Err(e) => {
                warn!(tool = %request.name, id = %request.id, error = %e, "Tool call failed");
                json!({ "error": e.to_string() })
            }
        };

        ToolCallResponse {
            id: request.id.clone(),
            name: request.name.clone(),
            result,
        }
    }
}

/// Reports the local date and time.
pub struct CurrentTime;

impl ToolHandler for CurrentTime {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: "get_current_time".to_string(),
            description: "Returns the user's current local date, time and weekday.".to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    fn call(&self, _args: &Value) -> Result<Value, ToolError> {
        let now = Local::now();
        Ok(json!({
            "datetime": now.to_rfc3339(),
            "weekday": now.format("%A").to_string(),
            "utc_offset": now.format("%:z").to_string(),
        }))
    }

    fn status_text(&self) -> String {
        "Checking the clock...".to_string()
    }
}

/// Rolls dice for games the model plays with the user.
pub struct RollDice;

const MAX_DICE: u64 = 20;

impl ToolHandler for RollDice {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: "roll_dice".to_string(),
            description: "Rolls one or more dice and returns each result.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "sides": { "type": "integer", "description": "Faces per die, default 6." },
                    "count": { "type": "integer", "description": "Number of dice, default 1." }
                }
            }),
        }
    }

    fn call(&self, args: &Value) -> Result<Value, ToolError> {
        let sides = args.get("sides").and_then(Value::as_u64).unwrap_or(6);
        let count = args.get("count").and_then(Value::as_u64).unwrap_or(1);
        if sides < 2 {
            return Err(ToolError::InvalidArguments(format!(
                "a die needs at least 2 sides, got {sides}"
            )));
        }
        if count == 0 || count > MAX_DICE {
            return Err(ToolError::InvalidArguments(format!(
                "can roll between 1 and {MAX_DICE} dice, got {count}"
            )));
        }

        let mut rng = rand::rng();
        let rolls: Vec<u64> = (0..count).map(|_| rng.random_range(1..=sides)).collect();
        let total: u64 = rolls.iter().sum();
        Ok(json!({ "rolls": rolls, "total": total }))
    }

    fn status_text(&self) -> String {
        "Rolling the dice...".to_string()
    }
}
