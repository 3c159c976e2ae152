//! Line-delimited JSON protocol spoken with the agent subprocess.
//!
//! Requests carry an `id` and a `type`; the agent answers each with a
//! `{"type": "response", "id": ...}` line. Everything else the agent writes is
//! an untagged event belonging to whatever generation is in progress.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::BridgeError;

/// Encode a request as a single protocol line (including the trailing newline).
///
/// `args` must be a JSON object or `null`; its fields are merged next to
/// `id` and `type`.
pub fn encode_request(id: &str, command: &str, args: Value) -> Result<String, BridgeError> {
    let mut body = match args {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        _ => {
            return Err(BridgeError::InvalidArgs {
                command: command.to_string(),
            });
        }
    };
    body.insert("id".to_string(), Value::String(id.to_string()));
    body.insert("type".to_string(), Value::String(command.to_string()));

    let mut line = serde_json::to_string(&Value::Object(body))?;
    line.push('\n');
    Ok(line)
}

/// A correlated reply to an earlier request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default)]
    pub command: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    /// Convert into the caller-facing result. `command` names the request
    /// this answers, for the error message.
    pub fn into_result(self, command: &str) -> Result<Value, BridgeError> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(BridgeError::Rpc {
                command: command.to_string(),
                message: self.error.unwrap_or_else(|| "unknown error".to_string()),
            })
        }
    }
}

/// One classified line read from the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(Response),
    Event(Value),
}

/// Classify a raw line. Blank lines yield `Ok(None)`; unparsable lines are
/// returned as errors for the caller to log and drop.
pub fn parse_line(line: &str) -> Result<Option<Incoming>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(line)?;
    let is_response = value.get("type").and_then(Value::as_str) == Some("response")
        && value.get("id").is_some_and(Value::is_string);

    if is_response {
        let response = serde_json::from_value(value)?;
        Ok(Some(Incoming::Response(response)))
    } else {
        Ok(Some(Incoming::Event(value)))
    }
}

/// Typed view of an untagged streaming event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart,
    MessageUpdate {
        #[serde(default, rename = "assistantMessageEvent")]
        assistant_message_event: Option<AssistantMessageEvent>,
    },
    ToolExecutionStart {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    ToolExecutionEnd {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default, rename = "isError")]
        is_error: bool,
    },
    AgentEnd,
    #[serde(other)]
    Other,
}

impl AgentEvent {
    /// Decode an event, treating anything malformed as [`AgentEvent::Other`].
    pub fn from_value(value: &Value) -> Self {
        Self::deserialize(value).unwrap_or(Self::Other)
    }

    /// The text fragment carried by a `message_update`, if any.
    pub fn text_delta(&self) -> Option<&str> {
        match self {
            Self::MessageUpdate {
                assistant_message_event: Some(AssistantMessageEvent::TextDelta { delta }),
            } => Some(delta),
            _ => None,
        }
    }
}

/// The inner event of a `message_update`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantMessageEvent {
    TextDelta { delta: String },
    #[serde(other)]
    Other,
}

/// A model advertised by `get_available_models`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelInfo {
    pub provider: String,
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl ModelInfo {
    /// `provider/id`, the fully qualified model reference.
    pub fn qualified(&self) -> String {
        format!("{}/{}", self.provider, self.id)
    }
}
