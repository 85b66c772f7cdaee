//! Wire types shared by the tool layer and the gateway

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The allow-list. Nothing outside this enum is ever executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Ping,
    Dig,
    Traceroute,
}

impl Tool {
    pub const ALL: [Tool; 3] = [Tool::Ping, Tool::Dig, Tool::Traceroute];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::Ping => "ping",
            Tool::Dig => "dig",
            Tool::Traceroute => "traceroute",
        }
    }

    /// Exact, case-sensitive lookup of a wire name.
    pub fn from_name(name: &str) -> Option<Tool> {
        Tool::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound request as sent by the client.
///
/// `tool` stays a plain string here so an unknown name surfaces as a
/// validation error rather than a parse error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub target: String,
    #[serde(default, deserialize_with = "nullable_map")]
    pub parameters: HashMap<String, String>,
}

impl CommandRequest {
    pub fn new(tool: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            target: target.into(),
            parameters: HashMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

fn nullable_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// One streamed unit of tool output.
///
/// A run yields zero or more data events and then exactly one terminal
/// event. The terminal event is the only one with `end_time` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEvent {
    pub tool: Tool,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl CommandEvent {
    /// A single stdout line.
    pub fn output(tool: Tool, target: &str, line: impl Into<String>) -> Self {
        Self {
            tool,
            target: target.to_string(),
            output: Some(line.into()),
            error: None,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// Accumulated stderr text. Not terminal.
    pub fn stderr(tool: Tool, target: &str, text: impl Into<String>) -> Self {
        Self {
            tool,
            target: target.to_string(),
            output: None,
            error: Some(text.into()),
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// The closing event of a run, optionally carrying an error.
    pub fn terminal(
        tool: Tool,
        target: &str,
        started: DateTime<Utc>,
        error: Option<String>,
    ) -> Self {
        Self {
            tool,
            target: target.to_string(),
            output: None,
            error,
            start_time: started,
            end_time: Some(Utc::now()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.end_time.is_some()
    }

    /// Run both text fields through [`crate::validator::sanitize_output`].
    pub fn sanitized(mut self) -> Self {
        self.output = self.output.map(|s| crate::validator::sanitize_output(&s));
        self.error = self.error.map(|s| crate::validator::sanitize_output(&s));
        self
    }
}
