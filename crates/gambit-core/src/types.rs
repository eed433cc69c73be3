//! Chat-shaped message types shared by every crate in the workspace

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Instant;

/// Message role
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a conversation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    /// Tool result addressed to a prior tool call.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            name: Some(name.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool call from the assistant, OpenAI-chat shaped.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

impl ToolCall {
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn parse_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.function.arguments.trim().is_empty() {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.function.arguments)
    }
}

/// Tool definition handed to the model.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Why a model turn ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool_calls",
            Self::Length => "length",
        }
    }
}

/// Token usage
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// One completed model request/response cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatTurn {
    pub message: Message,
    pub finish_reason: FinishReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Model parameters declared in deck front matter; unrecognized keys are
/// forwarded to the provider untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Run guardrails. `timeout_ms` is converted once at run start to an
/// absolute monotonic deadline that children inherit unchanged.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Guardrails {
    pub max_depth: u32,
    pub max_passes: u32,
    pub timeout_ms: u64,
}

pub const DEFAULT_MAX_DEPTH: u32 = 3;
pub const DEFAULT_MAX_PASSES: u32 = 10;
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_passes: DEFAULT_MAX_PASSES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl Guardrails {
    /// Absolute deadline for a run starting now, on the process monotonic
    /// clock.
    pub fn deadline_from_now(&self) -> u64 {
        monotonic_now_ms().saturating_add(self.timeout_ms)
    }
}

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds on a process-wide monotonic clock. Deadlines computed from
/// this value stay comparable across workers within one process.
pub fn monotonic_now_ms() -> u64 {
    PROCESS_EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Builtin tool names the orchestration loop owns.
pub const BUILTIN_TOOL_NAMES: &[&str] = &[
    "gambit_context",
    "gambit_init",
    "gambit_respond",
    "gambit_complete",
    "gambit_end",
];

/// Reserved prefix for builtin tools.
pub const RESERVED_TOOL_PREFIX: &str = "gambit_";

/// Terminal result of one deck run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunResult {
    /// `gambit_respond` finalization with a schema-validated payload.
    Responded {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        meta: Option<serde_json::Value>,
        payload: serde_json::Value,
    },
    /// `gambit_end` finalization; the session is terminal.
    Ended {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    /// Plain `stop` finish without a responder tool.
    Text { text: String },
    /// Tool calls the caller must execute; the run suspends here.
    ToolCalls { calls: Vec<ToolCall> },
    /// A native executor's validated return value.
    Value { value: serde_json::Value },
}

impl RunResult {
    /// JSON projection used when a parent appends a child result as a tool
    /// message.
    pub fn to_tool_content(&self) -> String {
        let value = match self {
            Self::Responded { payload, .. } => payload.clone(),
            Self::Ended { payload, .. } => payload.clone().unwrap_or(serde_json::Value::Null),
            Self::Text { text } => serde_json::Value::String(text.clone()),
            Self::ToolCalls { calls } => serde_json::to_value(calls).unwrap_or_default(),
            Self::Value { value } => value.clone(),
        };
        match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        }
    }
}
