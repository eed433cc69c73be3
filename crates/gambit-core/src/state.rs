//! Saved run state — the session snapshot a worker mutates and publishes.
//!
//! Two on-disk shapes are accepted: one carrying a chat-shaped `messages`
//! array, and one carrying response-shaped `items` from which the chat
//! projection is derived. Writers emit whichever shape they received.

use crate::types::{Message, Role, ToolCall};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Session snapshot. Created at run start, mutated only by the worker
/// executing the turn, published to the parent on every change.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedState {
    pub run_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<ResponseItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_refs: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traces: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_score: Option<f64>,
}

impl SavedState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    /// Fill the chat projection from `items` when the reader saw the
    /// item-centric shape. A state that already carries messages is left
    /// untouched.
    pub fn hydrate(&mut self) {
        if self.messages.is_empty() {
            if let Some(items) = &self.items {
                self.messages = derive_messages(items);
            }
        }
    }

    pub fn set_meta(&mut self, key: &str, value: serde_json::Value) {
        let meta = self
            .meta
            .get_or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        if let Some(map) = meta.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    pub fn get_meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.meta.as_ref().and_then(|m| m.get(key))
    }
}

/// A response-shaped item, the alternative persisted form.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseItem {
    Message {
        role: Role,
        content: Vec<ContentPart>,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    pub text: String,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            part_type: "text".to_string(),
            text: text.into(),
        }
    }
}

/// Chat projection of a response-shaped item list.
///
/// `function_call_output` items look their tool name up from the matching
/// `function_call`; an orphaned output keeps an empty name.
pub fn derive_messages(items: &[ResponseItem]) -> Vec<Message> {
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    for item in items {
        if let ResponseItem::FunctionCall { call_id, name, .. } = item {
            call_names.insert(call_id, name);
        }
    }

    let mut messages = Vec::with_capacity(items.len());
    for item in items {
        match item {
            ResponseItem::Message { role, content, .. } => {
                let text: String = content.iter().map(|p| p.text.as_str()).collect();
                messages.push(Message {
                    role: *role,
                    content: text,
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            ResponseItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => {
                messages.push(Message::assistant_with_tools(
                    "",
                    vec![ToolCall::function(call_id, name, arguments)],
                ));
            }
            ResponseItem::FunctionCallOutput {
                call_id, output, ..
            } => {
                let name = call_names.get(call_id.as_str()).copied().unwrap_or("");
                messages.push(Message::tool_result(call_id, name, output));
            }
        }
    }
    messages
}
