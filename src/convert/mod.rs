//! Anthropic <-> OpenAI format conversion.
//!
//! Inbound traffic is always Anthropic Messages API. When the selected
//! endpoint speaks OpenAI Chat Completions, the request body is converted on
//! the way out and the response (including SSE streams, see `stream`) is
//! converted back. The converter holds no cross-request state; streaming
//! state lives inside one `stream::OpenAiStreamConverter`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub mod stream;

pub const MESSAGES_PATH: &str = "/v1/messages";
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Default `anthropic-version` header value when the client sends none.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// String shorthand or an array of content blocks.
    pub content: Content,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Content {
    pub fn as_blocks(&self) -> Vec<ContentBlock> {
        match self {
            Content::Text(s) => vec![ContentBlock::Text { text: s.clone() }],
            Content::Blocks(v) => v.clone(),
        }
    }

    pub fn to_plaintext(&self) -> String {
        self.as_blocks().iter().map(ContentBlock::to_plaintext).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: Value,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl ContentBlock {
    pub fn to_plaintext(&self) -> String {
        match self {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::Image { .. } => "[image]".to_string(),
            ContentBlock::Thinking { thinking, .. } => thinking.clone(),
            ContentBlock::ToolUse { name, .. } => format!("[tool_use:{name}]"),
            ContentBlock::ToolResult { content, .. } => content.to_plaintext(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for ToolResultContent {
    fn default() -> Self {
        ToolResultContent::Text(String::new())
    }
}

impl ToolResultContent {
    pub fn to_plaintext(&self) -> String {
        match self {
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Blocks(v) => v.iter().map(ContentBlock::to_plaintext).collect(),
        }
    }
}

/// `system` accepts a plain string or typed text blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemContent {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

impl SystemContent {
    pub fn to_plaintext(&self) -> String {
        match self {
            SystemContent::Text(s) => s.clone(),
            SystemContent::Blocks(v) => v.iter().map(|b| b.text.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
}

/// Request body for `/v1/messages`. Fields with no OpenAI equivalent
/// (`top_k`, `metadata`, `thinking`) are carried for native endpoints and
/// dropped during conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemContent>,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Response body for `/v1/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

pub fn parse_messages_request(body: &[u8]) -> Result<MessagesRequest> {
    serde_json::from_slice(body).context("request body is not a valid messages request")
}

/// `finish_reason` -> `stop_reason`.
pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "stop" => "end_turn".to_string(),
        "length" => "max_tokens".to_string(),
        "tool_calls" | "function_call" => "tool_use".to_string(),
        other => other.to_string(),
    }
}

/// Convert an Anthropic Messages request into an OpenAI Chat Completions
/// payload: `system` becomes the first message, content blocks map to
/// messages / `tool_calls` / `role: tool` messages, shared sampling
/// parameters are carried over, everything else is dropped.
pub fn anthropic_request_to_openai(req: &MessagesRequest) -> Result<Value> {
    let mut out_messages: Vec<Value> = Vec::new();

    if let Some(system) = &req.system {
        let text = system.to_plaintext();
        if !text.is_empty() {
            out_messages.push(json!({"role": "system", "content": text}));
        }
    }

    for msg in &req.messages {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };

        let mut text = String::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        let mut tool_messages: Vec<Value> = Vec::new();

        for block in msg.content.as_blocks() {
            match block {
                ContentBlock::Text { text: t } => text.push_str(&t),
                // 思考块没有 OpenAI 对应物，按普通文本丢给上游会污染对话，直接丢弃。
                ContentBlock::Thinking { .. } => {}
                ContentBlock::Image { .. } => {}
                ContentBlock::ToolUse { id, name, input } => {
                    let args = serde_json::to_string(&input)
                        .context("failed to serialize tool_use input")?;
                    tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": args}
                    }));
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    tool_messages.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content.to_plaintext(),
                    }));
                }
            }
        }

        let mut obj = serde_json::Map::new();
        obj.insert("role".to_string(), json!(role));
        if !text.is_empty() {
            obj.insert("content".to_string(), json!(text));
        }
        if !tool_calls.is_empty() {
            obj.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }
        if obj.contains_key("content") || obj.contains_key("tool_calls") {
            out_messages.push(Value::Object(obj));
        }
        out_messages.extend(tool_messages);
    }

    let mut out = json!({
        "model": req.model,
        "messages": out_messages,
        "max_tokens": req.max_tokens,
    });
    let map = out.as_object_mut().expect("json object");

    if let Some(stream) = req.stream {
        map.insert("stream".to_string(), Value::Bool(stream));
        if stream {
            // Ask the upstream to attach usage to the final delta frame.
            map.insert("stream_options".to_string(), json!({"include_usage": true}));
        }
    }
    if let Some(t) = req.temperature {
        map.insert("temperature".to_string(), json!(t));
    }
    if let Some(tp) = req.top_p {
        map.insert("top_p".to_string(), json!(tp));
    }
    if let Some(ss) = &req.stop_sequences {
        map.insert("stop".to_string(), json!(ss));
    }
    if let Some(tools) = &req.tools {
        let mapped: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        map.insert("tools".to_string(), Value::Array(mapped));
    }
    if let Some(choice) = &req.tool_choice {
        let mapped = match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Any => json!("required"),
            ToolChoice::Tool { name } => json!({
                "type": "function",
                "function": {"name": name}
            }),
        };
        map.insert("tool_choice".to_string(), mapped);
    }

    Ok(out)
}

/// Convert an OpenAI Chat Completions request back into an Anthropic
/// Messages request: the leading system message becomes `system`,
/// `tool_calls` become tool_use blocks, `role: tool` messages become
/// tool_result blocks on a user turn. Inverse of
/// `anthropic_request_to_openai` for everything that conversion keeps.
pub fn openai_request_to_anthropic(req: &Value) -> Result<MessagesRequest> {
    let model = req
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown")
        .to_string();
    let max_tokens = req
        .get("max_tokens")
        .and_then(|m| m.as_u64())
        .context("missing max_tokens")? as u32;

    let mut system_text = String::new();
    let mut messages: Vec<Message> = Vec::new();

    let incoming = req
        .get("messages")
        .and_then(|m| m.as_array())
        .context("missing messages array")?;
    for msg in incoming {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        match role {
            "system" => {
                if let Some(text) = msg.get("content").and_then(|c| c.as_str()) {
                    system_text.push_str(text);
                }
            }
            "tool" => {
                let tool_use_id = msg
                    .get("tool_call_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("toolcall_unknown")
                    .to_string();
                let content = msg
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string();
                messages.push(Message {
                    role: Role::User,
                    content: Content::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id,
                        content: ToolResultContent::Text(content),
                        is_error: None,
                    }]),
                });
            }
            _ => {
                let role = if role == "assistant" {
                    Role::Assistant
                } else {
                    Role::User
                };
                let mut blocks: Vec<ContentBlock> = Vec::new();
                match msg.get("content") {
                    Some(Value::String(text)) if !text.is_empty() => {
                        blocks.push(ContentBlock::Text { text: text.clone() });
                    }
                    Some(Value::Array(parts)) => {
                        for part in parts {
                            if part.get("type").and_then(|t| t.as_str()) == Some("text")
                                && let Some(text) = part.get("text").and_then(|t| t.as_str())
                            {
                                blocks.push(ContentBlock::Text {
                                    text: text.to_string(),
                                });
                            }
                        }
                    }
                    _ => {}
                }
                if let Some(calls) = msg.get("tool_calls").and_then(|v| v.as_array()) {
                    for call in calls {
                        let func = call
                            .get("function")
                            .context("tool_calls[].function missing")?;
                        let name = func
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_string();
                        let id = call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("toolcall_unknown")
                            .to_string();
                        let args = func
                            .get("arguments")
                            .and_then(|v| v.as_str())
                            .unwrap_or("{}");
                        let input: Value =
                            serde_json::from_str(args).unwrap_or_else(|_| json!({"raw": args}));
                        blocks.push(ContentBlock::ToolUse { id, name, input });
                    }
                }
                if blocks.is_empty() {
                    continue;
                }
                // A lone text block collapses back to the string shorthand.
                let content = match blocks.as_slice() {
                    [ContentBlock::Text { text }] => Content::Text(text.clone()),
                    _ => Content::Blocks(blocks),
                };
                messages.push(Message { role, content });
            }
        }
    }

    let tools = req
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    let func = t.get("function")?;
                    Some(Tool {
                        name: func.get("name")?.as_str()?.to_string(),
                        description: func
                            .get("description")
                            .and_then(|d| d.as_str())
                            .map(|d| d.to_string()),
                        input_schema: func.get("parameters").cloned().unwrap_or_else(|| json!({})),
                    })
                })
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty());
    let tool_choice = match req.get("tool_choice") {
        Some(Value::String(s)) if s == "auto" => Some(ToolChoice::Auto),
        Some(Value::String(s)) if s == "required" => Some(ToolChoice::Any),
        Some(Value::Object(obj)) => obj
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
            .map(|name| ToolChoice::Tool {
                name: name.to_string(),
            }),
        _ => None,
    };

    Ok(MessagesRequest {
        model,
        messages,
        system: if system_text.is_empty() {
            None
        } else {
            Some(SystemContent::Text(system_text))
        },
        max_tokens,
        stream: req.get("stream").and_then(|s| s.as_bool()),
        temperature: req.get("temperature").and_then(|t| t.as_f64()),
        top_p: req.get("top_p").and_then(|t| t.as_f64()),
        top_k: None,
        stop_sequences: req.get("stop").and_then(|s| s.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        }),
        tools,
        tool_choice,
        thinking: None,
        metadata: None,
    })
}

/// Convert an OpenAI Chat Completions response back into an Anthropic
/// message: `content` is rebuilt as an ordered array of text / tool_use
/// blocks, `stop_reason` is synthesized from `finish_reason`, usage is
/// mapped from `prompt_tokens` / `completion_tokens`.
pub fn openai_response_to_anthropic(
    resp: &Value,
    fallback_model: &str,
) -> Result<MessagesResponse> {
    let id = resp
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or("msg_unknown")
        .to_string();
    let model = resp
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or(fallback_model)
        .to_string();

    let choice = resp
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .context("missing choices[0]")?;
    let message = choice
        .get("message")
        .context("missing choices[0].message")?;
    let finish_reason = choice.get("finish_reason").and_then(|v| v.as_str());

    let mut content: Vec<ContentBlock> = Vec::new();
    if let Some(text) = message.get("content").and_then(|c| c.as_str())
        && !text.is_empty()
    {
        content.push(ContentBlock::Text {
            text: text.to_string(),
        });
    }
    if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for call in calls {
            let func = call.get("function").context("tool_calls[].function missing")?;
            let name = func
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let id = call
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("toolcall_unknown")
                .to_string();
            let args = func
                .get("arguments")
                .and_then(|v| v.as_str())
                .unwrap_or("{}");
            let input: Value =
                serde_json::from_str(args).unwrap_or_else(|_| json!({"raw": args}));
            content.push(ContentBlock::ToolUse { id, name, input });
        }
    }

    let usage = resp
        .get("usage")
        .map(|u| Usage {
            input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: u
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        })
        .unwrap_or_default();

    Ok(MessagesResponse {
        id,
        kind: "message".to_string(),
        role: Role::Assistant,
        content,
        model,
        stop_reason: finish_reason.map(map_finish_reason),
        stop_sequence: None,
        usage,
    })
}
