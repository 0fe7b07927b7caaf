//! OpenAI SSE -> Anthropic SSE, one converter instance per stream.
//!
//! The converter is a pull-based state machine: upstream byte chunks go in,
//! fully formatted Anthropic SSE frames come out. It guarantees exactly one
//! `message_start` before any content block event and exactly one
//! `message_stop` after all blocks, with every `content_block_start` paired
//! with a `content_block_stop`. Raw bytes are buffered until a complete SSE
//! frame is present, so multi-byte UTF-8 sequences split across network
//! chunks never tear.

use std::collections::HashMap;

use serde_json::{Value, json};

use super::map_finish_reason;

fn sse_frame(event: &str, data: &Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

#[derive(Debug, Default)]
struct ToolCallBlock {
    /// Our Anthropic content block index.
    block_index: usize,
    started: bool,
    id: String,
    name: String,
}

#[derive(Debug)]
pub struct OpenAiStreamConverter {
    model: String,
    buf: Vec<u8>,
    started: bool,
    finished: bool,
    message_id: Option<String>,
    text_block: Option<usize>,
    next_index: usize,
    /// Keyed by the OpenAI `tool_calls[].index`; later deltas may omit the id.
    tool_calls: HashMap<u64, ToolCallBlock>,
    finish_reason: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
}

impl OpenAiStreamConverter {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            buf: Vec::new(),
            started: false,
            finished: false,
            message_id: None,
            text_block: None,
            next_index: 0,
            tool_calls: HashMap::new(),
            finish_reason: None,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Feed one upstream chunk; returns the client frames it produced.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buf.extend_from_slice(chunk);

        while let Some(pos) = find_frame_end(&self.buf) {
            let frame: Vec<u8> = self.buf.drain(..pos + 2).collect();
            let Ok(text) = std::str::from_utf8(&frame) else {
                // 完整帧内仍不是合法 UTF-8，只能丢弃该帧。
                continue;
            };
            for line in text.lines() {
                let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
                    continue;
                };
                if data == "[DONE]" {
                    out.extend(self.close());
                    return out;
                }
                let Ok(v) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                out.extend(self.on_delta(&v));
            }
        }
        out
    }

    /// Close the stream. Emits the closing frames exactly once, regardless of
    /// whether the upstream sent `[DONE]`.
    pub fn finish(&mut self) -> Vec<String> {
        self.close()
    }

    pub fn saw_message_stop(&self) -> bool {
        self.finished
    }

    fn on_delta(&mut self, v: &Value) -> Vec<String> {
        let mut out = Vec::new();

        if self.message_id.is_none() {
            self.message_id = v.get("id").and_then(|x| x.as_str()).map(|s| s.to_string());
        }
        if let Some(usage) = v.get("usage") {
            if let Some(p) = usage.get("prompt_tokens").and_then(|x| x.as_u64()) {
                self.input_tokens = p;
            }
            if let Some(c) = usage.get("completion_tokens").and_then(|x| x.as_u64()) {
                self.output_tokens = c;
            }
        }

        let Some(choice) = v
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            return out;
        };

        if !self.started {
            self.started = true;
            out.push(self.message_start_frame());
        }

        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(|c| c.as_str())
                && !text.is_empty()
            {
                let index = match self.text_block {
                    Some(i) => i,
                    None => {
                        let i = self.next_index;
                        self.next_index += 1;
                        self.text_block = Some(i);
                        out.push(sse_frame(
                            "content_block_start",
                            &json!({
                                "type": "content_block_start",
                                "index": i,
                                "content_block": {"type": "text", "text": ""}
                            }),
                        ));
                        i
                    }
                };
                out.push(sse_frame(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "text_delta", "text": text}
                    }),
                ));
            }

            if let Some(calls) = delta.get("tool_calls").and_then(|tc| tc.as_array()) {
                for call in calls {
                    out.extend(self.on_tool_call_delta(call));
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            self.finish_reason = Some(reason.to_string());
        }

        out
    }

    fn on_tool_call_delta(&mut self, call: &Value) -> Vec<String> {
        let mut out = Vec::new();
        let pos = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
        let func = call.get("function");

        let entry = self.tool_calls.entry(pos).or_default();
        if entry.id.is_empty()
            && let Some(id) = call.get("id").and_then(|x| x.as_str())
        {
            entry.id = id.to_string();
        }
        if entry.name.is_empty()
            && let Some(name) = func.and_then(|f| f.get("name")).and_then(|x| x.as_str())
        {
            entry.name = name.to_string();
        }

        if !entry.started && !entry.name.is_empty() {
            entry.started = true;
            entry.block_index = self.next_index;
            self.next_index += 1;
            if entry.id.is_empty() {
                entry.id = format!("toolcall_{}", pos + 1);
            }
            out.push(sse_frame(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": entry.block_index,
                    "content_block": {
                        "type": "tool_use",
                        "id": entry.id,
                        "name": entry.name,
                        "input": {}
                    }
                }),
            ));
        }

        if entry.started
            && let Some(args) = func
                .and_then(|f| f.get("arguments"))
                .and_then(|x| x.as_str())
            && !args.is_empty()
        {
            out.push(sse_frame(
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": entry.block_index,
                    "delta": {"type": "input_json_delta", "partial_json": args}
                }),
            ));
        }

        out
    }

    fn message_start_frame(&self) -> String {
        let id = self
            .message_id
            .clone()
            .unwrap_or_else(|| "msg_unknown".to_string());
        sse_frame(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {
                        "input_tokens": self.input_tokens,
                        "output_tokens": self.output_tokens
                    }
                }
            }),
        )
    }

    fn close(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.finished = true;

        if !self.started {
            // 空流也要满足事件序列约束。
            self.started = true;
            out.push(self.message_start_frame());
        }

        let mut open: Vec<usize> = Vec::new();
        if let Some(i) = self.text_block.take() {
            open.push(i);
        }
        for entry in self.tool_calls.values() {
            if entry.started {
                open.push(entry.block_index);
            }
        }
        open.sort_unstable();
        for index in open {
            out.push(sse_frame(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": index}),
            ));
        }

        let stop_reason = self
            .finish_reason
            .as_deref()
            .map(map_finish_reason)
            .unwrap_or_else(|| "end_turn".to_string());
        out.push(sse_frame(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {"output_tokens": self.output_tokens}
            }),
        ));
        out.push(sse_frame("message_stop", &json!({"type": "message_stop"})));
        out
    }
}

fn find_frame_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}
