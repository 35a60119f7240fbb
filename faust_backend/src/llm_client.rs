//! Generation Service client.
//!
//! The rest of the crate talks to the model through [`GenerationService`], so the
//! supervision loop can be driven by a scripted fake in tests. [`LlmClient`] is the
//! production implementation against an OpenAI-compatible `/chat/completions`
//! endpoint (Ollama, LM Studio, vLLM, OpenAI, Gemini's compatibility layer, ...).

use std::collections::VecDeque;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationTurn, Part};

/// Lazy, finite, non-restartable sequence of text chunks.
pub type TextStream = BoxStream<'static, Result<String>>;

/// Everything a streamed chat turn needs. Stateless: built fresh for every call
/// from the caller's current history snapshot.
#[derive(Debug, Clone)]
pub struct GenerationSession {
    pub model: String,
    pub history: Vec<ConversationTurn>,
    pub system_instruction: String,
}

pub fn create_session(
    model: &str,
    history: &[ConversationTurn],
    system_instruction: &str,
) -> GenerationSession {
    GenerationSession {
        model: model.to_string(),
        history: history.to_vec(),
        system_instruction: system_instruction.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SingleShotOptions {
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Submit `parts` as a new user turn on top of `session` and stream the reply.
    async fn send_streaming(
        &self,
        session: &GenerationSession,
        parts: Vec<Part>,
    ) -> Result<TextStream>;

    /// One non-streaming completion with no history.
    async fn single_shot(
        &self,
        model: &str,
        parts: Vec<Part>,
        options: &SingleShotOptions,
    ) -> Result<String>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: DataUrl },
    File { file: InlineFile },
}

#[derive(Debug, Clone, Serialize)]
struct DataUrl {
    url: String,
}

#[derive(Debug, Clone, Serialize)]
struct InlineFile {
    filename: String,
    file_data: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: Option<String>) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            client: reqwest::Client::new(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    async fn post(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_url);
        let mut req = self.client.post(&url).json(request);

        // Local servers usually run without a key
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        Ok(response)
    }
}

#[async_trait]
impl GenerationService for LlmClient {
    async fn send_streaming(
        &self,
        session: &GenerationSession,
        parts: Vec<Part>,
    ) -> Result<TextStream> {
        let mut messages = Vec::with_capacity(session.history.len() + 2);
        if !session.system_instruction.is_empty() {
            messages.push(Message {
                role: "system",
                content: MessageContent::Text(session.system_instruction.clone()),
            });
        }
        for turn in &session.history {
            messages.push(Message {
                role: turn.speaker.as_str(),
                content: render_parts(&turn.to_parts()),
            });
        }
        messages.push(Message {
            role: "user",
            content: render_parts(&parts),
        });

        let request = ChatCompletionRequest {
            model: session.model.clone(),
            messages,
            temperature: None,
            top_p: None,
            top_k: None,
            stream: true,
        };

        let response = self
            .post(&request)
            .await
            .context("Failed to open streaming completion")?;

        let state = SseState {
            response,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            finished: false,
        };
        let stream = futures_util::stream::try_unfold(state, next_sse_chunk);

        Ok(Box::pin(stream))
    }

    async fn single_shot(
        &self,
        model: &str,
        parts: Vec<Part>,
        options: &SingleShotOptions,
    ) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = options.system_instruction.as_deref() {
            messages.push(Message {
                role: "system",
                content: MessageContent::Text(system.to_string()),
            });
        }
        messages.push(Message {
            role: "user",
            content: render_parts(&parts),
        });

        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages,
            temperature: options.temperature,
            top_p: options.top_p,
            top_k: options.top_k,
            stream: false,
        };

        let completion: ChatCompletionResponse = self
            .post(&request)
            .await?
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }
}

async fn next_sse_chunk(mut state: SseState) -> Result<Option<(String, SseState)>> {
    loop {
        if let Some(chunk) = state.pending.pop_front() {
            return Ok(Some((chunk, state)));
        }
        if state.finished {
            return Ok(None);
        }
        match state
            .response
            .chunk()
            .await
            .context("Failed reading streaming chunk")?
        {
            Some(bytes) => {
                state.buffer.extend_from_slice(&bytes);
                state.drain_lines(false)?;
            }
            None => {
                state.drain_lines(true)?;
                state.finished = true;
            }
        }
    }
}

struct SseState {
    response: reqwest::Response,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    finished: bool,
}

impl SseState {
    /// Moves every complete line out of the byte buffer. Lines are split on raw
    /// bytes so multi-byte characters straddling two network chunks survive.
    fn drain_lines(&mut self, flush: bool) -> Result<()> {
        while let Some(newline_idx) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_idx).collect();
            if self.accept_line(&String::from_utf8_lossy(&line))? {
                return Ok(());
            }
        }
        if flush && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.accept_line(&String::from_utf8_lossy(&line))?;
        }
        Ok(())
    }

    /// Returns true once the terminator has been seen.
    fn accept_line(&mut self, line: &str) -> Result<bool> {
        match parse_sse_line(line)? {
            SseLine::Skip => Ok(false),
            SseLine::Delta(text) => {
                self.pending.push_back(text);
                Ok(false)
            }
            SseLine::Done => {
                self.finished = true;
                self.buffer.clear();
                Ok(true)
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Skip,
    Delta(String),
    Done,
}

fn parse_sse_line(line: &str) -> Result<SseLine> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(SseLine::Skip);
    }
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let chunk_json: serde_json::Value = serde_json::from_str(payload)
        .with_context(|| format!("Failed to parse stream payload: {}", payload))?;

    let delta = chunk_json["choices"]
        .as_array()
        .and_then(|arr| arr.first())
        .and_then(|choice| choice["delta"]["content"].as_str())
        .filter(|text| !text.is_empty());

    Ok(match delta {
        Some(text) => SseLine::Delta(text.to_string()),
        None => SseLine::Skip,
    })
}

fn render_parts(parts: &[Part]) -> MessageContent {
    if let [Part::Text { text }] = parts {
        return MessageContent::Text(text.clone());
    }

    let rendered = parts
        .iter()
        .map(|part| match part {
            Part::Text { text } => ContentPart::Text { text: text.clone() },
            Part::InlineData { mime_type, data } => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(data);
                let data_url = format!("data:{};base64,{}", mime_type, encoded);
                if mime_type.starts_with("image/") {
                    ContentPart::ImageUrl {
                        image_url: DataUrl { url: data_url },
                    }
                } else {
                    ContentPart::File {
                        file: InlineFile {
                            filename: default_filename(mime_type),
                            file_data: data_url,
                        },
                    }
                }
            }
        })
        .collect();
    MessageContent::Parts(rendered)
}

fn default_filename(mime_type: &str) -> String {
    match mime_type {
        "application/pdf" => "upload.pdf".to_string(),
        other => format!("upload.{}", other.rsplit('/').next().unwrap_or("bin")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sse_line_extracts_delta_content() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(
            parse_sse_line(line).unwrap(),
            SseLine::Delta("Hel".to_string())
        );
    }

    #[test]
    fn parse_sse_line_handles_terminator_comments_and_role_only_deltas() {
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            SseLine::Skip
        );
    }

    #[test]
    fn parse_sse_line_rejects_malformed_payload() {
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[test]
    fn single_text_part_serializes_as_plain_string() {
        let content = render_parts(&[Part::text("hello")]);
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json, serde_json::json!("hello"));
    }

    #[test]
    fn inline_image_serializes_as_data_url() {
        let content = render_parts(&[Part::inline("image/png", vec![1, 2, 3]), Part::text("what?")]);
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json[0]["type"], "image_url");
        assert_eq!(json[0]["image_url"]["url"], "data:image/png;base64,AQID");
        assert_eq!(json[1]["type"], "text");
        assert_eq!(json[1]["text"], "what?");
    }

    #[test]
    fn pdf_serializes_as_inline_file() {
        let content = render_parts(&[Part::inline("application/pdf", vec![37, 80])]);
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json[0]["type"], "file");
        assert_eq!(json[0]["file"]["filename"], "upload.pdf");
    }

    #[test]
    fn request_omits_unset_sampling_fields_and_stream_flag() {
        let request = ChatCompletionRequest {
            model: "m".to_string(),
            messages: vec![],
            temperature: Some(0.01),
            top_p: None,
            top_k: Some(1),
            stream: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("top_p").is_none());
        assert!(json.get("stream").is_none());
        assert_eq!(json["top_k"], 1);
    }
}
