//! Completion and summarization services
//!
//! The generative service is an external collaborator. It hands back a lazy,
//! one-pass stream of [`CompletionEvent`]s which the engine applies to the
//! tree in arrival order. Provider wire formats live in [`Dialect`] so the
//! tree logic only ever sees `Role::User` / `Role::Model`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::CompletionError;
use crate::tree::Role;

/// One item of a completion stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    Fragment(String),
    /// Mid-stream error; the stream may keep going afterwards
    Error(String),
}

/// Lazy, finite, not restartable
pub type FragmentStream = BoxStream<'static, CompletionEvent>;

/// A file sent along with the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    pub fn base64(&self) -> String {
        STANDARD.encode(&self.data)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Role-tagged history from the root down to the target's parent chain
    pub history: Vec<(Role, String)>,
    pub attachments: Vec<Attachment>,
    pub model: String,
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn generate(&self, request: CompletionRequest)
        -> Result<FragmentStream, CompletionError>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// A short title for a prompt/response pair
    async fn summarize(
        &self,
        prompt: &str,
        response: &str,
        model: &str,
    ) -> Result<String, CompletionError>;
}

// ============================================================================
// Provider dialects
// ============================================================================

/// Wire format of a completion provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `{role: user|model, parts: [{text}]}`
    Gemini,
    /// `{role: user|assistant, content}`
    OpenAi,
}

impl Dialect {
    pub fn role_name(&self, role: Role) -> &'static str {
        match (self, role) {
            (_, Role::User) => "user",
            (Dialect::Gemini, Role::Model) => "model",
            (Dialect::OpenAi, Role::Model) => "assistant",
        }
    }

    /// Full message array for a request: history followed by the new user turn
    pub fn build_messages(&self, request: &CompletionRequest) -> Value {
        let mut out: Vec<Value> = request
            .history
            .iter()
            .map(|(role, text)| self.history_entry(*role, text))
            .collect();
        out.push(self.user_turn(&request.prompt, &request.attachments));
        Value::Array(out)
    }

    fn history_entry(&self, role: Role, text: &str) -> Value {
        match self {
            Dialect::Gemini => json!({ "role": self.role_name(role), "parts": [{ "text": text }] }),
            Dialect::OpenAi => json!({ "role": self.role_name(role), "content": text }),
        }
    }

    fn user_turn(&self, prompt: &str, attachments: &[Attachment]) -> Value {
        match self {
            Dialect::Gemini => {
                let mut parts = Vec::new();
                if !prompt.trim().is_empty() {
                    parts.push(json!({ "text": prompt }));
                }
                for a in attachments {
                    parts.push(json!({
                        "inlineData": { "mimeType": a.mime_type, "data": a.base64() }
                    }));
                }
                json!({ "role": "user", "parts": parts })
            }
            Dialect::OpenAi => {
                if attachments.is_empty() {
                    return json!({ "role": "user", "content": prompt });
                }
                let mut parts = Vec::new();
                if !prompt.trim().is_empty() {
                    parts.push(json!({ "type": "text", "text": prompt }));
                }
                for a in attachments {
                    if a.is_image() {
                        parts.push(json!({
                            "type": "image_url",
                            "image_url": { "url": format!("data:{};base64,{}", a.mime_type, a.base64()) }
                        }));
                    } else {
                        tracing::warn!(name = %a.name, mime = %a.mime_type, "attachment type not supported by this dialect, skipping");
                    }
                }
                json!({ "role": "user", "content": parts })
            }
        }
    }
}

// ============================================================================
// Titles
// ============================================================================

/// Instruction sent to a summarizer for a prompt/response pair
pub fn title_prompt(prompt: &str, response: &str) -> String {
    let excerpt: String = response.chars().take(150).collect();
    format!(
        "Generate a short, descriptive title (2-6 words) for this conversation. Do not use quotes or special characters.\n\nUser: \"{}\"\nAI: \"{}...\"\n\nTitle:",
        prompt, excerpt
    )
}

/// Clean a raw summarizer answer, or fall back when it is unusable
/// (empty, shorter than 3 or longer than 60 characters, or just the start
/// of the prompt repeated back).
pub fn sanitize_title(raw: &str, prompt: &str, fallback: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | '#' | '*' | '\n' | '\r'))
        .collect();
    let title = cleaned.trim();
    let len = title.chars().count();

    if title.is_empty()
        || !(3..=60).contains(&len)
        || prompt.to_lowercase().starts_with(&title.to_lowercase())
    {
        return fallback.to_string();
    }
    title.to_string()
}

// ============================================================================
// Offline services
// ============================================================================

/// Split text into word tokens that keep their trailing whitespace, so
/// concatenating the tokens gives back the input exactly
pub fn word_fragments(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_space = false;

    for c in text.chars() {
        if c.is_whitespace() {
            in_space = true;
        } else if in_space {
            out.push(std::mem::take(&mut current));
            in_space = false;
        }
        current.push(c);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Completion service that answers locally by echoing the prompt, streamed
/// word by word. Useful without network access.
#[derive(Debug, Clone, Default)]
pub struct EchoCompletion;

#[async_trait]
impl CompletionService for EchoCompletion {
    async fn generate(
        &self,
        request: CompletionRequest,
    ) -> Result<FragmentStream, CompletionError> {
        let turns = request.history.len() / 2;
        let reply = format!(
            "[{}] after {} earlier turn(s) you said: {}",
            request.model, turns, request.prompt
        );
        let fragments = word_fragments(&reply)
            .into_iter()
            .map(CompletionEvent::Fragment);
        Ok(stream::iter(fragments).boxed())
    }
}

/// Summarizer that titles a pair from the first words of the response
#[derive(Debug, Clone)]
pub struct HeuristicSummarizer {
    pub max_words: usize,
}

impl Default for HeuristicSummarizer {
    fn default() -> Self {
        Self { max_words: 5 }
    }
}

#[async_trait]
impl Summarizer for HeuristicSummarizer {
    async fn summarize(
        &self,
        _prompt: &str,
        response: &str,
        _model: &str,
    ) -> Result<String, CompletionError> {
        let words: Vec<String> = response
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            .filter(|w| !w.is_empty())
            .take(self.max_words)
            .collect();
        if words.is_empty() {
            return Err(CompletionError::Rejected("empty response".to_string()));
        }
        Ok(words.join(" "))
    }
}

/// Summarizer that asks a completion service for the title with
/// [`title_prompt`]
#[derive(Clone)]
pub struct CompletionSummarizer {
    completion: Arc<dyn CompletionService>,
}

impl CompletionSummarizer {
    pub fn new(completion: Arc<dyn CompletionService>) -> Self {
        Self { completion }
    }
}

#[async_trait]
impl Summarizer for CompletionSummarizer {
    async fn summarize(
        &self,
        prompt: &str,
        response: &str,
        model: &str,
    ) -> Result<String, CompletionError> {
        let request = CompletionRequest {
            prompt: title_prompt(prompt, response),
            history: Vec::new(),
            attachments: Vec::new(),
            model: model.to_string(),
        };
        let mut stream = self.completion.generate(request).await?;

        let mut title = String::new();
        while let Some(event) = stream.next().await {
            match event {
                CompletionEvent::Fragment(f) => title.push_str(&f),
                CompletionEvent::Error(e) => tracing::debug!(error = %e, "error in title stream"),
            }
        }
        if title.trim().is_empty() {
            return Err(CompletionError::Rejected("empty title".to_string()));
        }
        Ok(title)
    }
}
