use std::path::Path;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::traits::{AiError, AiResult, ChatModel, Diarizer, EmbeddingModel, Transcriber};
use crate::types::{ChatMessage, Segment, SpeakerTurn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_EMBED_MODEL: &str = "text-embedding-3-small";

/// One concrete implementation of every model contract this crate
/// defines, talking to any OpenAI-compatible HTTP API. Used by the
/// daemon for transcription, by the summarizer for chat, and by the RAG
/// subscriber for embeddings.
pub struct OpenAiProvider {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
    chat_model: String,
    embed_model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = model.into();
        self
    }

    pub fn with_embed_model(mut self, model: impl Into<String>) -> Self {
        self.embed_model = model.into();
        self
    }

    fn headers(&self) -> AiResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|_| AiError::Provider { status: 0, body: "invalid api key header".into() })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn check_status(response: reqwest::Response) -> AiResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(AiError::Provider { status, body })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: JsonSchemaWrapper<'a>,
}

#[derive(Serialize)]
struct JsonSchemaWrapper<'a> {
    name: &'static str,
    schema: &'a serde_json::Value,
    strict: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[async_trait]
impl ChatModel for OpenAiProvider {
    async fn complete(&self, messages: &[ChatMessage]) -> AiResult<String> {
        let request = ChatRequest {
            model: &self.chat_model,
            messages,
            response_format: None,
        };

        debug!(model = %self.chat_model, "chat completion request");

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(AiError::EmptyResponse)
    }

    async fn complete_json(&self, messages: &[ChatMessage], schema: &serde_json::Value) -> AiResult<String> {
        let request = ChatRequest {
            model: &self.chat_model,
            messages,
            response_format: Some(ResponseFormat {
                kind: "json_schema",
                json_schema: JsonSchemaWrapper {
                    name: "structured_output",
                    schema,
                    strict: true,
                },
            }),
        };

        debug!(model = %self.chat_model, "structured output request");

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(AiError::EmptyResponse)
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: serde_json::Value,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingModel for OpenAiProvider {
    async fn embed(&self, text: &str) -> AiResult<Vec<f32>> {
        let mut batch = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        batch.pop().ok_or(AiError::EmptyResponse)
    }

    async fn embed_batch(&self, texts: &[String]) -> AiResult<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: &self.embed_model,
            input: serde_json::Value::Array(
                texts.iter().cloned().map(serde_json::Value::String).collect(),
            ),
        };

        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let parsed: EmbeddingResponse = response.json().await?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    segments: Vec<TranscriptionSegment>,
}

#[derive(Deserialize)]
struct TranscriptionSegment {
    start: f64,
    end: f64,
    text: String,
}

#[async_trait]
impl Transcriber for OpenAiProvider {
    async fn transcribe(&self, audio_path: &Path) -> AiResult<Vec<Segment>> {
        let bytes = tokio::fs::read(audio_path)
            .await
            .map_err(|e| AiError::Provider { status: 0, body: format!("failed to read audio file: {e}") })?;

        let file_name = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio".to_string());

        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new()
            .text("model", "whisper-1")
            .text("response_format", "verbose_json")
            .part("file", part);

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|_| AiError::Provider { status: 0, body: "invalid api key header".into() })?,
        );

        let response = self
            .http
            .post(format!("{}/audio/transcriptions", self.base_url))
            .headers(headers)
            .multipart(form)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let parsed: TranscriptionResponse = response.json().await?;
        Ok(parsed
            .segments
            .into_iter()
            .map(|s| Segment {
                start_seconds: s.start,
                end_seconds: s.end,
                text: s.text,
            })
            .collect())
    }
}

/// Diarization model internals are entirely out of scope; this
/// implementation always falls back to the sentinel-speaker path so the
/// pipeline is exercised end to end without depending on a speaker
/// clustering model.
pub struct NullDiarizer;

#[async_trait]
impl Diarizer for NullDiarizer {
    async fn diarize(&self, _wav_path: &Path, segments: &[Segment]) -> AiResult<Vec<SpeakerTurn>> {
        Ok(crate::traits::fallback_turns(segments))
    }
}
