//! OpenAI-compatible chat/completions client (OpenAI, DeepSeek, Ollama `/v1`).
//! One HTTP attempt per `translate` call; retries belong to the dispatcher, so
//! every failure is mapped onto a classified `TranslateError`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{TranslateError, TranslateRequest, Translator};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI-compatible non-streaming client with a pooled connection.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TranslateError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .build()
            .map_err(|e| TranslateError::Connection(e.to_string()))?;

        Ok(Self {
            http,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Reads `SUBLINE_BASE_URL` (default OpenAI) and `SUBLINE_API_KEY`.
    /// A missing key is allowed for local servers that do not check it.
    pub fn from_env() -> Result<Self, TranslateError> {
        let base_url =
            std::env::var("SUBLINE_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let api_key = std::env::var("SUBLINE_API_KEY").ok();
        Self::new(base_url, api_key, Duration::from_secs(30))
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

#[async_trait]
impl Translator for OpenAiCompatClient {
    async fn translate(&self, request: &TranslateRequest) -> Result<String, TranslateError> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": build_system_prompt(request)},
                {"role": "user", "content": build_user_prompt(request)}
            ],
            "stream": false,
            "temperature": 0.1
        });

        let mut builder = self
            .http
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<f64>().ok())
                .map(|secs| (secs * 1000.0) as u64);
            let body_text = response.text().await.unwrap_or_default();
            let err = classify_status(status, retry_after, &body_text);
            warn!(status, kind = %err.kind(), "backend call failed");
            return Err(err);
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| TranslateError::Connection(format!("malformed response: {e}")))?;
        extract_text(parsed)
    }

    fn name(&self) -> &str {
        "openai-compat"
    }
}

fn map_transport_error(e: reqwest::Error) -> TranslateError {
    if e.is_timeout() {
        TranslateError::Timeout
    } else {
        TranslateError::Connection(e.to_string())
    }
}

/// Map a non-success HTTP status to a classified error.
pub(crate) fn classify_status(status: u16, retry_after_ms: Option<u64>, body: &str) -> TranslateError {
    let message: String = body.chars().take(200).collect();
    match status {
        429 => TranslateError::RateLimited { retry_after_ms },
        408 => TranslateError::Timeout,
        401 | 403 => TranslateError::Unauthorized(message),
        400 if body.contains("content_filter") || body.contains("content_policy") => {
            TranslateError::ContentFiltered(message)
        }
        400 | 404 | 422 => TranslateError::InvalidRequest(message),
        500..=599 => TranslateError::Server { status, message },
        _ => TranslateError::InvalidRequest(format!("unexpected status {status}: {message}")),
    }
}

fn extract_text(response: ChatResponse) -> Result<String, TranslateError> {
    let Some(choice) = response.choices.into_iter().next() else {
        return Err(TranslateError::EmptyResponse);
    };
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(TranslateError::ContentFiltered("finish_reason=content_filter".into()));
    }
    let text = choice.message.content.unwrap_or_default();
    let text = text.trim();
    if text.is_empty() {
        return Err(TranslateError::EmptyResponse);
    }
    debug!(chars = text.chars().count(), "backend call ok");
    Ok(text.to_string())
}

// --- Prompt construction ---

fn build_system_prompt(request: &TranslateRequest) -> String {
    let mut prompt = format!(
        "You are a professional {} subtitle translator. Translate from {} to {}. \
         Output only the translation of the current line, never the context.",
        request.content_type.as_str(),
        request.source_lang,
        request.target_lang,
    );
    let style = match request.style {
        super::TranslationStyle::Standard => None,
        super::TranslationStyle::Literal => {
            Some("Translate literally; prefer source accuracy over fluency.")
        }
        super::TranslationStyle::Localized => {
            Some("Localize idioms and references for the target audience.")
        }
        super::TranslationStyle::Specialized => {
            Some("Keep domain terminology precise and consistent.")
        }
    };
    if let Some(style) = style {
        prompt.push(' ');
        prompt.push_str(style);
    }
    prompt
}

fn build_user_prompt(request: &TranslateRequest) -> String {
    if request.context.is_empty() {
        return request.text.clone();
    }
    let mut prompt = String::from("Context:\n");
    for line in &request.context {
        prompt.push_str("- ");
        prompt.push_str(line);
        prompt.push('\n');
    }
    prompt.push_str("\nTranslate only this line:\n");
    prompt.push_str(&request.text);
    prompt
}

// --- Response types ---

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::{ContentType, FailureKind, TranslationStyle};

    fn request(context: Vec<String>) -> TranslateRequest {
        TranslateRequest {
            text: "Hello".into(),
            source_lang: "en".into(),
            target_lang: "zh-TW".into(),
            context,
            content_type: ContentType::Anime,
            style: TranslationStyle::Literal,
            model: "gpt-4o-mini".into(),
        }
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(429, Some(2000), "").retry_after(), Some(Duration::from_secs(2)));
        for transient in [429, 408, 500, 502, 503] {
            assert_eq!(classify_status(transient, None, "").kind(), FailureKind::Transient);
        }
        for fatal in [400, 401, 403, 404, 422] {
            assert_eq!(classify_status(fatal, None, "").kind(), FailureKind::Fatal);
        }
        assert!(matches!(
            classify_status(400, None, r#"{"error":{"code":"content_filter"}}"#),
            TranslateError::ContentFiltered(_)
        ));
    }

    #[test]
    fn response_extraction() {
        let ok: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":" 你好 "},"finish_reason":"stop"}]}"#)
                .unwrap();
        assert_eq!(extract_text(ok).unwrap(), "你好");

        let empty: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert_eq!(extract_text(empty), Err(TranslateError::EmptyResponse));

        let filtered: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":null},"finish_reason":"content_filter"}]}"#,
        )
        .unwrap();
        assert!(matches!(extract_text(filtered), Err(TranslateError::ContentFiltered(_))));
    }

    #[test]
    fn prompts_carry_context_and_style() {
        let req = request(vec!["Before".into(), "After".into()]);
        let system = build_system_prompt(&req);
        assert!(system.contains("anime"));
        assert!(system.contains("zh-TW"));
        assert!(system.contains("literally"));

        let user = build_user_prompt(&req);
        assert!(user.contains("- Before\n- After"));
        assert!(user.ends_with("Hello"));
        assert_eq!(build_user_prompt(&request(vec![])), "Hello");
    }

    #[test]
    fn base_url_is_normalized() {
        let client =
            OpenAiCompatClient::new("http://localhost:11434/", Some(" ".into()), Duration::from_secs(5))
                .unwrap();
        assert_eq!(client.endpoint(), "http://localhost:11434/v1/chat/completions");
        assert!(client.api_key.is_none());
        assert_eq!(client.name(), "openai-compat");
    }
}
