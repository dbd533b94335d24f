use super::{
    AiError, AiService, CodeRun, Effort, Generation, ImagePart, Usage, extract_python_code,
    parse_json_lenient,
};
use crate::{config::GeminiSettings, http::build_client};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Instant;
use tracing::{debug, info};

// Lower-cased substrings that mark a 429 as a spent allowance rather than a
// momentary rate limit.
const QUOTA_KEYWORDS: [&str; 4] = ["quota", "limit exceeded", "daily limit", "rate limit exceeded"];

pub struct GeminiClient {
    http: Client,
    settings: GeminiSettings,
}

impl GeminiClient {
    pub fn new(settings: GeminiSettings) -> Self {
        Self {
            http: build_client(),
            settings,
        }
    }

    fn model_for(&self, effort: Effort) -> &str {
        match effort {
            Effort::High => &self.settings.reasoning_model,
            _ => &self.settings.batch_model,
        }
    }

    async fn generate(
        &self,
        operation: &'static str,
        effort: Effort,
        parts: Vec<Value>,
        tools: Option<Value>,
        schema: Option<&Value>,
    ) -> Result<(Vec<ResponsePart>, Usage), AiError> {
        let key = self
            .settings
            .api_key
            .as_deref()
            .ok_or(AiError::MissingCredentials)?;
        let model = self.model_for(effort).to_string();

        let mut generation_config = Map::new();
        generation_config.insert(
            "thinkingConfig".into(),
            json!({ "thinkingLevel": effort.as_str() }),
        );
        if let Some(schema) = schema {
            generation_config.insert("responseMimeType".into(), json!("application/json"));
            generation_config.insert("responseSchema".into(), strip_additional_properties(schema));
        }

        let mut body = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": Value::Object(generation_config),
        });
        if let Some(tools) = tools {
            body["tools"] = tools;
        }

        let url = format!(
            "{}/models/{}:generateContent",
            self.settings.base_url.trim_end_matches('/'),
            model
        );
        let started = Instant::now();
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await
            .map_err(|err| AiError::Transient(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }

        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|err| AiError::InvalidResponse(err.to_string()))?;

        let usage = payload
            .usage_metadata
            .map(|meta| Usage {
                input_tokens: meta.prompt_token_count,
                output_tokens: meta.candidates_token_count,
                calls: 1,
            })
            .unwrap_or(Usage {
                calls: 1,
                ..Usage::default()
            });
        info!(
            target = "listing.llm",
            operation,
            model = %model,
            effort = effort.as_str(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost_usd = usage.cost(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation_complete"
        );

        let parts = payload
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| content.parts)
            .unwrap_or_default();
        Ok((parts, usage))
    }
}

fn text_part(text: &str) -> Value {
    json!({ "text": text })
}

fn inline_part(mime_type: &str, data: &[u8]) -> Value {
    json!({ "inlineData": { "mimeType": mime_type, "data": STANDARD.encode(data) } })
}

/// Each image follows a short label with its file name, so replies can
/// refer to images by name.
fn image_parts(prompt: &str, images: &[ImagePart]) -> Vec<Value> {
    let mut parts = vec![text_part(prompt)];
    for image in images {
        parts.push(text_part(&format!("Image: {}", image.filename)));
        parts.push(inline_part(&image.mime_type, &image.data));
    }
    parts
}

/// Visible text of a reply; thought summaries are skipped.
fn joined_text(parts: &[ResponsePart]) -> String {
    parts
        .iter()
        .filter(|part| !part.thought)
        .filter_map(|part| part.text.as_deref())
        .collect::<Vec<_>>()
        .join("")
}

/// Maps a failed HTTP exchange onto the service error taxonomy.
pub fn classify_status(status: u16, body: &str) -> AiError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string());
    let lowered = message.to_lowercase();
    match status {
        429 if QUOTA_KEYWORDS.iter().any(|kw| lowered.contains(kw)) => {
            AiError::QuotaExhausted(message)
        }
        429 | 500..=599 => AiError::Transient(format!("HTTP {status}: {message}")),
        _ => AiError::Rejected { status, message },
    }
}

/// The structured-output endpoint does not accept `additionalProperties`.
pub fn strip_additional_properties(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| key.as_str() != "additionalProperties")
                .map(|(key, value)| (key.clone(), strip_additional_properties(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_additional_properties).collect()),
        other => other.clone(),
    }
}

#[async_trait]
impl AiService for GeminiClient {
    async fn generate_text(
        &self,
        prompt: &str,
        effort: Effort,
    ) -> Result<Generation<String>, AiError> {
        let (parts, usage) = self
            .generate("generate_text", effort, vec![text_part(prompt)], None, None)
            .await?;
        Ok(Generation::new(joined_text(&parts), usage))
    }

    async fn generate_with_code(
        &self,
        prompt: &str,
        attachment: Option<&str>,
        effort: Effort,
    ) -> Result<Generation<CodeRun>, AiError> {
        let mut parts = vec![text_part(prompt)];
        if let Some(attachment) = attachment {
            parts.push(inline_part("text/plain", attachment.as_bytes()));
        }
        let (parts, usage) = self
            .generate(
                "generate_with_code",
                effort,
                parts,
                Some(json!([{ "codeExecution": {} }])),
                None,
            )
            .await?;

        let text = joined_text(&parts);
        let program = parts
            .iter()
            .rev()
            .find_map(|part| part.executable_code.as_ref())
            .map(|code| code.code.trim().to_string())
            .filter(|code| !code.is_empty())
            .or_else(|| extract_python_code(&text));
        debug!(
            target = "listing.llm",
            has_program = program.is_some(),
            "code_execution_reply"
        );
        Ok(Generation::new(CodeRun { text, program }, usage))
    }

    async fn generate_with_images(
        &self,
        prompt: &str,
        images: &[ImagePart],
        effort: Effort,
    ) -> Result<Generation<String>, AiError> {
        let (parts, usage) = self
            .generate(
                "generate_with_images",
                effort,
                image_parts(prompt, images),
                None,
                None,
            )
            .await?;
        Ok(Generation::new(joined_text(&parts), usage))
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        images: &[ImagePart],
        schema: &Value,
        effort: Effort,
    ) -> Result<Generation<Value>, AiError> {
        let (parts, usage) = self
            .generate(
                "generate_structured",
                effort,
                image_parts(prompt, images),
                None,
                Some(schema),
            )
            .await?;
        let text = joined_text(&parts);
        let value = parse_json_lenient(&text)
            .ok_or_else(|| AiError::InvalidResponse("structured reply was not JSON".into()))?;
        Ok(Generation::new(value, usage))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    #[serde(default)]
    executable_code: Option<ExecutableCode>,
}

#[derive(Debug, Deserialize)]
struct ExecutableCode {
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_quota_429_is_terminal() {
        let body = r#"{"error":{"code":429,"message":"Quota exceeded for metric: generate_content_free_tier_requests, limit: 250","status":"RESOURCE_EXHAUSTED"}}"#;
        assert!(classify_status(429, body).is_quota());
    }

    #[test]
    fn images_are_labelled_by_file_name() {
        let images = vec![ImagePart {
            filename: "mug.png".into(),
            mime_type: "image/png".into(),
            data: vec![1, 2, 3],
        }];
        let parts = image_parts("describe", &images);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1]["text"], "Image: mug.png");
        assert_eq!(parts[2]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[2]["inlineData"]["data"], STANDARD.encode([1u8, 2, 3]));
    }

    #[test]
    fn plain_429_and_5xx_are_transient() {
        assert!(classify_status(429, "Too many requests, slow down").is_transient());
        assert!(classify_status(503, "overloaded").is_transient());
        assert!(matches!(
            classify_status(400, r#"{"error":{"message":"bad schema"}}"#),
            AiError::Rejected { status: 400, .. }
        ));
    }

    #[test]
    fn strips_nested_additional_properties() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "item_specifics": { "type": "object", "additionalProperties": true },
                "tags": { "type": "array", "items": [{ "additionalProperties": false }] }
            }
        });
        let cleaned = strip_additional_properties(&schema);
        assert!(cleaned.get("additionalProperties").is_none());
        assert!(cleaned["properties"]["item_specifics"].get("additionalProperties").is_none());
        assert!(cleaned["properties"]["tags"]["items"][0].get("additionalProperties").is_none());
    }

    #[test]
    fn reply_parts_prefer_executable_code() {
        let payload: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{ "content": { "parts": [
                { "text": "thinking", "thought": true },
                { "executableCode": { "language": "PYTHON", "code": "result_json = '[]'" } },
                { "text": "Done." }
            ]}}],
            "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 4 }
        }))
        .expect("payload");
        let parts = &payload.candidates[0].content.as_ref().expect("content").parts;
        assert_eq!(joined_text(parts), "Done.");
        assert!(parts.iter().any(|part| part.executable_code.is_some()));
    }
}
