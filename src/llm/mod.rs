pub mod gemini;
pub mod retry;
pub mod usage;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

pub use gemini::GeminiClient;
pub use retry::Retrying;
pub use usage::{CostEstimate, Usage, UsageLedger, UsageSummary};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Minimal,
    #[default]
    Low,
    Medium,
    High,
}

impl Effort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effort::Minimal => "minimal",
            Effort::Low => "low",
            Effort::Medium => "medium",
            Effort::High => "high",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImagePart {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ImagePart {
    pub async fn load(path: &Path) -> std::io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            mime_type: mime_for(&filename).to_string(),
            filename,
            data,
        })
    }
}

pub fn mime_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        _ => "image/jpeg",
    }
}

/// A model response together with the tokens it cost.
#[derive(Debug, Clone)]
pub struct Generation<T> {
    pub value: T,
    pub usage: Usage,
}

impl<T> Generation<T> {
    pub fn new(value: T, usage: Usage) -> Self {
        Self { value, usage }
    }
}

/// Prose plus the last program the model wrote while using code execution.
#[derive(Debug, Clone, Default)]
pub struct CodeRun {
    pub text: String,
    pub program: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum AiError {
    #[error("transient service error: {0}")]
    Transient(String),
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("GEMINI_API_KEY is not set")]
    MissingCredentials,
}

impl AiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AiError::Transient(_))
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, AiError::QuotaExhausted(_))
    }
}

/// The generative capability the pipeline is built on.
#[async_trait]
pub trait AiService: Send + Sync {
    async fn generate_text(&self, prompt: &str, effort: Effort)
    -> Result<Generation<String>, AiError>;

    /// Generation with the model's code-execution tool enabled. `attachment`
    /// is sent alongside the prompt as a text file the model can load.
    async fn generate_with_code(
        &self,
        prompt: &str,
        attachment: Option<&str>,
        effort: Effort,
    ) -> Result<Generation<CodeRun>, AiError>;

    async fn generate_with_images(
        &self,
        prompt: &str,
        images: &[ImagePart],
        effort: Effort,
    ) -> Result<Generation<String>, AiError>;

    async fn generate_structured(
        &self,
        prompt: &str,
        images: &[ImagePart],
        schema: &Value,
        effort: Effort,
    ) -> Result<Generation<Value>, AiError>;
}

static PYTHON_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```python\s*\n(.*?)```").expect("python fence regex"));
static ANY_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[a-zA-Z]*\s*\n(.*?)```").expect("fence regex"));

/// Last fenced python block in a markdown response, falling back to any fence.
pub fn extract_python_code(text: &str) -> Option<String> {
    let last = |re: &Regex| {
        re.captures_iter(text)
            .last()
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
    };
    last(&PYTHON_BLOCK)
        .or_else(|| last(&ANY_BLOCK))
        .filter(|code| !code.is_empty())
}

/// Parses JSON out of a model reply that may be wrapped in a markdown fence or
/// surrounded by prose.
pub fn parse_json_lenient(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    if let Some(caps) = ANY_BLOCK.captures(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(caps[1].trim()) {
            return Some(value);
        }
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) else {
            continue;
        };
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return Some(value);
            }
        }
    }
    None
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_python_prefers_last_python_fence() {
        let text = "first\n```python\nx = 1\n```\nthen\n```python\nresult_json = '[]'\n```\n";
        assert_eq!(
            extract_python_code(text).as_deref(),
            Some("result_json = '[]'")
        );
        assert_eq!(
            extract_python_code("```\ny = 2\n```").as_deref(),
            Some("y = 2")
        );
        assert!(extract_python_code("no code here").is_none());
    }

    #[test]
    fn lenient_json_handles_fences_and_prose() {
        assert_eq!(
            parse_json_lenient("```json\n{\"a\": 1}\n```"),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            parse_json_lenient("Here you go: [1, 2] done"),
            Some(json!([1, 2]))
        );
        assert!(parse_json_lenient("nothing").is_none());
    }

    #[test]
    fn mime_type_follows_extension() {
        assert_eq!(mime_for("a.PNG"), "image/png");
        assert_eq!(mime_for("photo"), "image/jpeg");
    }
}
