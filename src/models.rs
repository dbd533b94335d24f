use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;

use crate::llm::UsageSummary;

/// One seller product. Fields are discovered per job, so everything besides
/// the identity and provenance keys lives in an ordered map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogItem {
    pub id: String,
    #[serde(default)]
    pub image_files: Vec<String>,
    #[serde(default)]
    pub source: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CatalogItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image_files: Vec::new(),
            source: String::new(),
            fields: Map::new(),
        }
    }

    #[cfg(test)]
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Number of non-empty data fields. Identity, provenance and image keys
    /// are not counted.
    pub fn populated_fields(&self) -> usize {
        self.fields
            .values()
            .filter(|value| !is_empty_value(value))
            .count()
    }

    pub fn field_str(&self, key: &str) -> Option<String> {
        self.fields
            .get(key)
            .filter(|value| !is_empty_value(value))
            .map(display_value)
    }

    /// The item as a single JSON object, the shape handed to prompts.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => {
            let trimmed = text.trim();
            trimmed.is_empty() || matches!(trimmed.to_lowercase().as_str(), "none" | "nan" | "null")
        }
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Human-readable rendering used in prompts and templates.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(display_value)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StyleProfile {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub seller_type: Option<String>,
    #[serde(default)]
    pub target_buyer: Option<String>,
    #[serde(default)]
    pub brand_voice: Option<String>,
    #[serde(default)]
    pub description_structure: Option<String>,
    #[serde(default)]
    pub avg_description_length: Option<String>,
    #[serde(default)]
    pub pricing_strategy: Option<String>,
    #[serde(default)]
    pub tags_style: Option<String>,
    #[serde(default)]
    pub title_format: Option<String>,
    #[serde(default)]
    pub always_mention: Vec<String>,
    #[serde(default)]
    pub example_listings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CriterionVerdict {
    pub criterion: String,
    pub label: String,
    #[serde(rename = "pass")]
    pub passed: bool,
    pub reasoning: String,
    #[serde(default)]
    pub error: bool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub passed: bool,
    pub score: u32,
    pub issues: Vec<String>,
    #[serde(default)]
    pub code_issues: Option<Vec<String>>,
    #[serde(default)]
    pub judge_criteria: Option<Vec<CriterionVerdict>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Generation,
    Validation,
    QuotaExhausted,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Generation => "generation",
            FailureKind::Validation => "validation",
            FailureKind::QuotaExhausted => "quota_exhausted",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Short-circuited items never reached the model and are picked up again
    /// by a pending rerun.
    pub fn short_circuited(&self) -> bool {
        matches!(self, FailureKind::QuotaExhausted | FailureKind::Cancelled)
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemResult {
    pub item_id: String,
    #[serde(default)]
    pub listing: Option<Value>,
    #[serde(default)]
    pub validation: Option<ValidationResult>,
    #[serde(default)]
    pub image_filename: Option<String>,
    pub retried: bool,
    pub failed: bool,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ItemResult {
    pub fn failed(item_id: &str, failure: FailureKind, error: impl Into<String>) -> Self {
        Self {
            item_id: item_id.to_string(),
            listing: None,
            validation: None,
            image_filename: None,
            retried: false,
            failed: true,
            failure: Some(failure),
            error: Some(error.into()),
        }
    }

    pub fn score(&self) -> Option<u32> {
        self.validation.as_ref().map(|validation| validation.score)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    pub job_id: String,
    pub recipe_version: u32,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retried: usize,
    pub avg_score: f64,
    pub elapsed_seconds: f64,
    pub completed_at: DateTime<Utc>,
    pub quota_exhausted: bool,
    pub cancelled: bool,
    pub usage: UsageSummary,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Passed,
    Failed,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    BatchStart {
        job_id: String,
        total: usize,
    },
    Progress {
        item_id: String,
        completed: usize,
        total: usize,
        score: Option<u32>,
        title: Option<String>,
        status: ItemStatus,
    },
    Retrying {
        item_id: String,
        issues: Vec<String>,
    },
    BatchComplete {
        report: BatchReport,
    },
    BatchError {
        error: String,
    },
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
