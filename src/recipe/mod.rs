pub mod draft;
pub mod judge;
pub mod refine;
pub mod rules;
pub mod sampling;
pub mod store;
pub mod template;
pub mod tester;
pub mod validation;

use crate::{
    llm::{AiError, parse_json_lenient},
    models::ValidationResult,
    storage::StoreError,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serde_with::skip_serializing_none;
use thiserror::Error;

pub use draft::draft;
pub use refine::{AutoRefineOutcome, AutoRefiner, build_auto_feedback, refine};
pub use store::{RecipeStore, RecipeSummary};
pub use tester::RecipeTester;
pub use validation::ValidationEngine;

pub static DEFAULT_OUTPUT_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "title": {"type": "string", "maxLength": 140},
            "description": {"type": "string"},
            "tags": {"type": "array", "items": {"type": "string"}, "maxItems": 13},
            "category_suggestion": {"type": "string"},
            "suggested_price": {"type": "number"},
            "pricing_rationale": {"type": "string"},
            "seo_keywords": {"type": "array", "items": {"type": "string"}},
            "confidence": {"type": "string", "enum": ["high", "medium", "low"]},
            "notes_for_seller": {"type": "string"},
            "social_caption": {"type": "string"},
            "hashtags": {"type": "array", "items": {"type": "string"}, "maxItems": 30},
            "item_specifics": {"type": "object", "additionalProperties": {"type": "string"}},
            "condition_description": {"type": "string"}
        },
        "required": ["title", "description", "tags", "suggested_price", "confidence"]
    })
});

pub const DEFAULT_VALIDATION_PROGRAM: &str = r#"def validate_listing(listing, style_profile):
    issues = []

    description = listing.get("description", "") or ""
    word_count = len(description.split())
    if word_count < 50:
        issues.append(f"Description too short ({word_count} words, minimum 50)")
    if word_count > 300:
        issues.append(f"Description too long ({word_count} words, maximum 300)")

    tags = listing.get("tags", []) or []
    if len(tags) < 5:
        issues.append(f"Only {len(tags)} tags, aim for at least 10")

    desc_lower = description.lower()
    for mention in style_profile.get("always_mention", []):
        if mention.lower() not in desc_lower:
            issues.append(f"Missing mandatory mention: '{mention}'")

    title = listing.get("title", "") or ""
    if len(title) > 140:
        issues.append("Title exceeds 140 character limit")
    if len(title) < 10:
        issues.append("Title is too short (less than 10 characters)")

    price = listing.get("suggested_price", 0)
    if not isinstance(price, (int, float)) or price <= 0:
        issues.append("Invalid price (must be > 0)")

    return {
        "passed": len(issues) == 0,
        "score": max(0, 100 - len(issues) * 15),
        "issues": issues,
    }
"#;

/// The versioned bundle applied uniformly to every item of a batch.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipe {
    pub version: u32,
    pub prompt_template: String,
    pub output_schema: Value,
    #[serde(alias = "validation_code")]
    pub validation_program: String,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub changes_made: Option<String>,
    #[serde(default)]
    pub test_results: Vec<SampleResult>,
}

impl Recipe {
    pub fn average_score(&self) -> Option<f64> {
        average_score(&self.test_results)
    }
}

/// One recipe test on one catalog item.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleResult {
    pub item_id: String,
    pub item_name: String,
    #[serde(default)]
    pub listing: Option<Value>,
    pub validation: ValidationResult,
    #[serde(default)]
    pub image_filename: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

pub fn average_score(results: &[SampleResult]) -> Option<f64> {
    if results.is_empty() {
        return None;
    }
    let total: u32 = results.iter().map(|result| result.validation.score).sum();
    Some(((total as f64 / results.len() as f64) * 10.0).round() / 10.0)
}

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("recipe v{0} is approved and locked")]
    Locked(u32),
    #[error("recipe v{0} does not exist")]
    MissingVersion(u32),
    #[error("no catalog items to test against")]
    NoItems,
    #[error("unknown sample ids: {}", .0.join(", "))]
    UnknownSamples(Vec<String>),
}

/// Whatever subset of the three artifacts a model reply carried.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Artifacts {
    pub prompt_template: Option<String>,
    pub output_schema: Option<Value>,
    pub validation_program: Option<String>,
    pub changes_made: Option<String>,
}

impl Artifacts {
    pub fn parse(reply: &str) -> Self {
        let Some(Value::Object(map)) = parse_json_lenient(reply) else {
            return Self::default();
        };
        let text = |key: &str| {
            map.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_string)
        };
        Self {
            prompt_template: text("prompt_template"),
            output_schema: map
                .get("output_schema")
                .filter(|schema| schema.as_object().is_some_and(|obj| !obj.is_empty()))
                .cloned(),
            validation_program: text("validation_code").or_else(|| text("validation_program")),
            changes_made: text("changes_made"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_template.is_none()
            && self.output_schema.is_none()
            && self.validation_program.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifacts_parse_fenced_reply() {
        let reply = "```json\n{\"prompt_template\": \"Write {title}\", \"output_schema\": {}, \"validation_code\": \"def validate_listing(l, s):\\n    return {}\"}\n```";
        let artifacts = Artifacts::parse(reply);
        assert_eq!(artifacts.prompt_template.as_deref(), Some("Write {title}"));
        assert!(artifacts.output_schema.is_none());
        assert!(
            artifacts
                .validation_program
                .as_deref()
                .is_some_and(|code| code.starts_with("def validate_listing"))
        );
        assert!(Artifacts::parse("sorry, no json").is_empty());
    }

    #[test]
    fn recipe_reads_legacy_validation_key() {
        let recipe: Recipe = serde_json::from_value(json!({
            "version": 2,
            "prompt_template": "t",
            "output_schema": {"type": "object"},
            "validation_code": "def validate_listing(l, s): pass",
            "created_at": "2025-01-01T00:00:00Z"
        }))
        .expect("recipe");
        assert_eq!(recipe.validation_program, "def validate_listing(l, s): pass");
        assert!(!recipe.approved);
        assert!(recipe.test_results.is_empty());
    }

    #[test]
    fn average_rounds_to_one_decimal() {
        let result = |score| SampleResult {
            item_id: "a".into(),
            item_name: "a".into(),
            listing: None,
            validation: ValidationResult {
                passed: false,
                score,
                issues: Vec::new(),
                code_issues: None,
                judge_criteria: None,
            },
            image_filename: None,
            error: None,
        };
        assert_eq!(average_score(&[]), None);
        assert_eq!(average_score(&[result(100), result(85), result(88)]), Some(91.0));
        assert_eq!(average_score(&[result(100), result(85)]), Some(92.5));
    }
}
