use crate::{
    llm::{AiService, Effort, UsageLedger},
    models::{CatalogItem, CriterionVerdict, StyleProfile, display_value, is_empty_value},
};
use futures::future::join_all;
use once_cell::sync::Lazy;
use serde_json::{Map, Value, json};
use tracing::warn;

pub struct Criterion {
    pub key: &'static str,
    pub question: &'static str,
    pub focus: &'static str,
}

pub const CRITERIA: [Criterion; 5] = [
    Criterion {
        key: "brand_voice_match",
        question: "Does the listing's tone, vocabulary, and style match the seller's brand voice?",
        focus: "Compare the listing's writing style against the style profile. Look at formality level, enthusiasm, use of jargon and sentence structure.",
    },
    Criterion {
        key: "description_completeness",
        question: "Does the description cover the key product attributes visible in the data?",
        focus: "Check that important product details (material, size, condition, features) from the data are mentioned. Missing key selling points is a fail.",
    },
    Criterion {
        key: "tag_relevance",
        question: "Are the tags relevant search terms that a real buyer would use on this platform?",
        focus: "Tags should be terms buyers actually search for. Generic filler tags ('nice', 'great') or irrelevant terms are a fail. Platform conventions matter.",
    },
    Criterion {
        key: "persuasiveness",
        question: "Would this listing compel the target buyer to click and consider purchasing?",
        focus: "Evaluate whether the listing creates desire. Does it highlight benefits, not just features? Is the title eye-catching in search results?",
    },
    Criterion {
        key: "image_text_consistency",
        question: "Does the listing stay faithful to the available product data without inventing specific false claims?",
        focus: "General elaboration and lifestyle language are fine. Only fail if the listing fabricates specific details (wrong brand, wrong material, invented measurements) that contradict or are not supported by the data. Sparse data is expected.",
    },
];

/// Rationale comes before the verdict; the ordering is part of the contract.
static VERDICT_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "reasoning": {"type": "string"},
            "pass": {"type": "boolean"}
        },
        "required": ["reasoning", "pass"],
        "propertyOrdering": ["reasoning", "pass"]
    })
});

/// Grades a listing on every criterion concurrently. A judge call that fails
/// for any reason counts as a pass flagged with `error`.
pub async fn judge_listing(
    ai: &dyn AiService,
    listing: &Value,
    style: &StyleProfile,
    item: &CatalogItem,
    ledger: &UsageLedger,
) -> Vec<CriterionVerdict> {
    let context = shared_context(listing, style, item);
    join_all(
        CRITERIA
            .iter()
            .map(|criterion| judge_one(ai, criterion, &context, ledger)),
    )
    .await
}

async fn judge_one(
    ai: &dyn AiService,
    criterion: &Criterion,
    context: &str,
    ledger: &UsageLedger,
) -> CriterionVerdict {
    let prompt = format!(
        "You are evaluating a product listing for quality.\n\n\
## Criterion: {question}\n{focus}\n\n{context}\n\n\
## Instructions\n\
1. First, analyze the listing against this specific criterion step by step.\n\
2. Then give your verdict.\n\n\
A longer listing is NOT automatically better. Judge quality and relevance, not length.\n\n\
Respond with exactly this JSON: {{\"reasoning\": \"your step-by-step analysis\", \"pass\": true_or_false}}",
        question = criterion.question,
        focus = criterion.focus,
    );

    match ai
        .generate_structured(&prompt, &[], &VERDICT_SCHEMA, Effort::Low)
        .await
    {
        Ok(generation) => {
            ledger.record(generation.usage);
            let value = generation.value;
            CriterionVerdict {
                criterion: criterion.key.to_string(),
                label: criterion.question.to_string(),
                passed: value.get("pass").and_then(Value::as_bool).unwrap_or(false),
                reasoning: value
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                error: false,
            }
        }
        Err(err) => {
            warn!(target = "listing.recipe", criterion = criterion.key, error = %err, "judge_call_failed");
            CriterionVerdict {
                criterion: criterion.key.to_string(),
                label: criterion.question.to_string(),
                passed: true,
                reasoning: format!("Judge error: {err}"),
                error: true,
            }
        }
    }
}

fn shared_context(listing: &Value, style: &StyleProfile, item: &CatalogItem) -> String {
    let text = |key: &str| listing.get(key).map(display_value).unwrap_or_default();
    let or_na = |value: &Option<String>| value.clone().unwrap_or_else(|| "N/A".into());
    let data: Map<String, Value> = item
        .fields
        .iter()
        .filter(|(_, value)| !is_empty_value(value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let mentions = if style.always_mention.is_empty() {
        "N/A".to_string()
    } else {
        style.always_mention.join(", ")
    };
    let price = listing
        .get("suggested_price")
        .map(display_value)
        .filter(|price| !price.is_empty())
        .unwrap_or_else(|| "N/A".into());

    format!(
        "## Style Profile\n- Platform: {platform}\n- Brand voice: {voice}\n- Target buyer: {buyer}\n\
- Seller type: {seller}\n- Always mention: {mentions}\n\n\
## Product Data\n{data}\n\n\
## Generated Listing\n- Title: {title}\n- Description: {description}\n- Tags: {tags}\n\
- Suggested price: {price}",
        platform = style.platform.clone().unwrap_or_else(|| "marketplace".into()),
        voice = or_na(&style.brand_voice),
        buyer = or_na(&style.target_buyer),
        seller = or_na(&style.seller_type),
        data = serde_json::to_string_pretty(&data).unwrap_or_default(),
        title = text("title"),
        description = text("description"),
        tags = text("tags"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::AiError;
    use crate::llm::testing::{Scripted, ScriptedAi};

    #[tokio::test]
    async fn one_failed_call_does_not_block_the_rest() {
        let ai = ScriptedAi::new(vec![
            Scripted::Json(json!({"reasoning": "voice is warm", "pass": true})),
            Scripted::Json(json!({"reasoning": "misses material", "pass": false})),
            Scripted::Fail(AiError::Transient("503".into())),
            Scripted::Json(json!({"reasoning": "compelling", "pass": true})),
            Scripted::Json(json!({"reasoning": "faithful"})),
        ]);
        let ledger = UsageLedger::new();
        let item = CatalogItem::new("a").with_field("material", "oak");
        let verdicts = judge_listing(
            &ai,
            &json!({"title": "Oak stool", "tags": ["stool", "oak"]}),
            &StyleProfile::default(),
            &item,
            &ledger,
        )
        .await;

        assert_eq!(verdicts.len(), CRITERIA.len());
        assert_eq!(ai.call_count(), 5);
        let failed: Vec<&str> = verdicts
            .iter()
            .filter(|verdict| !verdict.passed)
            .map(|verdict| verdict.criterion.as_str())
            .collect();
        // Replies are handed out in call order, which join_all starts in sequence.
        assert_eq!(failed.len(), 2);
        let errored: Vec<&CriterionVerdict> = verdicts.iter().filter(|v| v.error).collect();
        assert_eq!(errored.len(), 1);
        assert!(errored[0].passed);
        assert!(errored[0].reasoning.starts_with("Judge error"));
        assert_eq!(ledger.snapshot().calls, 4);
    }

    #[test]
    fn context_lists_only_populated_fields() {
        let item = CatalogItem::new("a")
            .with_field("material", "oak")
            .with_field("size", "");
        let context = shared_context(&json!({"title": "Stool"}), &StyleProfile::default(), &item);
        assert!(context.contains("\"material\": \"oak\""));
        assert!(!context.contains("size"));
        assert!(context.contains("- Suggested price: N/A"));
    }
}
