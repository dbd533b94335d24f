use super::{Artifacts, DEFAULT_OUTPUT_SCHEMA, DEFAULT_VALIDATION_PROGRAM, Recipe, template};
use crate::{
    extraction::DataModel,
    extraction::data_model::FieldStats,
    llm::{AiError, AiService, Effort, UsageLedger},
    models::StyleProfile,
};
use chrono::Utc;
use tracing::{info, warn};

const SAMPLE_ITEMS: usize = 3;

/// Asks the reasoning model for a first recipe. Artifacts the reply does not
/// carry fall back to the built-in defaults.
pub async fn draft(
    ai: &dyn AiService,
    style: &StyleProfile,
    model: &DataModel,
    ledger: &UsageLedger,
) -> Result<Recipe, AiError> {
    let prompt = draft_prompt(style, model);
    let generation = ai.generate_text(&prompt, Effort::High).await?;
    ledger.record(generation.usage);

    let artifacts = Artifacts::parse(&generation.value);
    if artifacts.is_empty() {
        warn!(target = "listing.recipe", "draft_reply_unparseable");
    }
    let recipe = Recipe {
        version: 1,
        prompt_template: artifacts
            .prompt_template
            .unwrap_or_else(|| template::default_prompt_template(style)),
        output_schema: artifacts
            .output_schema
            .unwrap_or_else(|| DEFAULT_OUTPUT_SCHEMA.clone()),
        validation_program: artifacts
            .validation_program
            .unwrap_or_else(|| DEFAULT_VALIDATION_PROGRAM.to_string()),
        approved: false,
        approved_at: None,
        created_at: Utc::now(),
        changes_made: None,
        test_results: Vec::new(),
    };
    info!(target = "listing.recipe", fields = model.fields_discovered.len(), "recipe_drafted");
    Ok(recipe)
}

fn variable_docs(model: &DataModel) -> String {
    let mut docs = vec![
        "- {style_profile_summary} -- the seller style info".to_string(),
        "- {product_id} -- item identifier".to_string(),
        "- {item_data} -- every populated field as a bullet list".to_string(),
    ];
    for field in &model.fields_discovered {
        let detail = match model.field_stats.get(field) {
            Some(FieldStats::Numeric { min, max, .. }) => format!(" -- numeric, range {min}-{max}"),
            Some(FieldStats::Text {
                unique_count,
                sample,
                ..
            }) if !sample.is_empty() => {
                if *unique_count <= 8 {
                    format!(" -- values: {}", sample.join(", "))
                } else {
                    let head: Vec<&str> = sample.iter().take(3).map(String::as_str).collect();
                    format!(" -- {unique_count} unique values, e.g. {}", head.join(", "))
                }
            }
            _ => String::new(),
        };
        docs.push(format!("- {{{field}}}{detail}"));
    }
    docs.extend(
        [
            "- {title_format} -- from the style profile",
            "- {description_structure} -- from the style profile",
            "- {pricing_strategy} -- from the style profile",
            "- {platform} -- target platform",
            "- {always_mention_list} -- mandatory mentions",
            "- [Item photos are attached separately]",
        ]
        .map(str::to_string),
    );
    docs.join("\n")
}

fn stats_block(model: &DataModel) -> String {
    let lines: Vec<String> = model
        .fields_discovered
        .iter()
        .filter_map(|field| match model.field_stats.get(field)? {
            FieldStats::Numeric { min, max, .. } => {
                Some(format!("- {field}: numeric, min={min}, max={max}"))
            }
            FieldStats::Text { unique_count, .. } => {
                let pct = model
                    .quality_report
                    .field_completeness
                    .get(field)
                    .map(|info| info.pct.to_string())
                    .unwrap_or_else(|| "?".into());
                Some(format!("- {field}: text, {unique_count} unique values, {pct}% filled"))
            }
            FieldStats::Empty { .. } => None,
        })
        .collect();
    if lines.is_empty() {
        "No field statistics available.".to_string()
    } else {
        lines.join("\n")
    }
}

fn draft_prompt(style: &StyleProfile, model: &DataModel) -> String {
    let samples: Vec<_> = model
        .items
        .iter()
        .take(SAMPLE_ITEMS)
        .map(|item| item.to_value())
        .collect();
    format!(
        "You are building a product listing recipe for a marketplace seller.\n\n\
## Seller Style Profile\n{style}\n\n\
## Available Product Data Fields\n{fields}\n\n\
## Field Statistics\n{stats}\n\n\
## Sample Products (first {SAMPLE_ITEMS})\n{samples}\n\n\
## Your Task\nCreate a recipe with THREE artifacts.\n\n\
### 1. Prompt Template\n\
The exact prompt sent to an AI model for EACH product. Use {{curly_brace_variables}} for \
product-specific data. Available variables:\n{variables}\n\n\
Cover title format, description style, tag strategy, pricing approach and platform \
requirements, tailored to this seller's voice. Also instruct the model to produce a short \
social_caption with a call to action, 15-30 hashtags without the # symbol, item_specifics \
as key-value attributes, and an honest condition_description. Reference fields by name when \
they carry important attributes.\n\n\
### 2. Output Schema\nA JSON schema for the structured output. Start from this default and \
customize if needed:\n{schema}\n\n\
### 3. Validation Code\nA Python function `validate_listing(listing, style_profile)` returning \
{{\"passed\": bool, \"score\": int 0-100, \"issues\": [strings]}}. No imports are available. \
Use the field statistics to set realistic thresholds (for example, flag suggested_price far \
outside the observed price range).\n\n\
## Response Format\nRespond with exactly this JSON (no markdown fencing):\n\
{{\"prompt_template\": \"...\", \"output_schema\": {{}}, \
\"validation_code\": \"def validate_listing(listing, style_profile):\\n    ...\"}}",
        style = serde_json::to_string_pretty(style).unwrap_or_default(),
        fields = available_fields(model),
        stats = stats_block(model),
        samples = serde_json::to_string_pretty(&samples).unwrap_or_default(),
        variables = variable_docs(model),
        schema = serde_json::to_string_pretty(&*DEFAULT_OUTPUT_SCHEMA).unwrap_or_default(),
    )
}

fn available_fields(model: &DataModel) -> String {
    let mut fields: Vec<&str> = vec!["product_id", "product_image"];
    fields.extend(model.fields_discovered.iter().map(String::as_str));
    fields.sort_unstable();
    fields.dedup();
    fields.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{Scripted, ScriptedAi};
    use crate::models::CatalogItem;
    use serde_json::json;

    fn model() -> DataModel {
        let items = vec![
            CatalogItem::new("item_001")
                .with_field("title", "Oak stool")
                .with_field("price", 45),
            CatalogItem::new("item_002")
                .with_field("title", "Pine shelf")
                .with_field("price", 120),
        ];
        DataModel::assemble(items, &[], "none", Vec::new())
    }

    #[tokio::test]
    async fn draft_keeps_model_artifacts() {
        let ai = ScriptedAi::new(vec![Scripted::Text(
            json!({
                "prompt_template": "List {title} for {platform}",
                "output_schema": {"type": "object", "properties": {"title": {"type": "string"}}},
                "validation_code": "def validate_listing(listing, style_profile):\n    return {'issues': []}"
            })
            .to_string(),
        )]);
        let ledger = UsageLedger::new();
        let recipe = draft(&ai, &StyleProfile::default(), &model(), &ledger)
            .await
            .expect("draft");
        assert_eq!(recipe.version, 1);
        assert!(!recipe.approved);
        assert_eq!(recipe.prompt_template, "List {title} for {platform}");
        assert_eq!(recipe.output_schema["properties"]["title"]["type"], "string");
        assert_eq!(ledger.snapshot().calls, 1);

        let prompt = ai.prompts.lock().expect("prompts")[0].clone();
        assert!(prompt.contains("- price: numeric, min=45, max=120"));
        assert!(prompt.contains("- {title} -- values: Oak stool, Pine shelf"));
    }

    #[tokio::test]
    async fn unparseable_draft_uses_defaults() {
        let ai = ScriptedAi::new(vec![Scripted::Text("I'd rather chat about it".into())]);
        let recipe = draft(&ai, &StyleProfile::default(), &model(), &UsageLedger::new())
            .await
            .expect("draft");
        assert_eq!(recipe.output_schema, *DEFAULT_OUTPUT_SCHEMA);
        assert_eq!(recipe.validation_program, DEFAULT_VALIDATION_PROGRAM);
        assert!(recipe.prompt_template.contains("{item_data}"));
    }
}
