use crate::models::{CatalogItem, StyleProfile, display_value, is_empty_value};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex"));

pub fn style_summary(style: &StyleProfile) -> String {
    let parts: Vec<String> = [
        ("Voice", &style.brand_voice),
        ("Seller type", &style.seller_type),
        ("Target buyer", &style.target_buyer),
    ]
    .into_iter()
    .filter_map(|(label, value)| {
        value
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .map(|text| format!("{label}: {text}"))
    })
    .collect();
    if parts.is_empty() {
        "No style profile provided".to_string()
    } else {
        parts.join(". ")
    }
}

/// Every populated field as `- key: value` lines.
pub fn item_block(item: &CatalogItem) -> String {
    let lines: Vec<String> = item
        .fields
        .iter()
        .filter(|(_, value)| !is_empty_value(value))
        .map(|(key, value)| format!("- {key}: {}", display_value(value)))
        .collect();
    if lines.is_empty() {
        "- (no data beyond the photo)".to_string()
    } else {
        lines.join("\n")
    }
}

fn or_default(value: &Option<String>, default: &str) -> String {
    value
        .as_deref()
        .filter(|text| !text.trim().is_empty())
        .unwrap_or(default)
        .to_string()
}

/// Replaces `{placeholder}` tokens in one pass. Style keys win over item
/// fields of the same name; unknown tokens are left as written.
pub fn fill_template(template: &str, item: &CatalogItem, style: &StyleProfile) -> String {
    let always_mention = if style.always_mention.is_empty() {
        "None".to_string()
    } else {
        style
            .always_mention
            .iter()
            .map(|mention| format!("- {mention}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut values: HashMap<&str, String> = HashMap::from([
        ("style_profile_summary", style_summary(style)),
        ("title_format", or_default(&style.title_format, "N/A")),
        (
            "description_structure",
            or_default(&style.description_structure, "N/A"),
        ),
        ("pricing_strategy", or_default(&style.pricing_strategy, "N/A")),
        ("platform", or_default(&style.platform, "marketplace")),
        ("always_mention_list", always_mention),
        (
            "avg_description_length",
            or_default(&style.avg_description_length, "100-200 words"),
        ),
        (
            "tags_style",
            or_default(&style.tags_style, "mix of broad and specific"),
        ),
        ("item_data", item_block(item)),
    ]);

    values.entry("id").or_insert_with(|| item.id.clone());
    values.entry("product_id").or_insert_with(|| item.id.clone());
    values
        .entry("image_files")
        .or_insert_with(|| item.image_files.join(", "));
    for (key, value) in &item.fields {
        values.entry(key.as_str()).or_insert_with(|| {
            if is_empty_value(value) {
                "N/A".to_string()
            } else {
                display_value(value)
            }
        });
    }

    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match values.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub fn default_prompt_template(style: &StyleProfile) -> String {
    let platform = or_default(&style.platform, "marketplace");
    format!(
        "You are creating a product listing for a {platform} seller.\n\n\
## Seller Style\n{{style_profile_summary}}\n\n\
## This Product\n{{item_data}}\n\
- [Product photo is attached when available]\n\n\
## Your Task\n\
Analyze the product photo and available data. Create a listing with:\n\
- Title following format: {{title_format}}\n\
- Description following structure: {{description_structure}}, around {{avg_description_length}}\n\
- Tags: {{tags_style}}\n\
- Suggested retail price based on {{pricing_strategy}}\n\
- SEO keywords for {{platform}}\n\
- A short social caption, hashtags, item specifics and an honest condition description\n\n\
## Mandatory Mentions\n{{always_mention_list}}\n\n\
Respond in the exact JSON schema provided."
    )
}
