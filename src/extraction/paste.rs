use super::synthesis::{ExtractionError, excerpt};
use crate::{
    llm::{AiService, Effort, UsageLedger, parse_json_lenient},
    sandbox::{DataFormat, ExtractionOutcome, normalize},
};
use tracing::{info, warn};

/// Pasted text up to this many characters is read by the model directly
/// instead of through a generated program.
pub const DIRECT_PASTE_LIMIT: usize = 30_000;

const PROMPT_IMAGE_LIMIT: usize = 50;

pub fn fits_direct(format: DataFormat, payload: &str) -> bool {
    format == DataFormat::Text && payload.chars().count() <= DIRECT_PASTE_LIMIT
}

/// One reasoning call over the whole paste. Items come back normalized the
/// same way program output is, with `pasted_text` as their source.
pub async fn extract_from_paste(
    ai: &dyn AiService,
    text: &str,
    images: &[String],
    context: Option<&str>,
    ledger: &UsageLedger,
) -> Result<ExtractionOutcome, ExtractionError> {
    let generation = ai
        .generate_text(&paste_prompt(text, images, context), Effort::High)
        .await?;
    ledger.record(generation.usage);

    let Some(value) = parse_json_lenient(&generation.value) else {
        warn!(target = "listing.extract", chars = text.len(), "paste_reply_unparseable");
        return Err(ExtractionError::Unreadable(excerpt(&generation.value)));
    };
    let mut outcome = normalize(value, DataFormat::Text);
    for item in &mut outcome.items {
        if item.source.starts_with("text_row_") {
            item.source = "pasted_text".into();
        }
    }
    info!(
        target = "listing.extract",
        items = outcome.items.len(),
        fields = outcome.fields_discovered.len(),
        "paste_extracted"
    );
    Ok(outcome)
}

fn paste_prompt(text: &str, images: &[String], context: Option<&str>) -> String {
    let mut image_list: String = images
        .iter()
        .take(PROMPT_IMAGE_LIMIT)
        .map(|name| format!("  - {name}\n"))
        .collect();
    if images.len() > PROMPT_IMAGE_LIMIT {
        image_list.push_str(&format!(
            "  ... and {} more\n",
            images.len() - PROMPT_IMAGE_LIMIT
        ));
    }
    let notes = context
        .filter(|notes| !notes.trim().is_empty())
        .map(|notes| format!("## Seller Notes\n{notes}\n\n"))
        .unwrap_or_default();

    format!(
        r#"You are extracting structured product data from text a seller pasted.

## Pasted Text
{text}

{notes}## Image Files ({total} total)
{image_list}
## Instructions
Extract EVERY product mentioned in the text with all of its attributes
(name, price, category, color, material, size, condition, description...).
If images are listed, match them to products using patterns in the file
names such as SKUs, names or numbering.

Return a JSON object with exactly this structure:
{{
  "fields_discovered": ["field1", "field2"],
  "products": [
    {{"id": "product_001", "source": "pasted_text", "image_files": [], "field1": "..."}}
  ],
  "image_matching_strategy": "how images were matched"
}}

Every product needs a unique id (product_001, product_002, ...). Do not skip
products. Parse tables, CSV or JSON fragments if the text contains them."#,
        total = images.len(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{Scripted, ScriptedAi};
    use serde_json::json;

    #[test]
    fn only_short_plain_text_is_read_directly() {
        assert!(fits_direct(DataFormat::Text, "blue mug, $12"));
        assert!(!fits_direct(DataFormat::Csv, "a,b\n1,2"));
        assert!(!fits_direct(DataFormat::Text, &"x".repeat(DIRECT_PASTE_LIMIT + 1)));
    }

    #[tokio::test]
    async fn pasted_products_become_items() {
        let ai = ScriptedAi::new(vec![Scripted::Json(json!({
            "fields_discovered": ["title", "price"],
            "products": [
                {"id": "product_001", "source": "pasted_text", "title": "Blue mug", "price": 12, "image_files": ["mug.jpg"]},
                {"id": "product_001", "title": "Brass lamp", "price": 80}
            ],
            "image_matching_strategy": "file names contain the product name"
        }))]);
        let ledger = UsageLedger::new();
        let images = vec!["mug.jpg".to_string(), "other.jpg".to_string()];

        let outcome = extract_from_paste(
            &ai,
            "Blue mug $12\nBrass lamp $80",
            &images,
            Some("vintage shop"),
            &ledger,
        )
        .await
        .expect("paste");

        assert_eq!(outcome.items.len(), 2);
        assert_eq!(outcome.items[0].image_files, vec!["mug.jpg".to_string()]);
        assert_ne!(outcome.items[0].id, outcome.items[1].id);
        assert!(outcome.items.iter().all(|item| item.source == "pasted_text"));
        assert_eq!(outcome.fields_discovered, vec!["title", "price"]);
        assert_eq!(ledger.summary().calls, 1);

        let prompts = ai.prompts.lock().expect("prompts");
        assert!(prompts[0].contains("Brass lamp $80"));
        assert!(prompts[0].contains("  - other.jpg"));
        assert!(prompts[0].contains("vintage shop"));
    }

    #[tokio::test]
    async fn a_reply_that_is_not_json_is_an_error() {
        let ai = ScriptedAi::new(vec![Scripted::Text("I found two mugs.".into())]);
        let err = extract_from_paste(&ai, "two mugs", &[], None, &UsageLedger::new())
            .await
            .expect_err("unreadable");
        assert!(matches!(err, ExtractionError::Unreadable(ref text) if text == "I found two mugs."));
    }
}
