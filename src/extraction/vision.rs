use crate::{
    llm::{AiError, AiService, Effort, ImagePart, UsageLedger, parse_json_lenient},
    models::{CatalogItem, display_value, is_empty_value},
    storage::JobDir,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

pub const VISION_BATCH_SIZE: usize = 5;

/// Describes each photo with the image model and turns every image into one
/// item. Batches that fail or do not parse are skipped; their images still
/// become bare items. Only quota exhaustion aborts.
pub async fn extract_from_images(
    ai: &dyn AiService,
    job: &JobDir,
    images: &[String],
    context: Option<&str>,
    ledger: &UsageLedger,
) -> Result<Vec<CatalogItem>, AiError> {
    let mut described: HashMap<String, Map<String, Value>> = HashMap::new();

    for batch in images.chunks(VISION_BATCH_SIZE) {
        let mut parts = Vec::new();
        for name in batch {
            let Some(path) = job.find_image(name) else {
                warn!(target = "listing.extract", image = %name, "vision_image_missing");
                continue;
            };
            match ImagePart::load(&path).await {
                Ok(part) => parts.push((name.clone(), part)),
                Err(err) => {
                    warn!(target = "listing.extract", image = %name, error = %err, "vision_image_unreadable")
                }
            }
        }
        if parts.is_empty() {
            continue;
        }

        let names: Vec<String> = parts.iter().map(|(name, _)| name.clone()).collect();
        let loaded: Vec<ImagePart> = parts.into_iter().map(|(_, part)| part).collect();
        let reply = match ai
            .generate_with_images(&vision_prompt(&names, context), &loaded, Effort::Medium)
            .await
        {
            Ok(generation) => {
                ledger.record(generation.usage);
                generation.value
            }
            Err(err) if err.is_quota() => return Err(err),
            Err(err) => {
                warn!(target = "listing.extract", error = %err, batch = names.len(), "vision_batch_failed");
                continue;
            }
        };

        let Some(products) = parse_json_lenient(&reply).and_then(products_of)
        else {
            warn!(target = "listing.extract", batch = names.len(), "vision_batch_unparseable");
            continue;
        };
        for (position, product) in products.into_iter().enumerate() {
            let named = product
                .get("image_filename")
                .and_then(Value::as_str)
                .filter(|name| names.iter().any(|n| n.as_str() == *name))
                .map(str::to_string);
            let Some(filename) = named.or_else(|| names.get(position).cloned()) else {
                continue;
            };
            described.entry(filename).or_insert(product);
        }
    }

    Ok(images
        .iter()
        .enumerate()
        .map(|(index, filename)| {
            let mut item = CatalogItem::new(format!("item_{:03}", index + 1));
            item.image_files = vec![filename.clone()];
            item.source = "vision_extraction".into();
            if let Some(attributes) = described.remove(filename) {
                for (key, value) in attributes {
                    if key == "image_filename" || is_empty_value(&value) {
                        continue;
                    }
                    let value = match value {
                        Value::Array(_) => Value::String(display_value(&value)),
                        other => other,
                    };
                    item.fields.insert(key, value);
                }
            }
            item
        })
        .collect())
}

fn products_of(value: Value) -> Option<Vec<Map<String, Value>>> {
    let list = match value {
        Value::Array(list) => list,
        Value::Object(mut map) => match map.remove("products").or_else(|| map.remove("items")) {
            Some(Value::Array(list)) => list,
            _ => return None,
        },
        _ => return None,
    };
    Some(
        list.into_iter()
            .filter_map(|entry| match entry {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
    )
}

fn vision_prompt(names: &[String], context: Option<&str>) -> String {
    let files = names
        .iter()
        .enumerate()
        .map(|(i, name)| format!("  {}. {name}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You are reading product photos to extract attributes for marketplace listings.\n\n\
## Images\nThese {count} images are attached in order:\n{files}\n\n\
## Seller notes\n{notes}\n\n\
For each image list every attribute you can identify: category, description_hints, color, \
material, condition, style, notable_features (a list) and anything else visible.\n\
Return JSON: {{\"products\": [{{\"image_filename\": \"...\", \"category\": \"...\", ...}}]}}\n\
One product per image. Omit an attribute rather than guess.",
        count = names.len(),
        notes = context.unwrap_or("(none)"),
    )
}
