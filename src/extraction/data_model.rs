use crate::models::{CatalogItem, display_value, is_empty_value};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// The structured catalog a job works from once extraction is done.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataModel {
    pub fields_discovered: Vec<String>,
    pub items: Vec<CatalogItem>,
    pub unmatched_images: Vec<String>,
    pub matching_strategy: String,
    pub quality_report: QualityReport,
    pub field_stats: BTreeMap<String, FieldStats>,
    /// Issues left over from a best-effort extraction.
    #[serde(default)]
    pub extraction_warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Completeness {
    pub filled: usize,
    pub total: usize,
    pub pct: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QualityReport {
    pub total_items: usize,
    pub field_completeness: BTreeMap<String, Completeness>,
    pub items_with_images: usize,
    pub items_without_images: usize,
    pub images_unmatched: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldStats {
    Empty {
        filled: usize,
    },
    Numeric {
        filled: usize,
        min: f64,
        max: f64,
        sample: Vec<String>,
    },
    Text {
        filled: usize,
        unique_count: usize,
        sample: Vec<String>,
    },
}

fn filled(value: &Value) -> bool {
    !is_empty_value(value) && value.as_str().map(|s| s.trim() != "N/A").unwrap_or(true)
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl DataModel {
    /// Puts the fields an extraction program declared first, in its order.
    /// Declared names no item carries are ignored.
    pub fn with_declared_order(mut self, declared: &[String]) -> Self {
        let mut ordered: Vec<String> = Vec::with_capacity(self.fields_discovered.len());
        for name in declared {
            if self.fields_discovered.contains(name) && !ordered.contains(name) {
                ordered.push(name.clone());
            }
        }
        let rest: Vec<String> = self
            .fields_discovered
            .iter()
            .filter(|name| !ordered.contains(name))
            .cloned()
            .collect();
        ordered.extend(rest);
        self.fields_discovered = ordered;
        self
    }

    pub fn assemble(
        items: Vec<CatalogItem>,
        all_images: &[String],
        matching_strategy: impl Into<String>,
        extraction_warnings: Vec<String>,
    ) -> Self {
        let fields_discovered: Vec<String> = items
            .iter()
            .flat_map(|item| item.fields.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let matched: HashSet<&str> = items
            .iter()
            .flat_map(|item| item.image_files.iter().map(String::as_str))
            .collect();
        let unmatched_images: Vec<String> = all_images
            .iter()
            .filter(|name| !matched.contains(name.as_str()))
            .cloned()
            .collect();

        let quality_report = quality_report(&items, &fields_discovered, unmatched_images.len());
        let field_stats = field_stats(&items, &fields_discovered);
        Self {
            fields_discovered,
            items,
            unmatched_images,
            matching_strategy: matching_strategy.into(),
            quality_report,
            field_stats,
            extraction_warnings,
        }
    }

    /// Every image becomes one bare item.
    pub fn image_only(images: &[String]) -> Self {
        let items = images
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let mut item = CatalogItem::new(format!("item_{:03}", index + 1));
                item.image_files = vec![name.clone()];
                item.source = "image_only".into();
                item
            })
            .collect();
        Self::assemble(items, images, "Each image treated as a separate item", Vec::new())
    }

    pub fn item(&self, id: &str) -> Option<&CatalogItem> {
        self.items.iter().find(|item| item.id == id)
    }
}

fn quality_report(items: &[CatalogItem], fields: &[String], unmatched: usize) -> QualityReport {
    let total = items.len();
    if total == 0 {
        return QualityReport {
            warnings: vec!["No items extracted".into()],
            ..QualityReport::default()
        };
    }

    let field_completeness: BTreeMap<String, Completeness> = fields
        .iter()
        .map(|field| {
            let count = items
                .iter()
                .filter(|item| item.fields.get(field).is_some_and(filled))
                .count();
            let pct = ((100 * count) as f64 / total as f64).round() as u32;
            (
                field.clone(),
                Completeness {
                    filled: count,
                    total,
                    pct,
                },
            )
        })
        .collect();

    let with_images = items
        .iter()
        .filter(|item| !item.image_files.is_empty())
        .count();
    let without_images = total - with_images;

    let mut warnings: Vec<String> = field_completeness
        .iter()
        .filter(|(_, info)| info.pct < 50)
        .map(|(field, info)| {
            format!(
                "\"{field}\" is only {}% filled ({}/{total})",
                info.pct, info.filled
            )
        })
        .collect();
    if without_images > 0 {
        warnings.push(format!("{without_images} item(s) have no matched images"));
    }
    if unmatched > 0 {
        warnings.push(format!(
            "{unmatched} image(s) could not be matched to any item"
        ));
    }

    QualityReport {
        total_items: total,
        field_completeness,
        items_with_images: with_images,
        items_without_images: without_images,
        images_unmatched: unmatched,
        warnings,
    }
}

fn field_stats(items: &[CatalogItem], fields: &[String]) -> BTreeMap<String, FieldStats> {
    fields
        .iter()
        .map(|field| {
            let values: Vec<&Value> = items
                .iter()
                .filter_map(|item| item.fields.get(field))
                .filter(|value| filled(value))
                .collect();
            if values.is_empty() {
                return (field.clone(), FieldStats::Empty { filled: 0 });
            }
            let numbers: Vec<f64> = values.iter().filter_map(|value| numeric(value)).collect();
            let stats = if numbers.len() == values.len() {
                FieldStats::Numeric {
                    filled: values.len(),
                    min: round2(numbers.iter().copied().fold(f64::INFINITY, f64::min)),
                    max: round2(numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
                    sample: values.iter().take(3).map(|value| display_value(value)).collect(),
                }
            } else {
                let mut seen = HashSet::new();
                let unique: Vec<String> = values
                    .iter()
                    .map(|value| display_value(value))
                    .filter(|text| seen.insert(text.clone()))
                    .collect();
                FieldStats::Text {
                    filled: values.len(),
                    unique_count: unique.len(),
                    sample: unique.into_iter().take(5).collect(),
                }
            };
            (field.clone(), stats)
        })
        .collect()
}
