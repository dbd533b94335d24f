pub mod policy;
pub mod runtime;

use crate::{
    config::SandboxSettings,
    metrics,
    models::{CatalogItem, StyleProfile},
};
use policy::Profile;
use runtime::{PythonRuntime, ScriptReply, ScriptRequest, ScriptRuntime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::{collections::HashSet, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Everything the sandbox can report about a run. None of these escape as a
/// panic or an `Err`; the executor always returns its best-effort items.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxIssue {
    #[error("Script safety check failed: {0}")]
    Rejected(String),
    #[error("{0}")]
    Runtime(String),
    #[error("{0}")]
    Quality(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    Csv,
    Json,
    Text,
}

impl DataFormat {
    /// Name of the variable the payload is bound to inside the program.
    pub fn variable(&self) -> &'static str {
        match self {
            DataFormat::Csv => "csv_data",
            DataFormat::Json => "json_data",
            DataFormat::Text => "text_data",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataFormat::Csv => "csv",
            DataFormat::Json => "json",
            DataFormat::Text => "text",
        }
    }
}

pub struct ExtractionInput<'a> {
    pub format: DataFormat,
    pub data: &'a str,
    pub image_filenames: &'a [String],
    pub expected_rows: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    pub items: Vec<CatalogItem>,
    pub errors: Vec<SandboxIssue>,
    pub fields_discovered: Vec<String>,
    pub matching_strategy: Option<String>,
}

impl ExtractionOutcome {
    fn failed(issue: SandboxIssue) -> Self {
        Self {
            errors: vec![issue],
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

#[derive(Clone)]
pub struct Executor {
    runtime: Arc<dyn ScriptRuntime>,
}

impl Executor {
    pub fn new(runtime: Arc<dyn ScriptRuntime>) -> Self {
        Self { runtime }
    }

    pub fn python(settings: &SandboxSettings) -> Self {
        Self::new(Arc::new(PythonRuntime::new(
            settings.python.clone(),
            settings.timeout,
        )))
    }

    /// Runs an extraction program against the full payload and grades what
    /// it produced.
    pub async fn extract(&self, program: &str, input: &ExtractionInput<'_>) -> ExtractionOutcome {
        if let Err(violation) = policy::check(program, Profile::Extraction) {
            warn!(target = "listing.sandbox", %violation, "extraction_program_rejected");
            return ExtractionOutcome::failed(SandboxIssue::Rejected(violation.to_string()));
        }

        let mut inputs = Map::new();
        inputs.insert(input.format.variable().into(), json!(input.data));
        inputs.insert("image_filenames".into(), json!(input.image_filenames));
        let request = ScriptRequest::new(program, Profile::Extraction, inputs);

        let started = Instant::now();
        let reply = self.runtime.run(&request).await;
        metrics::sandbox_run(
            "extraction",
            matches!(reply, Ok(ScriptReply::Ok { .. })),
            started.elapsed().as_millis(),
        );

        let result = match reply {
            Ok(ScriptReply::Ok { result }) => result,
            Ok(ScriptReply::Missing) => {
                return ExtractionOutcome::failed(SandboxIssue::Runtime(
                    "Script did not assign a value to result_json".into(),
                ));
            }
            Ok(ScriptReply::Invalid { error }) => {
                return ExtractionOutcome::failed(SandboxIssue::Runtime(format!(
                    "result_json is not valid JSON: {error}"
                )));
            }
            Ok(ScriptReply::Error { error }) => {
                return ExtractionOutcome::failed(SandboxIssue::Runtime(format!(
                    "Script execution error: {error}"
                )));
            }
            Err(err) => {
                return ExtractionOutcome::failed(SandboxIssue::Runtime(format!(
                    "Script execution error: {err}"
                )));
            }
        };

        let mut outcome = normalize(result, input.format);
        outcome.errors.extend(assess(&outcome.items, input.expected_rows));
        info!(
            target = "listing.sandbox",
            items = outcome.items.len(),
            expected = input.expected_rows,
            errors = outcome.errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "extraction_run_complete"
        );
        outcome
    }

    /// Runs a rule-checking program's `validate_listing` and returns the issue
    /// strings it reported. Any failure to get a well-formed answer is an `Err`
    /// so the caller can fall back to built-in rules.
    pub async fn validate(
        &self,
        program: &str,
        listing: &Value,
        style: &StyleProfile,
    ) -> Result<Vec<String>, SandboxIssue> {
        if program.trim().is_empty() {
            return Err(SandboxIssue::Runtime("no validation program".into()));
        }
        policy::check(program, Profile::Validation)
            .map_err(|violation| SandboxIssue::Rejected(violation.to_string()))?;

        let mut inputs = Map::new();
        inputs.insert("listing".into(), listing.clone());
        inputs.insert(
            "style_profile".into(),
            serde_json::to_value(style).unwrap_or_else(|_| json!({})),
        );
        let request = ScriptRequest::new(program, Profile::Validation, inputs);

        let started = Instant::now();
        let reply = self.runtime.run(&request).await;
        metrics::sandbox_run(
            "validation",
            matches!(reply, Ok(ScriptReply::Ok { .. })),
            started.elapsed().as_millis(),
        );

        match reply {
            Ok(ScriptReply::Ok { result }) => issues_from(&result).ok_or_else(|| {
                SandboxIssue::Runtime("validate_listing returned an unexpected shape".into())
            }),
            Ok(ScriptReply::Missing) => Err(SandboxIssue::Runtime(
                "validation program does not define validate_listing".into(),
            )),
            Ok(ScriptReply::Invalid { error }) | Ok(ScriptReply::Error { error }) => {
                Err(SandboxIssue::Runtime(format!("Validation code error: {error}")))
            }
            Err(err) => Err(SandboxIssue::Runtime(err.to_string())),
        }
    }
}

fn issues_from(result: &Value) -> Option<Vec<String>> {
    let issues = result.as_object()?.get("issues")?.as_array()?;
    Some(
        issues
            .iter()
            .map(|issue| match issue {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect(),
    )
}

/// Turns whatever the program produced into catalog items. Accepts
/// `{"items"|"products": [...]}` or a bare list.
pub fn normalize(result: Value, format: DataFormat) -> ExtractionOutcome {
    let mut outcome = ExtractionOutcome::default();
    let entries = match result {
        Value::Array(entries) => entries,
        Value::Object(mut map) => {
            outcome.fields_discovered = map
                .remove("fields_discovered")
                .and_then(|fields| fields.as_array().cloned())
                .map(|fields| {
                    fields
                        .iter()
                        .filter_map(|field| field.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            outcome.matching_strategy = map
                .remove("image_matching_strategy")
                .and_then(|value| value.as_str().map(str::to_string));
            match map.remove("items").or_else(|| map.remove("products")) {
                Some(Value::Array(entries)) => entries,
                _ => Vec::new(),
            }
        }
        _ => Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut skipped = 0usize;
    let mut renamed = 0usize;
    for (index, entry) in entries.into_iter().enumerate() {
        let Value::Object(mut fields) = entry else {
            skipped += 1;
            continue;
        };
        let base_id = match fields.remove("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => format!("item_{:03}", index + 1),
        };
        let mut id = base_id.clone();
        let mut suffix = 2;
        while !seen.insert(id.clone()) {
            id = format!("{base_id}-{suffix}");
            suffix += 1;
        }
        if id != base_id {
            renamed += 1;
        }

        let image_files = match fields.remove("image_files") {
            Some(Value::String(name)) if !name.trim().is_empty() => vec![name],
            Some(Value::Array(names)) => names
                .into_iter()
                .filter_map(|name| name.as_str().map(str::to_string))
                .filter(|name| !name.trim().is_empty())
                .collect(),
            _ => Vec::new(),
        };
        let source = match fields.remove("source") {
            Some(Value::String(source)) if !source.is_empty() => source,
            _ => format!("{}_row_{}", format.as_str(), index + 1),
        };

        outcome.items.push(CatalogItem {
            id,
            image_files,
            source,
            fields,
        });
    }

    if skipped > 0 {
        outcome.errors.push(SandboxIssue::Quality(format!(
            "{skipped} entries were not objects and were dropped"
        )));
    }
    if renamed > 0 {
        outcome.errors.push(SandboxIssue::Quality(format!(
            "{renamed} duplicate ids were made unique"
        )));
    }
    outcome
}

/// Post-run heuristics. Advisory: items are kept either way.
pub fn assess(items: &[CatalogItem], expected_rows: usize) -> Vec<SandboxIssue> {
    let mut issues = Vec::new();
    if items.is_empty() {
        issues.push(SandboxIssue::Quality("Script produced 0 items".into()));
        return issues;
    }
    if (items.len() as f64) < expected_rows as f64 * 0.8 {
        issues.push(SandboxIssue::Quality(format!(
            "Row count mismatch: got {} items but data source has {} rows",
            items.len(),
            expected_rows
        )));
    }
    let sparse = items
        .iter()
        .filter(|item| item.populated_fields() + usize::from(!item.image_files.is_empty()) <= 1)
        .count();
    if sparse * 2 > items.len() {
        issues.push(SandboxIssue::Quality(format!(
            "{sparse}/{} items have almost no data",
            items.len()
        )));
    }
    issues
}


#[cfg(test)]
mod tests {
    use super::testing::StubRuntime;
    use super::*;

    fn input(expected_rows: usize) -> ExtractionInput<'static> {
        ExtractionInput {
            format: DataFormat::Csv,
            data: "sku,title\n1,a\n",
            image_filenames: &[],
            expected_rows,
        }
    }

    fn stub_executor(reply: ScriptReply) -> (Executor, Arc<StubRuntime>) {
        let stub = Arc::new(StubRuntime::new(move |_| reply.clone()));
        (Executor::new(stub.clone()), stub)
    }

    fn rows(n: usize) -> Value {
        Value::Array(
            (0..n)
                .map(|i| json!({"id": format!("p{i}"), "title": format!("Item {i}"), "price": 10 + i}))
                .collect(),
        )
    }

    #[tokio::test]
    async fn rejected_program_is_never_executed() {
        let (executor, stub) = stub_executor(ScriptReply::Missing);
        let outcome = executor
            .extract("import os\nresult_json = '[]'\n", &input(1))
            .await;
        assert_eq!(stub.run_count(), 0);
        assert_eq!(outcome.errors.len(), 1);
        assert!(matches!(outcome.errors[0], SandboxIssue::Rejected(_)));
        assert!(outcome.error_messages()[0].starts_with("Script safety check failed"));
    }

    #[tokio::test]
    async fn runtime_failures_are_reported_distinctly() {
        let cases = [
            (ScriptReply::Missing, "did not assign"),
            (
                ScriptReply::Invalid {
                    error: "Expecting value".into(),
                },
                "not valid JSON",
            ),
            (
                ScriptReply::Error {
                    error: "KeyError: 'sku'".into(),
                },
                "Script execution error: KeyError",
            ),
        ];
        for (reply, needle) in cases {
            let (executor, _) = stub_executor(reply);
            let outcome = executor.extract("result_json = x\n", &input(1)).await;
            assert!(outcome.items.is_empty());
            assert_eq!(outcome.errors.len(), 1);
            assert!(
                outcome.error_messages()[0].contains(needle),
                "{:?}",
                outcome.errors
            );
        }
    }

    #[tokio::test]
    async fn short_output_is_flagged_but_returned() {
        let (executor, _) = stub_executor(ScriptReply::Ok { result: rows(7) });
        let outcome = executor.extract("result_json = '[]'\n", &input(10)).await;
        assert_eq!(outcome.items.len(), 7);
        assert_eq!(
            outcome.error_messages(),
            vec!["Row count mismatch: got 7 items but data source has 10 rows".to_string()]
        );

        let (executor, _) = executor_ok(rows(8));
        let outcome = executor.extract("result_json = '[]'\n", &input(10)).await;
        assert!(outcome.is_clean());
    }

    fn executor_ok(result: Value) -> (Executor, Arc<StubRuntime>) {
        stub_executor(ScriptReply::Ok { result })
    }

    #[test]
    fn mostly_empty_items_are_flagged() {
        let items: Vec<CatalogItem> = (0..4)
            .map(|i| {
                let item = CatalogItem::new(format!("p{i}")).with_field("title", "x");
                if i == 0 {
                    item.with_field("price", 3)
                } else {
                    item.with_field("notes", "nan")
                }
            })
            .collect();
        let issues = assess(&items, 4);
        assert_eq!(
            issues,
            vec![SandboxIssue::Quality("3/4 items have almost no data".into())]
        );
        assert_eq!(
            assess(&[], 0),
            vec![SandboxIssue::Quality("Script produced 0 items".into())]
        );
    }

    #[test]
    fn normalize_fills_ids_and_dedupes() {
        let result = json!({
            "fields_discovered": ["title"],
            "image_matching_strategy": "sku prefix",
            "products": [
                {"id": 7, "title": "a", "image_files": "a.jpg"},
                {"title": "b"},
                {"id": "7", "title": "c", "source": "sheet_row_3"},
                "garbage"
            ]
        });
        let outcome = normalize(result, DataFormat::Csv);
        let ids: Vec<_> = outcome.items.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["7", "item_002", "7-2"]);
        assert_eq!(outcome.items[0].image_files, vec!["a.jpg".to_string()]);
        assert_eq!(outcome.items[1].source, "csv_row_2");
        assert_eq!(outcome.items[2].source, "sheet_row_3");
        assert_eq!(outcome.fields_discovered, vec!["title".to_string()]);
        assert_eq!(outcome.matching_strategy.as_deref(), Some("sku prefix"));
        assert_eq!(outcome.errors.len(), 2);
    }

    #[tokio::test]
    async fn validation_returns_program_issues() {
        let (executor, _) = executor_ok(json!({"passed": false, "score": 85, "issues": ["Title too short"]}));
        let issues = executor
            .validate(
                "def validate_listing(listing, style_profile):\n    return {}\n",
                &json!({"title": "x"}),
                &StyleProfile::default(),
            )
            .await
            .expect("issues");
        assert_eq!(issues, vec!["Title too short".to_string()]);
    }

    #[tokio::test]
    async fn validation_failures_surface_as_errors() {
        let (executor, stub) = stub_executor(ScriptReply::Missing);
        let style = StyleProfile::default();
        let listing = json!({});
        assert!(executor.validate("", &listing, &style).await.is_err());
        assert!(matches!(
            executor.validate("import json\n", &listing, &style).await,
            Err(SandboxIssue::Rejected(_))
        ));
        assert_eq!(stub.run_count(), 0);
        assert!(executor.validate("x = 1\n", &listing, &style).await.is_err());
        assert_eq!(stub.run_count(), 1);
    }
}
