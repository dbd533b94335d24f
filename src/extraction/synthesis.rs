use super::{fingerprint::ColumnFingerprint, store::ScriptStore};
use crate::{
    llm::{AiError, AiService, CodeRun, Effort, UsageLedger},
    models::CatalogItem,
    sandbox::{DataFormat, ExtractionInput, ExtractionOutcome, Executor},
    storage::StoreError,
};
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

/// Raw input to the synthesis loop: a small sample for the model to develop
/// against and the full payload the program is graded on.
#[derive(Debug, Clone)]
pub struct DataSource {
    pub format: DataFormat,
    pub headers: Vec<String>,
    pub sample: String,
    pub full: String,
    pub total_rows: usize,
    pub image_filenames: Vec<String>,
    /// Free-form seller notes passed to the model verbatim.
    pub context: Option<String>,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("model did not produce an extraction program; it replied: {0}")]
    NoProgram(String),
    #[error("model reply was not a product list: {0}")]
    Unreadable(String),
    #[error("extraction failed after {rounds} attempts: {}", .errors.join("; "))]
    Exhausted { rounds: usize, errors: Vec<String> },
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct Synthesis {
    pub items: Vec<CatalogItem>,
    /// Issues still outstanding on a best-effort result. Empty on a clean run.
    pub errors: Vec<String>,
    pub fields_discovered: Vec<String>,
    pub matching_strategy: Option<String>,
    pub fingerprint: ColumnFingerprint,
    pub cache_hit: bool,
    pub rounds: usize,
}

pub struct ScriptSynthesizer<'a> {
    ai: &'a dyn AiService,
    executor: &'a Executor,
    store: &'a ScriptStore,
    ledger: &'a UsageLedger,
    max_rounds: usize,
}

impl<'a> ScriptSynthesizer<'a> {
    pub fn new(
        ai: &'a dyn AiService,
        executor: &'a Executor,
        store: &'a ScriptStore,
        ledger: &'a UsageLedger,
        max_rounds: usize,
    ) -> Self {
        Self {
            ai,
            executor,
            store,
            ledger,
            max_rounds: max_rounds.max(1),
        }
    }

    /// Develop (or reuse) a program, run it on the full data, and repair it
    /// until it runs clean or the round budget is spent.
    pub async fn synthesize(&self, source: &DataSource) -> Result<Synthesis, ExtractionError> {
        let started = Instant::now();
        let fingerprint = ColumnFingerprint::of(&source.headers);

        let (mut program, cache_hit) = match self.store.load(&fingerprint)? {
            Some(saved) => {
                info!(
                    target = "listing.extract",
                    fingerprint = %fingerprint,
                    version = saved.version,
                    "reusing_saved_program"
                );
                (saved.script, true)
            }
            None => (self.develop(source).await?, false),
        };

        let input = ExtractionInput {
            format: source.format,
            data: &source.full,
            image_filenames: &source.image_filenames,
            expected_rows: source.total_rows,
        };

        let mut rounds = 0;
        let mut outcome = ExtractionOutcome::default();
        while rounds < self.max_rounds {
            rounds += 1;
            outcome = self.executor.extract(&program, &input).await;
            if outcome.is_clean() {
                self.store
                    .save(&fingerprint, &source.headers, &program)?;
                info!(
                    target = "listing.extract",
                    fingerprint = %fingerprint,
                    items = outcome.items.len(),
                    rounds,
                    cache_hit,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "extraction_clean"
                );
                return Ok(finish(outcome, fingerprint, cache_hit, rounds));
            }

            let errors = outcome.error_messages();
            warn!(
                target = "listing.extract",
                attempt = rounds,
                max_rounds = self.max_rounds,
                errors = ?errors.iter().take(3).collect::<Vec<_>>(),
                "extraction_attempt_failed"
            );
            if rounds == self.max_rounds {
                break;
            }
            match self.repair(&program, &errors, source).await? {
                Some(fixed) => program = fixed,
                None => break,
            }
        }

        if outcome.items.is_empty() {
            return Err(ExtractionError::Exhausted {
                rounds,
                errors: outcome.error_messages(),
            });
        }
        warn!(
            target = "listing.extract",
            items = outcome.items.len(),
            errors = ?outcome.error_messages(),
            "extraction_best_effort"
        );
        Ok(finish(outcome, fingerprint, cache_hit, rounds))
    }

    async fn develop(&self, source: &DataSource) -> Result<String, ExtractionError> {
        let generation = self
            .ai
            .generate_with_code(&develop_prompt(source), Some(&source.sample), Effort::High)
            .await?;
        self.ledger.record(generation.usage);
        let CodeRun { text, program } = generation.value;
        program.ok_or_else(|| ExtractionError::NoProgram(excerpt(&text)))
    }

    async fn repair(
        &self,
        program: &str,
        errors: &[String],
        source: &DataSource,
    ) -> Result<Option<String>, ExtractionError> {
        let generation = self
            .ai
            .generate_with_code(
                &repair_prompt(program, errors, source),
                Some(&source.sample),
                Effort::High,
            )
            .await?;
        self.ledger.record(generation.usage);
        if generation.value.program.is_none() {
            warn!(
                target = "listing.extract",
                reply = %excerpt(&generation.value.text),
                "repair_returned_no_program"
            );
        }
        Ok(generation.value.program)
    }
}

/// First few hundred characters of a model reply, for errors and logs.
pub(super) fn excerpt(text: &str) -> String {
    const LIMIT: usize = 300;
    let trimmed = text.trim();
    match trimmed.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

fn finish(
    outcome: ExtractionOutcome,
    fingerprint: ColumnFingerprint,
    cache_hit: bool,
    rounds: usize,
) -> Synthesis {
    let errors = outcome.error_messages();
    Synthesis {
        items: outcome.items,
        errors,
        fields_discovered: outcome.fields_discovered,
        matching_strategy: outcome.matching_strategy,
        fingerprint,
        cache_hit,
        rounds,
    }
}

fn read_hint(format: DataFormat) -> String {
    let var = format.variable();
    match format {
        DataFormat::Csv => format!("`df = pd.read_csv(io.StringIO({var}))`"),
        DataFormat::Json => format!("`data = json.loads({var})`"),
        DataFormat::Text => format!("`lines = {var}.splitlines()`"),
    }
}

fn image_listing(images: &[String]) -> String {
    let mut listing = images
        .iter()
        .take(50)
        .map(|name| format!("  - {name}"))
        .collect::<Vec<_>>()
        .join("\n");
    if images.len() > 50 {
        listing.push_str(&format!("\n  ... and {} more", images.len() - 50));
    }
    if listing.is_empty() {
        listing.push_str("  (none)");
    }
    listing
}

fn develop_prompt(source: &DataSource) -> String {
    let var = source.format.variable();
    let prefix = source.format.as_str();
    format!(
        "You are writing a data extraction program for a product catalog.\n\n\
## Sample data ({format})\n\
The attached file is a representative sample of the full dataset ({total} items in total). \
Develop and test your program against it.\n\n\
## Image files ({image_count} total)\n{images}\n\n\
## Seller notes\n{context}\n\n\
## Task\n\
Write a Python program. All input is already loaded; never call open().\n\
1. Read the string variable `{var}`, for example {read}.\n\
2. Clean the data: strip whitespace, use None for missing values (never \"nan\"), \
parse prices to float when present, drop fully empty entries.\n\
3. Discover every meaningful product field.\n\
4. Match files from the list variable `image_filenames` to items using SKU, name or id patterns.\n\
5. Assign a JSON string to `result_json` shaped like:\n\
   {{\"fields_discovered\": [...], \"items\": [{{\"id\": \"item_001\", \"image_files\": [...], \
\"source\": \"{prefix}_row_1\", ...fields...}}], \"image_matching_strategy\": \"...\"}}\n\n\
Rules: the program must work on the full dataset, not just the sample. Do not hardcode row \
counts or sample values. Every item needs a unique id. Only json, re, math, io, csv and pandas \
may be imported. Print a short summary of the item count and fields when you test it.",
        format = source.format.as_str(),
        total = source.total_rows,
        image_count = source.image_filenames.len(),
        images = image_listing(&source.image_filenames),
        context = source.context.as_deref().unwrap_or("(none)"),
        read = read_hint(source.format),
    )
}

fn repair_prompt(program: &str, errors: &[String], source: &DataSource) -> String {
    let error_list = errors
        .iter()
        .map(|err| format!("- {err}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "This extraction program failed when run against the full dataset.\n\n\
## Program\n```python\n{program}\n```\n\n\
## Errors\n{error_list}\n\n\
## Columns\n{headers}\n\n\
## Expected item count\n{total}\n\n\
Fix the program. Keep the interface: read `{var}` (a string already in scope) and \
`image_filenames` (a list), assign a JSON string to `result_json`, never call open(), \
read the data with {read}. Test on the attached sample and print a summary.",
        headers = source.headers.join(", "),
        total = source.total_rows,
        var = source.format.variable(),
        read = read_hint(source.format),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{Scripted, ScriptedAi};
    use crate::sandbox::runtime::ScriptReply;
    use crate::sandbox::testing::StubRuntime;
    use serde_json::{Value, json};
    use std::sync::Arc;

    const GOOD: &str = "result_json = 'good'\n";
    const SHORT: &str = "result_json = 'short'\n";
    const BROKEN: &str = "result_json = 'broken'\n";

    fn items(n: usize) -> Value {
        Value::Array(
            (0..n)
                .map(|i| json!({"id": format!("p{i}"), "title": "Mug", "price": 12}))
                .collect(),
        )
    }

    /// Replies depend on which program is being run.
    fn stub() -> Arc<StubRuntime> {
        Arc::new(StubRuntime::new(|request| match request.program.as_str() {
            GOOD => ScriptReply::Ok { result: items(10) },
            SHORT => ScriptReply::Ok { result: items(5) },
            _ => ScriptReply::Error {
                error: "KeyError: 'sku'".into(),
            },
        }))
    }

    fn source() -> DataSource {
        DataSource {
            format: DataFormat::Csv,
            headers: vec!["sku".into(), "title".into(), "price".into()],
            sample: "sku,title,price\n1,Mug,12\n".into(),
            full: "sku,title,price\n...".into(),
            total_rows: 10,
            image_filenames: vec![],
            context: None,
        }
    }

    #[tokio::test]
    async fn repairs_until_clean_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ScriptStore::new(dir.path());
        let executor = Executor::new(stub());
        let ai = ScriptedAi::new(vec![
            Scripted::Code(Some(BROKEN.into())),
            Scripted::Code(Some(GOOD.into())),
        ]);
        let ledger = UsageLedger::new();
        let synth = ScriptSynthesizer::new(&ai, &executor, &store, &ledger, 3);

        let out = synth.synthesize(&source()).await.expect("synthesis");
        assert_eq!(out.items.len(), 10);
        assert!(out.errors.is_empty());
        assert_eq!(out.rounds, 2);
        assert!(!out.cache_hit);
        assert_eq!(ledger.snapshot().calls, 2);

        let saved = store.load(&out.fingerprint).expect("load").expect("saved");
        assert_eq!(saved.script, GOOD);

        let repair_prompt = &ai.prompts.lock().expect("prompts")[1];
        assert!(repair_prompt.contains("KeyError: 'sku'"));
    }

    #[tokio::test]
    async fn cache_hit_skips_the_model_but_still_runs_full_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ScriptStore::new(dir.path());
        let src = source();
        store
            .save(&ColumnFingerprint::of(&src.headers), &src.headers, GOOD)
            .expect("seed");
        let runtime = stub();
        let executor = Executor::new(runtime.clone());
        let ai = ScriptedAi::new(vec![]);
        let ledger = UsageLedger::new();
        let synth = ScriptSynthesizer::new(&ai, &executor, &store, &ledger, 3);

        let out = synth.synthesize(&src).await.expect("synthesis");
        assert!(out.cache_hit);
        assert_eq!(ai.call_count(), 0);
        assert_eq!(runtime.run_count(), 1);
    }

    #[tokio::test]
    async fn best_effort_items_survive_exhaustion_without_persisting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ScriptStore::new(dir.path());
        let executor = Executor::new(stub());
        let ai = ScriptedAi::new(vec![
            Scripted::Code(Some(SHORT.into())),
            Scripted::Code(Some(SHORT.into())),
            Scripted::Code(Some(SHORT.into())),
        ]);
        let ledger = UsageLedger::new();
        let synth = ScriptSynthesizer::new(&ai, &executor, &store, &ledger, 3);

        let src = source();
        let out = synth.synthesize(&src).await.expect("best effort");
        assert_eq!(out.items.len(), 5);
        assert_eq!(out.rounds, 3);
        assert!(out.errors[0].starts_with("Row count mismatch"));
        assert_eq!(ai.call_count(), 3);
        let fp = ColumnFingerprint::of(&src.headers);
        assert!(store.load(&fp).expect("load").is_none());
    }

    #[tokio::test]
    async fn zero_items_after_exhaustion_is_a_hard_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ScriptStore::new(dir.path());
        let executor = Executor::new(stub());
        let ai = ScriptedAi::new(vec![
            Scripted::Code(Some(BROKEN.into())),
            Scripted::Code(None),
        ]);
        let ledger = UsageLedger::new();
        let synth = ScriptSynthesizer::new(&ai, &executor, &store, &ledger, 3);

        let err = synth.synthesize(&source()).await.expect_err("fails");
        assert!(matches!(err, ExtractionError::Exhausted { rounds: 1, .. }));
    }

    #[tokio::test]
    async fn a_reply_without_code_is_reported_with_its_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ScriptStore::new(dir.path());
        let executor = Executor::new(stub());
        let ai = ScriptedAi::new(vec![Scripted::Code(None)]);
        let ledger = UsageLedger::new();
        let synth = ScriptSynthesizer::new(&ai, &executor, &store, &ledger, 3);

        let err = synth.synthesize(&source()).await.expect_err("no program");
        assert!(
            matches!(&err, ExtractionError::NoProgram(reply) if reply.contains("could not write"))
        );
        assert_eq!(excerpt(&"x".repeat(400)).len(), 303);
    }

    #[tokio::test]
    async fn quota_exhaustion_propagates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ScriptStore::new(dir.path());
        let executor = Executor::new(stub());
        let ai = ScriptedAi::new(vec![Scripted::Fail(AiError::QuotaExhausted(
            "daily limit".into(),
        ))]);
        let ledger = UsageLedger::new();
        let synth = ScriptSynthesizer::new(&ai, &executor, &store, &ledger, 3);
        let err = synth.synthesize(&source()).await.expect_err("quota");
        assert!(matches!(err, ExtractionError::Ai(AiError::QuotaExhausted(_))));
    }
}
