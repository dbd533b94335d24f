use super::{ProgressHub, ResultStore};
use crate::{
    llm::{AiError, AiService, Effort, ImagePart, UsageLedger},
    metrics,
    models::{
        BatchReport, CatalogItem, FailureKind, ItemResult, ItemStatus, ProgressEvent,
        StyleProfile, ValidationResult,
    },
    recipe::{Recipe, ValidationEngine, template::fill_template, tester::item_images},
    sandbox::Executor,
    storage::{JobDir, StoreError},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Instant,
};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info, warn};

pub const QUOTA_MESSAGE: &str = "AI quota exhausted; batch stopped early";

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("recipe v{0} is not approved")]
    NotApproved(u32),
    #[error("unknown item ids: {}", .0.join(", "))]
    UnknownIds(Vec<String>),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Which items a run generates. Everything else keeps its settled result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum RerunScope {
    /// Items with no result yet, or whose last run was short-circuited.
    #[default]
    Pending,
    /// Every item that has not succeeded.
    Failed,
    Ids { ids: Vec<String> },
}

impl RerunScope {
    fn includes(&self, item: &CatalogItem, settled: Option<&ItemResult>) -> bool {
        match self {
            RerunScope::Pending => settled.is_none_or(|result| {
                result.failure.is_some_and(|failure| failure.short_circuited())
            }),
            RerunScope::Failed => settled.is_none_or(|result| result.failed),
            RerunScope::Ids { ids } => ids.iter().any(|id| *id == item.id),
        }
    }
}

/// Cooperative stop signals shared by every worker of one run.
#[derive(Debug, Default)]
pub struct BatchControl {
    quota_exhausted: AtomicBool,
    cancelled: AtomicBool,
}

impl BatchControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns true for the caller that flipped the flag.
    pub fn trip_quota(&self) -> bool {
        !self.quota_exhausted.swap(true, Ordering::SeqCst)
    }

    pub fn quota_exhausted(&self) -> bool {
        self.quota_exhausted.load(Ordering::SeqCst)
    }

    fn stop_reason(&self) -> Option<FailureKind> {
        if self.quota_exhausted() {
            Some(FailureKind::QuotaExhausted)
        } else if self.is_cancelled() {
            Some(FailureKind::Cancelled)
        } else {
            None
        }
    }
}

/// One batch invocation.
#[derive(Debug)]
pub struct BatchRun {
    pub job: JobDir,
    pub recipe: Recipe,
    pub style: StyleProfile,
    pub items: Vec<CatalogItem>,
    pub scope: RerunScope,
}

#[derive(Clone)]
pub struct BatchEngine {
    ai: Arc<dyn AiService>,
    executor: Executor,
    concurrency: usize,
    semantic_judge: bool,
}

struct Shared {
    ai: Arc<dyn AiService>,
    executor: Executor,
    recipe: Recipe,
    style: StyleProfile,
    job: JobDir,
    store: ResultStore,
    hub: ProgressHub,
    control: Arc<BatchControl>,
    ledger: UsageLedger,
    semaphore: Semaphore,
    completed: AtomicUsize,
    total: usize,
    semantic_judge: bool,
}

impl BatchEngine {
    pub fn new(ai: Arc<dyn AiService>, executor: Executor, concurrency: usize) -> Self {
        Self {
            ai,
            executor,
            concurrency: concurrency.max(1),
            semantic_judge: false,
        }
    }

    pub fn with_semantic_judge(mut self, enabled: bool) -> Self {
        self.semantic_judge = enabled;
        self
    }

    /// Runs the approved recipe over every in-scope item with bounded
    /// parallelism. Per-item failures never abort the batch; quota exhaustion
    /// and cancellation short-circuit items that have not started.
    pub async fn execute(
        &self,
        run: BatchRun,
        hub: &ProgressHub,
        control: Arc<BatchControl>,
    ) -> Result<BatchReport, BatchError> {
        let BatchRun {
            job,
            recipe,
            style,
            items,
            scope,
        } = run;
        if !recipe.approved {
            return Err(BatchError::NotApproved(recipe.version));
        }
        if let RerunScope::Ids { ids } = &scope {
            let known: HashSet<&str> = items.iter().map(|item| item.id.as_str()).collect();
            let unknown: Vec<String> = ids
                .iter()
                .filter(|id| !known.contains(id.as_str()))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                return Err(BatchError::UnknownIds(unknown));
            }
        }

        let started = Instant::now();
        let store = ResultStore::new(&job);
        let mut settled: Vec<ItemResult> = Vec::new();
        let mut todo: Vec<CatalogItem> = Vec::new();
        for item in items {
            let previous = store.load(&item.id)?;
            if scope.includes(&item, previous.as_ref()) {
                todo.push(item);
            } else if let Some(result) = previous {
                settled.push(result);
            }
        }

        let job_id = job.id().to_string();
        let total = todo.len();
        info!(
            target = "listing.batch",
            job_id = %job_id,
            version = recipe.version,
            total,
            settled = settled.len(),
            concurrency = self.concurrency,
            "batch_start"
        );
        hub.publish(ProgressEvent::BatchStart {
            job_id: job_id.clone(),
            total,
        });

        let recipe_version = recipe.version;
        let shared = Arc::new(Shared {
            ai: self.ai.clone(),
            executor: self.executor.clone(),
            recipe,
            style,
            job,
            store,
            hub: hub.clone(),
            control: control.clone(),
            ledger: UsageLedger::new(),
            semaphore: Semaphore::new(self.concurrency),
            completed: AtomicUsize::new(0),
            total,
            semantic_judge: self.semantic_judge,
        });

        let mut unresolved: HashMap<String, Option<String>> = todo
            .iter()
            .map(|item| (item.id.clone(), item.image_files.first().cloned()))
            .collect();
        let mut workers = JoinSet::new();
        for item in todo {
            let shared = shared.clone();
            workers.spawn(async move { resolve(&shared, item).await });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(result) => {
                    unresolved.remove(&result.item_id);
                    results.push(result);
                }
                Err(err) => {
                    error!(target = "listing.batch", job_id = %job_id, error = %err, "worker_task_failed")
                }
            }
        }
        // A worker that panicked still owes its item a result.
        for (item_id, image_filename) in unresolved {
            let mut result = ItemResult::failed(&item_id, FailureKind::Generation, "worker task aborted");
            result.image_filename = image_filename;
            results.push(settle(&shared, result));
        }

        results.extend(settled);
        let report = build_report(
            &job_id,
            recipe_version,
            &results,
            started.elapsed().as_secs_f64(),
            &shared,
        );
        shared.store.write_report(&report)?;
        metrics::stage_elapsed("batch", started.elapsed().as_millis());
        info!(
            target = "listing.batch",
            job_id = %job_id,
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            retried = report.retried,
            avg_score = report.avg_score,
            quota_exhausted = report.quota_exhausted,
            "batch_complete"
        );
        hub.publish(ProgressEvent::BatchComplete {
            report: report.clone(),
        });
        Ok(report)
    }
}

fn build_report(
    job_id: &str,
    recipe_version: u32,
    results: &[ItemResult],
    elapsed: f64,
    shared: &Shared,
) -> BatchReport {
    let failed = results.iter().filter(|result| result.failed).count();
    let scores: Vec<u32> = results
        .iter()
        .filter(|result| result.listing.is_some())
        .filter_map(ItemResult::score)
        .collect();
    let avg_score = if scores.is_empty() {
        0.0
    } else {
        let sum: u32 = scores.iter().sum();
        ((sum as f64 / scores.len() as f64) * 10.0).round() / 10.0
    };
    BatchReport {
        job_id: job_id.to_string(),
        recipe_version,
        total: results.len(),
        succeeded: results.len() - failed,
        failed,
        retried: results.iter().filter(|result| result.retried).count(),
        avg_score,
        elapsed_seconds: (elapsed * 10.0).round() / 10.0,
        completed_at: Utc::now(),
        quota_exhausted: shared.control.quota_exhausted(),
        cancelled: shared.control.is_cancelled(),
        usage: shared.ledger.summary(),
    }
}

fn short_circuit(item: &CatalogItem, reason: FailureKind) -> ItemResult {
    let message = match reason {
        FailureKind::Cancelled => "batch cancelled",
        _ => QUOTA_MESSAGE,
    };
    let mut result = ItemResult::failed(&item.id, reason, message);
    result.image_filename = item.image_files.first().cloned();
    result
}

async fn resolve(shared: &Shared, item: CatalogItem) -> ItemResult {
    let result = match shared.control.stop_reason() {
        Some(reason) => short_circuit(&item, reason),
        None => match shared.semaphore.acquire().await {
            Ok(_permit) => match shared.control.stop_reason() {
                Some(reason) => short_circuit(&item, reason),
                None => process(shared, &item).await,
            },
            Err(_) => short_circuit(&item, FailureKind::Cancelled),
        },
    };
    settle(shared, result)
}

/// Durable write first, then the progress notification. A result that
/// cannot be written is reported as failed, so the report and the progress
/// stream never count an item the disk does not hold.
fn settle(shared: &Shared, mut result: ItemResult) -> ItemResult {
    let written = shared
        .store
        .write(&result)
        .or_else(|_| shared.store.write(&result));
    if let Err(err) = written {
        error!(target = "listing.batch", item_id = %result.item_id, error = %err, "result_write_failed");
        result.failed = true;
        result.failure = Some(FailureKind::Generation);
        result.error = Some(format!("result could not be saved: {err}"));
    }
    metrics::item_outcome(
        result.failure.map(|failure| failure.as_str()).unwrap_or("passed"),
        result.retried,
    );
    let completed = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
    let title = result
        .listing
        .as_ref()
        .and_then(|listing| listing.get("title"))
        .and_then(Value::as_str)
        .map(str::to_string);
    shared.hub.publish(ProgressEvent::Progress {
        item_id: result.item_id.clone(),
        completed,
        total: shared.total,
        score: result.validation.as_ref().map(|validation| validation.score),
        title,
        status: if result.failed {
            ItemStatus::Failed
        } else {
            ItemStatus::Passed
        },
    });
    result
}

/// Attempt outcome before it is folded into an `ItemResult`.
struct Attempt {
    listing: Value,
    validation: ValidationResult,
}

async fn process(shared: &Shared, item: &CatalogItem) -> ItemResult {
    let prompt = fill_template(&shared.recipe.prompt_template, item, &shared.style);
    let images = item_images(&shared.job, item).await;
    let image_filename = item.image_files.first().cloned();
    let mut result = ItemResult {
        item_id: item.id.clone(),
        listing: None,
        validation: None,
        image_filename,
        retried: false,
        failed: true,
        failure: None,
        error: None,
    };

    let first = match attempt(shared, item, &prompt, &images, Effort::Low).await {
        Ok(first) => first,
        Err(err) => {
            note_failure(shared, item, &err, 1);
            result.failure = Some(failure_for(&err));
            result.error = Some(err.to_string());
            return result;
        }
    };
    if first.validation.passed {
        result.listing = Some(first.listing);
        result.validation = Some(first.validation);
        result.failed = false;
        return result;
    }

    let issues = first.validation.issues.clone();
    info!(
        target = "listing.batch",
        item_id = %item.id,
        score = first.validation.score,
        issues = issues.len(),
        "item_retrying"
    );
    shared.hub.publish(ProgressEvent::Retrying {
        item_id: item.id.clone(),
        issues: issues.clone(),
    });
    result.retried = true;

    let corrective = corrective_prompt(&prompt, &issues);
    match attempt(shared, item, &corrective, &images, Effort::Medium).await {
        Ok(second) => {
            result.failed = !second.validation.passed;
            if result.failed {
                result.failure = Some(FailureKind::Validation);
            }
            result.listing = Some(second.listing);
            result.validation = Some(second.validation);
        }
        Err(err) => {
            note_failure(shared, item, &err, 2);
            result.listing = Some(first.listing);
            result.validation = Some(first.validation);
            result.failure = Some(failure_for(&err));
            result.error = Some(err.to_string());
        }
    }
    result
}

async fn attempt(
    shared: &Shared,
    item: &CatalogItem,
    prompt: &str,
    images: &[ImagePart],
    effort: Effort,
) -> Result<Attempt, AiError> {
    let generation = shared
        .ai
        .generate_structured(prompt, images, &shared.recipe.output_schema, effort)
        .await?;
    shared.ledger.record(generation.usage);
    let listing = generation.value;

    let engine = if shared.semantic_judge {
        ValidationEngine::with_judge(&shared.executor, shared.ai.as_ref(), &shared.ledger)
    } else {
        ValidationEngine::structural(&shared.executor)
    };
    let validation = engine
        .validate(&listing, &shared.recipe.validation_program, &shared.style, item)
        .await;
    Ok(Attempt {
        listing,
        validation,
    })
}

fn failure_for(err: &AiError) -> FailureKind {
    if err.is_quota() {
        FailureKind::QuotaExhausted
    } else {
        FailureKind::Generation
    }
}

fn note_failure(shared: &Shared, item: &CatalogItem, err: &AiError, attempt: u8) {
    if err.is_quota() {
        if shared.control.trip_quota() {
            error!(target = "listing.batch", item_id = %item.id, error = %err, "quota_exhausted");
            shared.hub.publish(ProgressEvent::BatchError {
                error: QUOTA_MESSAGE.to_string(),
            });
        }
    } else {
        warn!(target = "listing.batch", item_id = %item.id, attempt, error = %err, "generation_failed");
    }
}

fn corrective_prompt(prompt: &str, issues: &[String]) -> String {
    let listed = issues
        .iter()
        .map(|issue| format!("- {issue}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{prompt}\n\n## IMPORTANT: the previous attempt had these issues, fix them:\n{listed}\n\n\
Make sure to address every issue listed above."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CodeRun, Generation, Usage};
    use crate::recipe::DEFAULT_OUTPUT_SCHEMA;
    use crate::sandbox::runtime::ScriptReply;
    use crate::sandbox::testing::StubRuntime;
    use crate::storage::JobStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers structured calls with a listing titled after the first prompt
    /// line, which the test recipe makes the item id.
    #[derive(Default)]
    struct EchoAi {
        quota_on: Option<String>,
        /// Replaced by a plain file on the first call, so result writes fail.
        break_listings: Option<std::path::PathBuf>,
        calls: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AiService for EchoAi {
        async fn generate_text(&self, _: &str, _: Effort) -> Result<Generation<String>, AiError> {
            Err(AiError::InvalidResponse("text not used".into()))
        }

        async fn generate_with_code(
            &self,
            _: &str,
            _: Option<&str>,
            _: Effort,
        ) -> Result<Generation<CodeRun>, AiError> {
            Err(AiError::InvalidResponse("code not used".into()))
        }

        async fn generate_with_images(
            &self,
            _: &str,
            _: &[ImagePart],
            _: Effort,
        ) -> Result<Generation<String>, AiError> {
            Err(AiError::InvalidResponse("images not used".into()))
        }

        async fn generate_structured(
            &self,
            prompt: &str,
            _: &[ImagePart],
            _: &Value,
            effort: Effort,
        ) -> Result<Generation<Value>, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let id = prompt.lines().next().unwrap_or_default().to_string();
            self.order.lock().expect("order").push(id.clone());
            if self.quota_on.as_deref() == Some(id.as_str()) {
                return Err(AiError::QuotaExhausted("daily limit exceeded".into()));
            }
            if let Some(dir) = &self.break_listings {
                if !dir.is_file() {
                    let _ = std::fs::remove_dir_all(dir);
                    std::fs::create_dir_all(dir.parent().expect("output dir")).expect("output");
                    std::fs::write(dir, b"not a directory").expect("blocker");
                }
            }
            tokio::task::yield_now().await;
            Ok(Generation::new(
                json!({"title": id, "corrected": effort == Effort::Medium}),
                Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    calls: 1,
                },
            ))
        }
    }

    /// Validation fails only the first attempt for `flaky`.
    fn executor(flaky: &'static str) -> Executor {
        Executor::new(Arc::new(StubRuntime::new(move |request| {
            let listing = &request.inputs["listing"];
            let bad = listing["title"] == flaky && listing["corrected"] == false;
            let issues = if bad { json!(["Title is too short"]) } else { json!([]) };
            ScriptReply::Ok {
                result: json!({"issues": issues}),
            }
        })))
    }

    fn recipe() -> Recipe {
        Recipe {
            version: 3,
            prompt_template: "{id}\nWrite a listing.".into(),
            output_schema: DEFAULT_OUTPUT_SCHEMA.clone(),
            validation_program: "def validate_listing(listing, style_profile):\n    return {'issues': []}\n".into(),
            approved: true,
            approved_at: Some(Utc::now()),
            created_at: Utc::now(),
            changes_made: None,
            test_results: Vec::new(),
        }
    }

    fn items(n: usize) -> Vec<CatalogItem> {
        (1..=n)
            .map(|i| CatalogItem::new(format!("item_{i:03}")).with_field("title", format!("Thing {i}")))
            .collect()
    }

    fn job() -> (tempfile::TempDir, JobDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = JobStore::new(dir.path())
            .job(&uuid::Uuid::new_v4().to_string())
            .expect("job");
        (dir, job)
    }

    fn run(job: &JobDir, items: Vec<CatalogItem>, scope: RerunScope) -> BatchRun {
        BatchRun {
            job: job.clone(),
            recipe: recipe(),
            style: StyleProfile::default(),
            items,
            scope,
        }
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_retry_then_everything_passes() {
        let (_dir, job) = job();
        let ai = Arc::new(EchoAi::default());
        let engine = BatchEngine::new(ai.clone(), executor("item_007"), 3);
        let hub = ProgressHub::new(64);
        let mut rx = hub.subscribe();

        let report = engine
            .execute(run(&job, items(10), RerunScope::Pending), &hub, Arc::new(BatchControl::new()))
            .await
            .expect("report");

        assert_eq!(report.total, 10);
        assert_eq!(report.succeeded, 10);
        assert_eq!(report.failed, 0);
        assert_eq!(report.retried, 1);
        assert_eq!(report.avg_score, 100.0);
        assert_eq!(report.recipe_version, 3);
        assert_eq!(report.usage.calls, 11);
        assert_eq!(ai.calls.load(Ordering::SeqCst), 11);

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(ProgressEvent::BatchStart { total: 10, .. })));
        assert!(matches!(events.last(), Some(ProgressEvent::BatchComplete { .. })));
        let retrying: Vec<&ProgressEvent> = events
            .iter()
            .filter(|event| matches!(event, ProgressEvent::Retrying { .. }))
            .collect();
        assert_eq!(retrying.len(), 1);
        let progress = events
            .iter()
            .filter(|event| matches!(event, ProgressEvent::Progress { .. }))
            .count();
        assert_eq!(progress, 10);

        let stored = ResultStore::new(&job).load("item_007").expect("load").expect("result");
        assert!(stored.retried);
        assert!(!stored.failed);
        assert_eq!(stored.listing.as_ref().map(|l| l["corrected"].clone()), Some(json!(true)));
        let on_disk = ResultStore::new(&job).report().expect("report").expect("saved");
        assert_eq!(on_disk, report);
    }

    #[test]
    fn quota_short_circuits_items_not_yet_started() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let (_dir, job) = job();
            let ai = Arc::new(EchoAi {
                quota_on: Some("item_004".into()),
                ..EchoAi::default()
            });
            let engine = BatchEngine::new(ai.clone(), executor("none"), 1);
            let hub = ProgressHub::new(64);
            let mut rx = hub.subscribe();
            let control = Arc::new(BatchControl::new());

            let report = engine
                .execute(run(&job, items(10), RerunScope::Pending), &hub, control.clone())
                .await
                .expect("report");

            assert!(control.quota_exhausted());
            assert!(report.quota_exhausted);
            assert_eq!(report.total, 10);
            assert_eq!(report.succeeded, 3);
            assert_eq!(report.failed, 7);
            assert_eq!(
                *ai.order.lock().expect("order"),
                vec!["item_001", "item_002", "item_003", "item_004"]
            );

            let store = ResultStore::new(&job);
            for i in 1..=10 {
                let result = store
                    .load(&format!("item_{i:03}"))
                    .expect("load")
                    .expect("every item has a result");
                if i <= 3 {
                    assert!(!result.failed);
                } else {
                    assert_eq!(result.failure, Some(FailureKind::QuotaExhausted));
                }
            }
            let errors = drain(&mut rx)
                .into_iter()
                .filter(|event| matches!(event, ProgressEvent::BatchError { .. }))
                .count();
            assert_eq!(errors, 1);
        });
    }

    #[tokio::test]
    async fn completed_batches_are_not_regenerated() {
        let (_dir, job) = job();
        let ai = Arc::new(EchoAi::default());
        let engine = BatchEngine::new(ai.clone(), executor("none"), 2);
        let hub = ProgressHub::default();
        engine
            .execute(run(&job, items(4), RerunScope::Pending), &hub, Arc::new(BatchControl::new()))
            .await
            .expect("first");
        let store = ResultStore::new(&job);
        let before: Vec<Vec<u8>> = (1..=4)
            .map(|i| std::fs::read(store.path_for(&format!("item_{i:03}"))).expect("read"))
            .collect();

        let report = engine
            .execute(run(&job, items(4), RerunScope::Pending), &hub, Arc::new(BatchControl::new()))
            .await
            .expect("second");
        assert_eq!(ai.calls.load(Ordering::SeqCst), 4);
        assert_eq!(report.total, 4);
        assert_eq!(report.succeeded, 4);
        let after: Vec<Vec<u8>> = (1..=4)
            .map(|i| std::fs::read(store.path_for(&format!("item_{i:03}"))).expect("read"))
            .collect();
        assert_eq!(before, after);

        engine
            .execute(
                run(&job, items(4), RerunScope::Ids { ids: vec!["item_002".into()] }),
                &hub,
                Arc::new(BatchControl::new()),
            )
            .await
            .expect("rerun");
        assert_eq!(ai.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn cancelled_batches_resolve_remaining_items() {
        let (_dir, job) = job();
        let ai = Arc::new(EchoAi::default());
        let engine = BatchEngine::new(ai.clone(), executor("none"), 2);
        let control = Arc::new(BatchControl::new());
        control.cancel();
        let report = engine
            .execute(run(&job, items(3), RerunScope::Pending), &ProgressHub::default(), control)
            .await
            .expect("report");
        assert!(report.cancelled);
        assert_eq!(report.failed, 3);
        assert_eq!(ai.calls.load(Ordering::SeqCst), 0);

        // Cancelled items count as pending on the next run.
        let report = engine
            .execute(run(&job, items(3), RerunScope::Pending), &ProgressHub::default(), Arc::new(BatchControl::new()))
            .await
            .expect("resume");
        assert_eq!(report.succeeded, 3);
        assert_eq!(ai.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unapproved_recipes_and_unknown_ids_are_refused() {
        let (_dir, job) = job();
        let engine = BatchEngine::new(Arc::new(EchoAi::default()), executor("none"), 2);
        let mut unapproved = run(&job, items(1), RerunScope::Pending);
        unapproved.recipe.approved = false;
        assert!(matches!(
            engine
                .execute(unapproved, &ProgressHub::default(), Arc::new(BatchControl::new()))
                .await,
            Err(BatchError::NotApproved(3))
        ));
        let unknown = run(&job, items(1), RerunScope::Ids { ids: vec!["nope".into()] });
        assert!(matches!(
            engine
                .execute(unknown, &ProgressHub::default(), Arc::new(BatchControl::new()))
                .await,
            Err(BatchError::UnknownIds(_))
        ));
    }

    #[tokio::test]
    async fn unsaved_results_are_reported_as_failures() {
        let (_dir, job) = job();
        let ai = Arc::new(EchoAi {
            break_listings: Some(job.listings_dir()),
            ..EchoAi::default()
        });
        let engine = BatchEngine::new(ai, executor("none"), 1);
        let hub = ProgressHub::new(16);
        let mut rx = hub.subscribe();

        let report = engine
            .execute(run(&job, items(1), RerunScope::Pending), &hub, Arc::new(BatchControl::new()))
            .await
            .expect("report");

        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 1);
        assert!(!ResultStore::new(&job).path_for("item_001").exists());
        let statuses: Vec<ItemStatus> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Progress { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![ItemStatus::Failed]);
        let on_disk = ResultStore::new(&job).report().expect("report").expect("saved");
        assert_eq!(on_disk.failed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn result_is_on_disk_before_its_progress_event() {
        let (_dir, job) = job();
        let engine = BatchEngine::new(Arc::new(EchoAi::default()), executor("none"), 3);
        let hub = ProgressHub::new(64);
        let mut rx = hub.subscribe();
        let store = ResultStore::new(&job);
        let watcher = tokio::spawn(async move {
            let mut checked = 0;
            while let Ok(event) = rx.recv().await {
                match event {
                    ProgressEvent::Progress { item_id, .. } => {
                        assert!(store.path_for(&item_id).is_file());
                        checked += 1;
                    }
                    ProgressEvent::BatchComplete { .. } => break,
                    _ => {}
                }
            }
            checked
        });
        engine
            .execute(run(&job, items(6), RerunScope::Pending), &hub, Arc::new(BatchControl::new()))
            .await
            .expect("report");
        assert_eq!(watcher.await.expect("watcher"), 6);
    }
}
