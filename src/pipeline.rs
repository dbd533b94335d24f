use crate::{
    batch::{BatchControl, BatchEngine, BatchError, BatchRun, ProgressHub, RerunScope, ResultStore},
    config::Settings,
    extraction::{
        DataModel, ExtractionError, ScriptStore, ScriptSynthesizer, SourceError, build_source,
        format_for_filename, paste, sniff_format, vision::extract_from_images,
    },
    interview::{InterviewError, InterviewReply, StyleInterview},
    llm::{AiError, AiService, CostEstimate, GeminiClient, Retrying, UsageLedger, UsageSummary},
    models::{BatchReport, CatalogItem, StyleProfile},
    recipe::{
        self, AutoRefineOutcome, AutoRefiner, Recipe, RecipeError, RecipeStore, RecipeSummary,
        RecipeTester, build_auto_feedback, sampling::select_diverse_samples,
    },
    sandbox::{DataFormat, Executor},
    storage::{JobDir, JobStore, StoreError, read_json, write_json_atomic},
};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::{future::Future, path::Path, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::info;

/// Items graded when a recipe is tested without explicit ids.
pub const SAMPLE_COUNT: usize = 3;

/// Everything the service does to a job, one method per operation.
#[derive(Clone)]
pub struct Pipeline {
    settings: Arc<Settings>,
    ai: Arc<dyn AiService>,
    executor: Executor,
    jobs: JobStore,
    scripts: ScriptStore,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractRequest {
    /// Inline catalog payload.
    pub data: Option<String>,
    /// Name of a file under the job's `uploads/` folder, used when `data` is absent.
    pub file: Option<String>,
    pub format: Option<DataFormat>,
    /// Seller notes handed to the model as-is.
    pub context: Option<String>,
    /// Image-only catalogs: describe each photo with the model (default) or
    /// turn every image into a bare item.
    pub describe_images: Option<bool>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ExtractResponse {
    pub data_model: DataModel,
    pub program: Option<ProgramInfo>,
    pub usage: UsageSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgramInfo {
    pub fingerprint: String,
    pub cache_hit: bool,
    pub rounds: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StyleChatRequest {
    /// The seller's answer. Omit it to open the interview.
    pub message: Option<String>,
    /// Drop the saved transcript and start again.
    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StyleChatResponse {
    #[serde(flatten)]
    pub reply: InterviewReply,
    pub usage: UsageSummary,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestRequest {
    #[serde(default)]
    pub sample_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefineRequest {
    pub feedback: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct TestResponse {
    pub recipe: Recipe,
    pub avg_score: Option<f64>,
    pub cost_estimate: Option<CostEstimate>,
    pub usage: UsageSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoRefineResponse {
    #[serde(flatten)]
    pub outcome: AutoRefineOutcome,
    pub usage: UsageSummary,
}

impl Pipeline {
    pub fn new(settings: Settings, ai: Arc<dyn AiService>, executor: Executor) -> Self {
        let jobs = JobStore::new(settings.data_dir.clone());
        let scripts = ScriptStore::new(jobs.scripts_dir());
        Self {
            settings: Arc::new(settings),
            ai,
            executor,
            jobs,
            scripts,
        }
    }

    /// Gemini behind the transient-retry wrapper, programs in `python3`.
    pub fn from_settings(settings: Settings) -> Self {
        let ai = Retrying::new(GeminiClient::new(settings.gemini.clone()), settings.retry);
        let executor = Executor::python(&settings.sandbox);
        Self::new(settings, Arc::new(ai), executor)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Canonical form of a job id. Anything that is not a uuid is refused.
    pub fn job_id(&self, raw: &str) -> Result<String, PipelineError> {
        Ok(self.jobs.job(raw).at("jobs")?.id().to_string())
    }

    pub fn job_exists(&self, id: &str) -> bool {
        self.jobs.job(id).is_ok_and(|job| job.exists())
    }

    fn existing_job(&self, stage: &'static str, id: &str) -> Result<JobDir, PipelineError> {
        let job = self.jobs.job(id).at(stage)?;
        if !job.exists() {
            return Err(PipelineError::not_found(
                stage,
                format!("job {} does not exist", job.id()),
            ));
        }
        Ok(job)
    }

    pub async fn extract(
        &self,
        job_id: &str,
        request: ExtractRequest,
    ) -> Result<ExtractResponse, PipelineError> {
        const STAGE: &str = "extract";
        timed(STAGE, async {
            let job = self.jobs.job(job_id).at(STAGE)?;
            let images = job.image_files();
            let ledger = UsageLedger::new();

            let (data_model, program) = match self.payload(&job, &request).await? {
                Some((format, payload)) if paste::fits_direct(format, &payload) => {
                    let outcome = paste::extract_from_paste(
                        self.ai.as_ref(),
                        &payload,
                        &images,
                        request.context.as_deref(),
                        &ledger,
                    )
                    .await
                    .at(STAGE)?;
                    let errors = outcome.error_messages();
                    let strategy = outcome
                        .matching_strategy
                        .unwrap_or_else(|| "Direct reading of pasted text".to_string());
                    let model = DataModel::assemble(outcome.items, &images, strategy, errors)
                        .with_declared_order(&outcome.fields_discovered);
                    (model, None)
                }
                Some((format, payload)) => {
                    let source = {
                        let mut rng = rand::rng();
                        build_source(
                            format,
                            payload,
                            images.clone(),
                            request.context.clone(),
                            &mut rng,
                        )
                        .at(STAGE)?
                    };
                    let synthesis = ScriptSynthesizer::new(
                        self.ai.as_ref(),
                        &self.executor,
                        &self.scripts,
                        &ledger,
                        self.settings.extraction_max_rounds,
                    )
                    .synthesize(&source)
                    .await
                    .at(STAGE)?;
                    let strategy = synthesis.matching_strategy.clone().unwrap_or_else(|| {
                        format!("Program extraction from {}", format.as_str())
                    });
                    let info = ProgramInfo {
                        fingerprint: synthesis.fingerprint.to_string(),
                        cache_hit: synthesis.cache_hit,
                        rounds: synthesis.rounds,
                    };
                    let model =
                        DataModel::assemble(synthesis.items, &images, strategy, synthesis.errors)
                            .with_declared_order(&synthesis.fields_discovered);
                    (model, Some(info))
                }
                None if images.is_empty() => {
                    return Err(PipelineError::invalid_input(
                        STAGE,
                        "nothing to extract: send data, name an uploaded file, or upload images",
                    ));
                }
                None if request.describe_images == Some(false) => {
                    (DataModel::image_only(&images), None)
                }
                None => {
                    let items = extract_from_images(
                        self.ai.as_ref(),
                        &job,
                        &images,
                        request.context.as_deref(),
                        &ledger,
                    )
                    .await
                    .at(STAGE)?;
                    let model = DataModel::assemble(
                        items,
                        &images,
                        "Vision extraction from product photos",
                        Vec::new(),
                    );
                    (model, None)
                }
            };

            write_json_atomic(&job.data_model_path(), &data_model).at(STAGE)?;
            info!(
                target = "listing.extract",
                job_id = %job.id(),
                items = data_model.items.len(),
                fields = data_model.fields_discovered.len(),
                warnings = data_model.quality_report.warnings.len(),
                "data_model_saved"
            );
            Ok(ExtractResponse {
                data_model,
                program,
                usage: ledger.summary(),
            })
        })
        .await
    }

    /// The catalog payload for an extraction request, if any.
    async fn payload(
        &self,
        job: &JobDir,
        request: &ExtractRequest,
    ) -> Result<Option<(DataFormat, String)>, PipelineError> {
        const STAGE: &str = "extract";
        if let Some(data) = request.data.as_ref().filter(|data| !data.trim().is_empty()) {
            let format = request.format.unwrap_or_else(|| sniff_format(data));
            return Ok(Some((format, data.clone())));
        }
        let Some(file) = request.file.as_deref() else {
            return Ok(None);
        };
        let name = Path::new(file)
            .file_name()
            .ok_or_else(|| PipelineError::invalid_input(STAGE, format!("bad file name: {file}")))?;
        let path = job.uploads_dir().join(name);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::not_found(
                    STAGE,
                    format!("uploaded file {file} not found"),
                ));
            }
            Err(err) => {
                return Err(PipelineError::internal(
                    STAGE,
                    format!("reading {}: {err}", path.display()),
                ));
            }
        };
        let format = request
            .format
            .or_else(|| format_for_filename(file))
            .unwrap_or_else(|| sniff_format(&text));
        Ok(Some((format, text)))
    }

    pub fn put_style(&self, job_id: &str, style: StyleProfile) -> Result<StyleProfile, PipelineError> {
        const STAGE: &str = "style";
        let job = self.jobs.job(job_id).at(STAGE)?;
        write_json_atomic(&job.style_path(), &style).at(STAGE)?;
        info!(target = "listing.recipe", job_id = %job.id(), platform = ?style.platform, "style_saved");
        Ok(style)
    }

    /// One turn of the style interview. A finished interview stores the
    /// profile it produced, replacing any earlier one.
    pub async fn style_chat(
        &self,
        job_id: &str,
        request: StyleChatRequest,
    ) -> Result<StyleChatResponse, PipelineError> {
        const STAGE: &str = "style_chat";
        timed(STAGE, async {
            let job = self.existing_job(STAGE, job_id)?;
            let model: Option<DataModel> = read_json(&job.data_model_path()).at(STAGE)?;
            let ledger = UsageLedger::new();
            let reply = StyleInterview::new(self.ai.as_ref(), &ledger)
                .turn(&job, model.as_ref(), request.message.as_deref(), request.restart)
                .await
                .at(STAGE)?;
            Ok(StyleChatResponse {
                reply,
                usage: ledger.summary(),
            })
        })
        .await
    }

    fn style(&self, stage: &'static str, job: &JobDir) -> Result<StyleProfile, PipelineError> {
        Ok(read_json(&job.style_path()).at(stage)?.unwrap_or_default())
    }

    fn data_model(&self, stage: &'static str, job: &JobDir) -> Result<DataModel, PipelineError> {
        read_json(&job.data_model_path())
            .at(stage)?
            .ok_or_else(|| PipelineError::not_found(stage, "no data model yet; run extraction first"))
    }

    fn current_recipe(
        &self,
        stage: &'static str,
        store: &RecipeStore,
    ) -> Result<Recipe, PipelineError> {
        store
            .current()
            .at(stage)?
            .ok_or_else(|| PipelineError::not_found(stage, "no recipe yet; draft one first"))
    }

    /// Drafts a fresh recipe. The first draft is v1; redrafting appends a
    /// new version after the current one.
    pub async fn draft_recipe(&self, job_id: &str) -> Result<Recipe, PipelineError> {
        const STAGE: &str = "draft_recipe";
        timed(STAGE, async {
            let job = self.existing_job(STAGE, job_id)?;
            let model = self.data_model(STAGE, &job)?;
            let style = self.style(STAGE, &job)?;
            let store = RecipeStore::new(job.clone());
            let ledger = UsageLedger::new();

            let mut drafted = recipe::draft(self.ai.as_ref(), &style, &model, &ledger)
                .await
                .at(STAGE)?;
            if let Some(current) = store.current().at(STAGE)? {
                drafted.version = current.version + 1;
            }
            store.create(&drafted).at(STAGE)?;
            info!(
                target = "listing.recipe",
                job_id = %job.id(),
                version = drafted.version,
                calls = ledger.snapshot().calls,
                "recipe_drafted"
            );
            Ok(drafted)
        })
        .await
    }

    /// Grades the current recipe on sample items and records the results on
    /// that version.
    pub async fn test_recipe(
        &self,
        job_id: &str,
        request: TestRequest,
    ) -> Result<TestResponse, PipelineError> {
        const STAGE: &str = "test_recipe";
        timed(STAGE, async {
            let job = self.existing_job(STAGE, job_id)?;
            let store = RecipeStore::new(job.clone());
            let current = self.current_recipe(STAGE, &store)?;
            if current.approved {
                return Err(RecipeError::Locked(current.version)).at(STAGE);
            }
            let model = self.data_model(STAGE, &job)?;
            let style = self.style(STAGE, &job)?;
            let samples = pick_samples(&model.items, &request.sample_ids).at(STAGE)?;
            let ledger = UsageLedger::new();

            let results = RecipeTester::new(self.ai.as_ref(), &self.executor, &ledger)
                .test(&current, &samples, &style, &job)
                .await
                .at(STAGE)?;
            let recipe = store.record_tests(current.version, results).at(STAGE)?;
            let avg_score = recipe.average_score();
            info!(
                target = "listing.recipe",
                job_id = %job.id(),
                version = recipe.version,
                samples = samples.len(),
                score = ?avg_score,
                "recipe_tested"
            );
            Ok(TestResponse {
                cost_estimate: ledger.project(samples.len(), model.items.len()),
                usage: ledger.summary(),
                avg_score,
                recipe,
            })
        })
        .await
    }

    /// New version from seller feedback, or from the last test run's issues
    /// when no feedback is given.
    pub async fn refine_recipe(
        &self,
        job_id: &str,
        request: RefineRequest,
    ) -> Result<Recipe, PipelineError> {
        const STAGE: &str = "refine_recipe";
        timed(STAGE, async {
            let job = self.existing_job(STAGE, job_id)?;
            let store = RecipeStore::new(job.clone());
            let current = self.current_recipe(STAGE, &store)?;
            let style = self.style(STAGE, &job)?;

            let feedback = match request.feedback.filter(|text| !text.trim().is_empty()) {
                Some(text) => text,
                None if !current.test_results.is_empty() => {
                    build_auto_feedback(&current.test_results)
                }
                None => {
                    return Err(PipelineError::invalid_input(
                        STAGE,
                        "feedback is required until the recipe has been tested",
                    ));
                }
            };
            let ledger = UsageLedger::new();
            let next = recipe::refine(self.ai.as_ref(), &current, &style, &feedback, &ledger)
                .await
                .at(STAGE)?;
            store.create(&next).at(STAGE)?;
            info!(
                target = "listing.recipe",
                job_id = %job.id(),
                from = current.version,
                to = next.version,
                "recipe_refined"
            );
            Ok(next)
        })
        .await
    }

    pub async fn auto_refine(
        &self,
        job_id: &str,
        request: TestRequest,
    ) -> Result<AutoRefineResponse, PipelineError> {
        const STAGE: &str = "auto_refine";
        timed(STAGE, async {
            let job = self.existing_job(STAGE, job_id)?;
            let store = RecipeStore::new(job.clone());
            let current = self.current_recipe(STAGE, &store)?;
            let model = self.data_model(STAGE, &job)?;
            let style = self.style(STAGE, &job)?;
            let samples = pick_samples(&model.items, &request.sample_ids).at(STAGE)?;
            let ledger = UsageLedger::new();

            let refiner = AutoRefiner {
                ai: self.ai.as_ref(),
                tester: RecipeTester::new(self.ai.as_ref(), &self.executor, &ledger),
                store: &store,
                ledger: &ledger,
                max_rounds: self.settings.auto_refine_rounds,
                threshold: self.settings.auto_refine_threshold,
            };
            let outcome = refiner.run(current, &samples, &style, &job).await.at(STAGE)?;
            Ok(AutoRefineResponse {
                outcome,
                usage: ledger.summary(),
            })
        })
        .await
    }

    pub fn approve_recipe(&self, job_id: &str) -> Result<Recipe, PipelineError> {
        const STAGE: &str = "approve_recipe";
        let job = self.existing_job(STAGE, job_id)?;
        RecipeStore::new(job)
            .approve()
            .at(STAGE)?
            .ok_or_else(|| PipelineError::not_found(STAGE, "no recipe to approve"))
    }

    pub fn recipe_history(&self, job_id: &str) -> Result<Vec<RecipeSummary>, PipelineError> {
        const STAGE: &str = "recipe_history";
        let job = self.existing_job(STAGE, job_id)?;
        RecipeStore::new(job).history().at(STAGE)
    }

    /// Everything a batch needs, checked up front so a bad request is refused
    /// before it is queued.
    pub fn prepare_batch(&self, job_id: &str, scope: RerunScope) -> Result<BatchRun, PipelineError> {
        const STAGE: &str = "execute_batch";
        let job = self.existing_job(STAGE, job_id)?;
        let recipe = self.current_recipe(STAGE, &RecipeStore::new(job.clone()))?;
        if !recipe.approved {
            return Err(BatchError::NotApproved(recipe.version)).at(STAGE);
        }
        let model = self.data_model(STAGE, &job)?;
        if let RerunScope::Ids { ids } = &scope {
            let unknown: Vec<String> = ids
                .iter()
                .filter(|id| model.item(id).is_none())
                .cloned()
                .collect();
            if !unknown.is_empty() {
                return Err(BatchError::UnknownIds(unknown)).at(STAGE);
            }
        }
        Ok(BatchRun {
            style: self.style(STAGE, &job)?,
            items: model.items,
            job,
            recipe,
            scope,
        })
    }

    pub async fn run_batch(
        &self,
        run: BatchRun,
        hub: &ProgressHub,
        control: Arc<BatchControl>,
    ) -> Result<BatchReport, PipelineError> {
        const STAGE: &str = "execute_batch";
        timed(STAGE, async {
            BatchEngine::new(
                self.ai.clone(),
                self.executor.clone(),
                self.settings.batch_concurrency,
            )
            .with_semantic_judge(self.settings.semantic_judge_in_batch)
            .execute(run, hub, control)
            .await
            .at(STAGE)
        })
        .await
    }

    pub fn batch_report(&self, job_id: &str) -> Result<Option<BatchReport>, PipelineError> {
        const STAGE: &str = "batch_report";
        let job = self.existing_job(STAGE, job_id)?;
        ResultStore::new(&job).report().at(STAGE)
    }
}

/// Explicit ids when given, otherwise a diverse pick.
fn pick_samples<'a>(
    items: &'a [CatalogItem],
    ids: &[String],
) -> Result<Vec<&'a CatalogItem>, RecipeError> {
    if items.is_empty() {
        return Err(RecipeError::NoItems);
    }
    if ids.is_empty() {
        return Ok(select_diverse_samples(items, SAMPLE_COUNT, &mut rand::rng()));
    }
    let unknown: Vec<String> = ids
        .iter()
        .filter(|id| !items.iter().any(|item| item.id == **id))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(RecipeError::UnknownSamples(unknown));
    }
    Ok(ids
        .iter()
        .filter_map(|id| items.iter().find(|item| item.id == *id))
        .collect())
}

async fn timed<T, Fut>(stage: &'static str, fut: Fut) -> Result<T, PipelineError>
where
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let started = Instant::now();
    let outcome = fut.await;
    crate::metrics::stage_elapsed(stage, started.elapsed().as_millis());
    outcome
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    QuotaExhausted,
    Internal,
}

impl PipelineError {
    pub fn new(stage: &'static str, kind: PipelineErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::InvalidInput, message)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::NotFound, message)
    }

    pub fn conflict(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Conflict, message)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Internal, message)
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

/// How a module error surfaces to callers of the pipeline.
pub trait Classify: std::fmt::Display {
    fn kind(&self) -> PipelineErrorKind;
}

impl Classify for AiError {
    fn kind(&self) -> PipelineErrorKind {
        match self {
            AiError::QuotaExhausted(_) => PipelineErrorKind::QuotaExhausted,
            _ => PipelineErrorKind::Internal,
        }
    }
}

impl Classify for StoreError {
    fn kind(&self) -> PipelineErrorKind {
        match self {
            StoreError::InvalidJobId(_) => PipelineErrorKind::InvalidInput,
            StoreError::Exists(_) => PipelineErrorKind::Conflict,
            StoreError::Io { .. } | StoreError::Json { .. } => PipelineErrorKind::Internal,
        }
    }
}

impl Classify for SourceError {
    fn kind(&self) -> PipelineErrorKind {
        PipelineErrorKind::InvalidInput
    }
}

impl Classify for ExtractionError {
    fn kind(&self) -> PipelineErrorKind {
        match self {
            ExtractionError::Ai(err) => err.kind(),
            ExtractionError::Store(err) => err.kind(),
            ExtractionError::NoProgram(_)
            | ExtractionError::Unreadable(_)
            | ExtractionError::Exhausted { .. } => {
                PipelineErrorKind::Internal
            }
        }
    }
}

impl Classify for InterviewError {
    fn kind(&self) -> PipelineErrorKind {
        match self {
            InterviewError::MessageRequired => PipelineErrorKind::InvalidInput,
            InterviewError::Ai(err) => err.kind(),
            InterviewError::Store(err) => err.kind(),
        }
    }
}

impl Classify for RecipeError {
    fn kind(&self) -> PipelineErrorKind {
        match self {
            RecipeError::Ai(err) => err.kind(),
            RecipeError::Store(err) => err.kind(),
            RecipeError::Locked(_) => PipelineErrorKind::Conflict,
            RecipeError::MissingVersion(_) => PipelineErrorKind::NotFound,
            RecipeError::NoItems | RecipeError::UnknownSamples(_) => {
                PipelineErrorKind::InvalidInput
            }
        }
    }
}

impl Classify for BatchError {
    fn kind(&self) -> PipelineErrorKind {
        match self {
            BatchError::NotApproved(_) => PipelineErrorKind::Conflict,
            BatchError::UnknownIds(_) => PipelineErrorKind::InvalidInput,
            BatchError::Store(err) => err.kind(),
        }
    }
}

/// Tags a module error with the pipeline stage it happened in.
pub trait AtStage<T> {
    fn at(self, stage: &'static str) -> Result<T, PipelineError>;
}

impl<T, E: Classify> AtStage<T> for Result<T, E> {
    fn at(self, stage: &'static str) -> Result<T, PipelineError> {
        self.map_err(|err| PipelineError::new(stage, err.kind(), err.to_string()))
    }
}
