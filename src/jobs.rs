use crate::{
    batch::{BatchControl, BatchRun, ProgressHub},
    models::{BatchReport, ProgressEvent},
    pipeline::{Pipeline, PipelineError},
};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};
use tokio::{
    sync::{Mutex, broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Finished batches whose outcome stays queryable from memory. Older ones
/// are answered from the report on disk.
pub const FINISHED_STATUS_LIMIT: usize = 256;

/// Background runner for batch jobs. Jobs run one at a time in arrival
/// order; each batch fans out internally.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    pipeline: Pipeline,
    board: Arc<Mutex<StatusBoard>>,
    controls: Arc<Mutex<HashMap<String, Arc<BatchControl>>>>,
    hubs: Arc<std::sync::Mutex<HashMap<String, ProgressHub>>>,
}

struct Job {
    id: String,
    run: BatchRun,
    control: Arc<BatchControl>,
    hub: ProgressHub,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { report: BatchReport },
    Failed { error: String, stage: Option<String> },
}

impl JobState {
    fn is_active(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

/// Job states, with finished ones evicted oldest first past the limit.
#[derive(Default)]
struct StatusBoard {
    states: HashMap<String, JobState>,
    finished: VecDeque<String>,
}

impl StatusBoard {
    fn set_active(&mut self, id: &str, state: JobState) {
        self.finished.retain(|done| done != id);
        self.states.insert(id.to_string(), state);
    }

    fn finish(&mut self, id: String, state: JobState) {
        self.finished.retain(|done| *done != id);
        self.finished.push_back(id.clone());
        self.states.insert(id, state);
        while self.finished.len() > FINISHED_STATUS_LIMIT {
            if let Some(oldest) = self.finished.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }

    fn forget(&mut self, id: &str) {
        self.states.remove(id);
    }

    fn active_ids(&self) -> HashSet<String> {
        self.states
            .iter()
            .filter(|(_, state)| state.is_active())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Drops hubs that nobody listens to and no batch will publish on.
fn prune_hubs(hubs: &std::sync::Mutex<HashMap<String, ProgressHub>>, active: &HashSet<String>) {
    let mut hubs = hubs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let before = hubs.len();
    hubs.retain(|id, hub| hub.subscribers() > 0 || active.contains(id));
    if hubs.len() < before {
        debug!(target = "listing.batch", released = before - hubs.len(), "progress_hubs_released");
    }
}

impl JobQueue {
    pub fn spawn(pipeline: Pipeline) -> (Self, JoinHandle<()>) {
        let capacity = pipeline.settings().queue_capacity;
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let board = Arc::new(Mutex::new(StatusBoard::default()));
        let controls = Arc::new(Mutex::new(HashMap::new()));
        let hubs = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let board_bg = board.clone();
        let controls_bg = controls.clone();
        let hubs_bg = hubs.clone();
        let worker = pipeline.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                board_bg.lock().await.set_active(&job.id, JobState::Running);
                info!(target = "listing.batch", job_id = %job.id, "batch_job_started");

                let result = worker.run_batch(job.run, &job.hub, job.control).await;
                drop(job.hub);
                controls_bg.lock().await.remove(&job.id);
                let state = match result {
                    Ok(report) => JobState::Completed { report },
                    Err(err) => {
                        warn!(target = "listing.batch", job_id = %job.id, error = %err, "batch_job_failed");
                        JobState::Failed {
                            error: err.detail().to_string(),
                            stage: Some(err.stage().to_string()),
                        }
                    }
                };
                let mut board = board_bg.lock().await;
                board.finish(job.id, state);
                prune_hubs(&hubs_bg, &board.active_ids());
            }
        });

        (
            Self {
                tx,
                pipeline,
                board,
                controls,
                hubs,
            },
            handle,
        )
    }

    /// Queues a prepared batch. A job whose batch is already queued or
    /// running is refused.
    pub async fn enqueue(&self, run: BatchRun) -> Result<JobInfo, PipelineError> {
        let id = run.job.id().to_string();
        let control = Arc::new(BatchControl::new());
        {
            let mut board = self.board.lock().await;
            if board.states.get(&id).is_some_and(JobState::is_active) {
                return Err(PipelineError::conflict(
                    "execute_batch",
                    format!("a batch for job {id} is already queued or running"),
                ));
            }
            board.set_active(&id, JobState::Queued);
        }
        self.controls.lock().await.insert(id.clone(), control.clone());

        let job = Job {
            id: id.clone(),
            run,
            control,
            hub: self.hub(&id),
        };
        if self.tx.send(job).await.is_err() {
            let mut board = self.board.lock().await;
            board.forget(&id);
            self.controls.lock().await.remove(&id);
            prune_hubs(&self.hubs, &board.active_ids());
            return Err(PipelineError::internal(
                "execute_batch",
                "batch worker is not available",
            ));
        }
        Ok(JobInfo {
            id,
            state: JobState::Queued,
        })
    }

    /// Asks a queued or running batch to stop. Returns false when there is
    /// nothing to cancel.
    pub async fn cancel(&self, id: &str) -> bool {
        match self.controls.lock().await.get(id) {
            Some(control) => {
                control.cancel();
                info!(target = "listing.batch", job_id = %id, "batch_cancel_requested");
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: &str) -> Option<JobInfo> {
        let board = self.board.lock().await;
        board.states.get(id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }

    /// Listens to a job's progress, before or during its batch. None when
    /// the job is neither tracked here nor present on disk.
    pub async fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<ProgressEvent>> {
        let board = self.board.lock().await;
        prune_hubs(&self.hubs, &board.active_ids());
        if !board.states.contains_key(id) && !self.pipeline.job_exists(id) {
            return None;
        }
        Some(self.hub(id).subscribe())
    }

    fn hub(&self, id: &str) -> ProgressHub {
        let mut hubs = self
            .hubs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        hubs.entry(id.to_string()).or_default().clone()
    }
}
