use std::{env, path::PathBuf, time::Duration};

/// Runtime settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub port: u16,
    pub request_max_bytes: usize,
    pub gemini: GeminiSettings,
    pub retry: RetrySettings,
    pub sandbox: SandboxSettings,
    pub batch_concurrency: usize,
    pub extraction_max_rounds: usize,
    pub auto_refine_rounds: usize,
    pub auto_refine_threshold: f64,
    pub queue_capacity: usize,
    pub semantic_judge_in_batch: bool,
}

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub batch_model: String,
    pub reasoning_model: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub python: String,
    pub timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Self {
        let batch_model =
            env::var("BATCH_MODEL").unwrap_or_else(|_| "gemini-3-flash-preview".to_string());
        let use_pro = env::var("USE_PRO")
            .map(|value| {
                matches!(
                    value.trim().to_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(true);
        let reasoning_model = env::var("REASONING_MODEL").unwrap_or_else(|_| {
            if use_pro {
                "gemini-3-pro-preview".to_string()
            } else {
                batch_model.clone()
            }
        });

        Self {
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            port: env_parse("PORT").unwrap_or(8000),
            request_max_bytes: positive("REQUEST_MAX_BYTES").unwrap_or(8 * 1024 * 1024),
            gemini: GeminiSettings {
                api_key: env::var("GEMINI_API_KEY")
                    .ok()
                    .filter(|key| !key.trim().is_empty()),
                base_url: env::var("GEMINI_BASE_URL").unwrap_or_else(|_| {
                    "https://generativelanguage.googleapis.com/v1beta".to_string()
                }),
                batch_model,
                reasoning_model,
            },
            retry: RetrySettings {
                max_retries: env_parse("AI_MAX_RETRIES").unwrap_or(3),
                initial_backoff: Duration::from_millis(
                    positive("AI_INITIAL_BACKOFF_MS").unwrap_or(2000) as u64,
                ),
            },
            sandbox: SandboxSettings {
                python: env::var("SANDBOX_PYTHON").unwrap_or_else(|_| "python3".to_string()),
                timeout: Duration::from_secs(positive("SANDBOX_TIMEOUT_SECS").unwrap_or(60) as u64),
            },
            batch_concurrency: positive("BATCH_CONCURRENCY").unwrap_or(5),
            extraction_max_rounds: positive("EXTRACTION_MAX_ROUNDS").unwrap_or(3),
            auto_refine_rounds: positive("AUTO_REFINE_ROUNDS").unwrap_or(3),
            auto_refine_threshold: env_parse::<f64>("AUTO_REFINE_THRESHOLD")
                .filter(|value| (0.0..=100.0).contains(value))
                .unwrap_or(90.0),
            queue_capacity: positive("QUEUE_CAPACITY").unwrap_or(64),
            semantic_judge_in_batch: parse_env_bool("SEMANTIC_JUDGE_IN_BATCH"),
        }
    }
}

#[cfg(test)]
impl Settings {
    /// Small, fast settings rooted at `data_dir`, independent of the environment.
    pub fn for_tests(data_dir: &std::path::Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            port: 0,
            request_max_bytes: 1024 * 1024,
            gemini: GeminiSettings {
                api_key: None,
                base_url: "http://127.0.0.1:9".into(),
                batch_model: "batch".into(),
                reasoning_model: "reasoning".into(),
            },
            retry: RetrySettings {
                max_retries: 0,
                initial_backoff: Duration::from_millis(1),
            },
            sandbox: SandboxSettings {
                python: "python3".into(),
                timeout: Duration::from_secs(5),
            },
            batch_concurrency: 2,
            extraction_max_rounds: 2,
            auto_refine_rounds: 2,
            auto_refine_threshold: 90.0,
            queue_capacity: 4,
            semantic_judge_in_batch: false,
        }
    }
}

pub fn parse_env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse::<T>().ok())
}

fn positive(key: &str) -> Option<usize> {
    env_parse::<usize>(key).filter(|value| *value > 0)
}
