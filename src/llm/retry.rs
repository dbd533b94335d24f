use super::{AiError, AiService, CodeRun, Effort, Generation, ImagePart};
use crate::config::RetrySettings;
use async_trait::async_trait;
use serde_json::Value;
use std::{future::Future, time::Duration};
use tracing::{error, warn};

/// Retries transient failures of the wrapped service with exponential
/// backoff. Quota exhaustion and every other error pass straight through.
pub struct Retrying<S> {
    inner: S,
    max_retries: u32,
    initial_backoff: Duration,
}

impl<S: AiService> Retrying<S> {
    pub fn new(inner: S, settings: RetrySettings) -> Self {
        Self {
            inner,
            max_retries: settings.max_retries,
            initial_backoff: settings.initial_backoff,
        }
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, AiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AiError>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.initial_backoff * 2u32.saturating_pow(attempt);
                    warn!(
                        target = "listing.llm",
                        operation,
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient_error_retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_quota() {
                        error!(target = "listing.llm", operation, error = %err, "quota_exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl<S: AiService> AiService for Retrying<S> {
    async fn generate_text(
        &self,
        prompt: &str,
        effort: Effort,
    ) -> Result<Generation<String>, AiError> {
        self.run("generate_text", || self.inner.generate_text(prompt, effort))
            .await
    }

    async fn generate_with_code(
        &self,
        prompt: &str,
        attachment: Option<&str>,
        effort: Effort,
    ) -> Result<Generation<CodeRun>, AiError> {
        self.run("generate_with_code", || {
            self.inner.generate_with_code(prompt, attachment, effort)
        })
        .await
    }

    async fn generate_with_images(
        &self,
        prompt: &str,
        images: &[ImagePart],
        effort: Effort,
    ) -> Result<Generation<String>, AiError> {
        self.run("generate_with_images", || {
            self.inner.generate_with_images(prompt, images, effort)
        })
        .await
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        images: &[ImagePart],
        schema: &Value,
        effort: Effort,
    ) -> Result<Generation<Value>, AiError> {
        self.run("generate_structured", || {
            self.inner.generate_structured(prompt, images, schema, effort)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{Scripted, ScriptedAi};

    fn fast() -> RetrySettings {
        RetrySettings {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let service = Retrying::new(
            ScriptedAi::new(vec![
                Scripted::Fail(AiError::Transient("503".into())),
                Scripted::Fail(AiError::Transient("429 slow down".into())),
                Scripted::Text("ok".into()),
            ]),
            fast(),
        );
        let out = service
            .generate_text("hi", Effort::Low)
            .await
            .expect("eventually ok");
        assert_eq!(out.value, "ok");
        assert_eq!(service.inner.call_count(), 3);
    }

    #[tokio::test]
    async fn quota_errors_are_never_retried() {
        let service = Retrying::new(
            ScriptedAi::new(vec![
                Scripted::Fail(AiError::QuotaExhausted("daily limit".into())),
                Scripted::Text("unreachable".into()),
            ]),
            fast(),
        );
        let err = service
            .generate_text("hi", Effort::Low)
            .await
            .expect_err("quota");
        assert!(err.is_quota());
        assert_eq!(service.inner.call_count(), 1);
    }

    #[tokio::test]
    async fn retries_stop_at_the_configured_bound() {
        let replies = (0..5)
            .map(|_| Scripted::Fail(AiError::Transient("500".into())))
            .collect();
        let service = Retrying::new(ScriptedAi::new(replies), fast());
        let err = service
            .generate_text("hi", Effort::Low)
            .await
            .expect_err("gives up");
        assert!(err.is_transient());
        assert_eq!(service.inner.call_count(), 4);
    }
}
