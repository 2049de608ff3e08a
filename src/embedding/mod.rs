//! Batched embedding pipeline with per-batch retry and sibling isolation.
//!
//! Chunk texts are grouped into batches of at most `batch_size` and sent to
//! the [`EmbeddingEngine`] adapter. Each batch retries independently with
//! exponential backoff; a batch that fails permanently surfaces its error
//! without failing its siblings — the ingestion coordinator decides what a
//! partial failure means for the document.

pub mod vector;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapters::EmbeddingEngine;
use crate::backoff::backoff_delay;
use crate::config::EmbeddingConfig;
use crate::errors::ServiceError;

/// Outcome of one batch: either the unit-normalised vectors for every text
/// in the batch (input order), or the classified error that exhausted it.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Index of the batch's first text within the full input slice.
    pub start: usize,
    /// Number of texts in the batch.
    pub len: usize,
    /// Retries spent before the final outcome.
    pub retries: u32,
    pub result: Result<Vec<Vec<f32>>, ServiceError>,
}

/// Batched vectorisation front-end over an [`EmbeddingEngine`].
pub struct EmbeddingPipeline {
    engine: Arc<dyn EmbeddingEngine>,
    config: EmbeddingConfig,
}

impl EmbeddingPipeline {
    pub fn new(engine: Arc<dyn EmbeddingEngine>, config: EmbeddingConfig) -> Self {
        Self { engine, config }
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Embed every text, batch by batch. Batches run sequentially (the
    /// upstream engine does its own internal parallelism); one failed batch
    /// never poisons another.
    pub async fn embed_all(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchOutcome>, ServiceError> {
        let mut outcomes = Vec::with_capacity(texts.len().div_ceil(self.config.batch_size.max(1)));
        for (batch_index, batch) in texts.chunks(self.config.batch_size.max(1)).enumerate() {
            if cancel.is_cancelled() {
                return Err(ServiceError::Cancelled("embedding aborted".into()));
            }
            let start = batch_index * self.config.batch_size.max(1);
            let (result, retries) = self.embed_batch(batch, cancel).await;
            if let Err(err) = &result {
                if err.is_cancelled() {
                    return Err(ServiceError::Cancelled("embedding aborted".into()));
                }
                warn!(
                    batch = batch_index,
                    retries,
                    error = %err,
                    "embedding batch failed permanently"
                );
            }
            outcomes.push(BatchOutcome {
                start,
                len: batch.len(),
                retries,
                result,
            });
        }
        Ok(outcomes)
    }

    /// Embed a single text (queries use batch size 1).
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let cancel = CancellationToken::new();
        let texts = [text.to_string()];
        let (result, _) = self.embed_batch(&texts, &cancel).await;
        let mut vectors = result?;
        vectors.pop().ok_or_else(|| {
            ServiceError::PermanentUpstream {
                stage: "embedding",
                message: "engine returned no vector for a single-text batch".into(),
            }
        })
    }

    /// One batch with internal retry. Returns the final result and the number
    /// of retries spent.
    async fn embed_batch(
        &self,
        batch: &[String],
        cancel: &CancellationToken,
    ) -> (Result<Vec<Vec<f32>>, ServiceError>, u32) {
        let mut attempt = 0u32;
        loop {
            let call = tokio::time::timeout(self.config.batch_timeout, self.engine.embed(batch));
            let result = tokio::select! {
                () = cancel.cancelled() => {
                    return (Err(ServiceError::Cancelled("embedding aborted".into())), attempt);
                }
                outcome = call => match outcome {
                    Ok(inner) => inner,
                    Err(_) => Err(ServiceError::TransientUpstream {
                        stage: "embedding",
                        message: format!(
                            "batch timed out after {}s",
                            self.config.batch_timeout.as_secs()
                        ),
                    }),
                },
            };

            match result {
                Ok(vectors) => {
                    return (self.validate_batch(batch.len(), vectors), attempt);
                }
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    let delay = backoff_delay(self.config.retry_delay, attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying embedding batch");
                    attempt += 1;
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return (
                                Err(ServiceError::Cancelled("embedding aborted".into())),
                                attempt,
                            );
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return (Err(err), attempt),
            }
        }
    }

    /// Check cardinality, then validate and unit-normalise every vector.
    fn validate_batch(
        &self,
        expected: usize,
        vectors: Vec<Vec<f32>>,
    ) -> Result<Vec<Vec<f32>>, ServiceError> {
        if vectors.len() != expected {
            return Err(ServiceError::PermanentUpstream {
                stage: "embedding",
                message: format!(
                    "engine returned {} vectors for {} texts",
                    vectors.len(),
                    expected
                ),
            });
        }
        vectors
            .into_iter()
            .map(|v| vector::validate_and_normalize(v, self.config.dimension))
            .collect()
    }
}
