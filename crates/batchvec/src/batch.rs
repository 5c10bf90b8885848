use std::sync::Arc;

use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::instrument;

use crate::cancel_token::CancelToken;
use crate::embedder::EmbeddingProcessor;
use crate::error::EmbedError;
use crate::record::{JobOutcome, Record, RecordFailure};

/// Progress snapshot published as requests finish.
#[derive(Debug, Clone)]
pub struct BatchStatus {
    pub phase: BatchPhase,
    pub processed: usize,
    pub total: usize,
    pub errors: Vec<String>,
}

impl BatchStatus {
    pub fn calc_progress(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.processed as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchPhase {
    Running,
    Completed,
    Cancelled,
}

type TaskResult = (usize, Record, Result<Vec<f32>, EmbedError>);

/// Bounded-concurrency fan-out over a job set.
///
/// At most `max_in_flight` requests are open at any instant: admission is a
/// counting semaphore permit acquired before each task is spawned and held
/// until its request completes. Each spawned task owns exactly one record
/// for the duration of its request; completion order is unconstrained and
/// results are re-associated with their originating record by index.
#[derive(Debug)]
pub struct BatchEmbedder {
    processor: Arc<EmbeddingProcessor>,
    in_flight: Arc<Semaphore>,
    cancel: CancelToken,
}

impl BatchEmbedder {
    pub fn new(processor: Arc<EmbeddingProcessor>, max_in_flight: usize) -> Self {
        Self {
            processor,
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn processor(&self) -> &EmbeddingProcessor {
        &self.processor
    }

    /// Embed every record in the job set.
    ///
    /// Failures are isolated per record: the returned outcome pairs each
    /// failed record with its error and the batch never aborts because one
    /// document failed. On cancellation no further requests are admitted;
    /// records embedded before the cancel keep their vectors and the rest
    /// come back untouched with a `Cancelled` marker.
    #[instrument(skip_all, fields(total = records.len()), target = "embed-pipeline")]
    pub async fn run(
        &self,
        records: Vec<Record>,
        progress_tx: Option<broadcast::Sender<BatchStatus>>,
    ) -> JobOutcome {
        let total = records.len();
        let mut status = BatchStatus {
            phase: BatchPhase::Running,
            processed: 0,
            total,
            errors: Vec::new(),
        };
        if let Some(tx) = &progress_tx {
            let _ = tx.send(status.clone());
        }

        let mut slots: Vec<Option<Record>> = Vec::with_capacity(total);
        slots.resize_with(total, || None);
        let mut failures: Vec<RecordFailure> = Vec::new();
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();

        for (idx, record) in records.into_iter().enumerate() {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => None,
                permit = Arc::clone(&self.in_flight).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                // Cancelled before admission: the record comes back untouched.
                slots[idx] = Some(record);
                failures.push(RecordFailure {
                    index: idx,
                    error: EmbedError::Cancelled("batch cancelled before admission".into()),
                });
                continue;
            };

            let processor = Arc::clone(&self.processor);
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => {
                        Err(EmbedError::Cancelled("batch cancelled mid-flight".into()))
                    }
                    res = processor.embed_one(&record.content, Some(&cancel)) => res,
                };
                drop(permit);
                (idx, record, result)
            });

            // Drain whatever has already finished so progress flows while
            // admission is still underway.
            while let Some(joined) = tasks.try_join_next() {
                apply_completion(
                    joined,
                    &mut slots,
                    &mut failures,
                    &mut status,
                    progress_tx.as_ref(),
                );
            }
        }

        while let Some(joined) = tasks.join_next().await {
            apply_completion(
                joined,
                &mut slots,
                &mut failures,
                &mut status,
                progress_tx.as_ref(),
            );
        }

        // A panicked task drops its record. Keep its slot occupied so later
        // failure indices stay aligned with `records`.
        let records: Vec<Record> = slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    failures.push(RecordFailure {
                        index: idx,
                        error: EmbedError::Internal(format!(
                            "record {idx} lost to a panicked embedding task"
                        )),
                    });
                    Record::new(String::new())
                })
            })
            .collect();

        failures.sort_by_key(|f| f.index);
        status.phase = if self.cancel.is_cancelled() {
            BatchPhase::Cancelled
        } else {
            BatchPhase::Completed
        };
        if let Some(tx) = &progress_tx {
            let _ = tx.send(status.clone());
        }
        tracing::info!(
            target: "embed-pipeline",
            processed = status.processed,
            total,
            failed = failures.len(),
            phase = ?status.phase,
            "batch finished"
        );

        JobOutcome { records, failures }
    }
}

fn apply_completion(
    joined: Result<TaskResult, JoinError>,
    slots: &mut [Option<Record>],
    failures: &mut Vec<RecordFailure>,
    status: &mut BatchStatus,
    progress_tx: Option<&broadcast::Sender<BatchStatus>>,
) {
    match joined {
        Ok((idx, mut record, result)) => {
            match result {
                Ok(vector) => {
                    record.embedding = Some(vector);
                }
                Err(error) => {
                    tracing::warn!(
                        target: "embed-pipeline",
                        index = idx,
                        error = %error,
                        "record failed"
                    );
                    status.errors.push(format!("record {idx}: {error}"));
                    failures.push(RecordFailure { index: idx, error });
                }
            }
            slots[idx] = Some(record);
            status.processed += 1;
            tracing::debug!(
                target: "embed-pipeline",
                "embedded {}/{}",
                status.processed,
                status.total
            );
            if let Some(tx) = progress_tx {
                let _ = tx.send(status.clone());
            }
        }
        Err(join_err) => {
            // A panicked task drops its record; nothing to re-associate.
            tracing::error!(target: "embed-pipeline", error = %join_err, "embedding task panicked");
            status
                .errors
                .push(format!("embedding task panicked: {join_err}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_complete_fraction() {
        let status = BatchStatus {
            phase: BatchPhase::Running,
            processed: 25,
            total: 100,
            errors: Vec::new(),
        };
        assert!((status.calc_progress() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_batch_reports_full_progress() {
        let status = BatchStatus {
            phase: BatchPhase::Completed,
            processed: 0,
            total: 0,
            errors: Vec::new(),
        };
        assert!((status.calc_progress() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn empty_job_set_completes_immediately() {
        let processor = Arc::new(EmbeddingProcessor::new_fixture(4));
        let embedder = BatchEmbedder::new(processor, 4);
        let outcome = embedder.run(Vec::new(), None).await;
        assert!(outcome.records.is_empty());
        assert!(outcome.is_complete());
    }
}
