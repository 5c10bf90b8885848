//! Fan-out properties of the batch embedder, exercised against the
//! instrumented in-process fixture backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use batchvec::batch::{BatchEmbedder, BatchPhase};
use batchvec::embedder::{EmbeddingProcessor, EmbeddingSource, FixtureBackend};
use batchvec::error::EmbedError;
use batchvec::record::Record;

fn job_set(n: usize) -> Vec<Record> {
    (0..n).map(|i| Record::new(format!("document {i}"))).collect()
}

fn fixture_embedder(backend: FixtureBackend, max_in_flight: usize) -> BatchEmbedder {
    let processor = Arc::new(EmbeddingProcessor::new(EmbeddingSource::Fixture(backend)));
    BatchEmbedder::new(processor, max_in_flight)
}

#[tokio::test]
async fn in_flight_requests_never_exceed_the_limit() {
    let backend = FixtureBackend::new(8).with_delay(Duration::from_millis(5));
    let embedder = fixture_embedder(backend, 5);

    let outcome = embedder.run(job_set(40), None).await;

    assert_eq!(outcome.succeeded(), 40);
    let gauge = embedder.processor().fixture().unwrap().max_in_flight_seen();
    assert!(gauge <= 5, "observed {gauge} concurrent calls with limit 5");
}

#[tokio::test]
async fn limit_of_one_serializes_requests() {
    let backend = FixtureBackend::new(4).with_delay(Duration::from_millis(1));
    let embedder = fixture_embedder(backend, 1);

    let outcome = embedder.run(job_set(10), None).await;

    assert_eq!(outcome.succeeded(), 10);
    assert_eq!(embedder.processor().fixture().unwrap().max_in_flight_seen(), 1);
}

#[tokio::test]
async fn wall_time_is_bounded_by_concurrency_not_serial_dispatch() {
    let backend = FixtureBackend::new(8).with_delay(Duration::from_millis(10));
    let embedder = fixture_embedder(backend, 5);

    let start = Instant::now();
    let outcome = embedder.run(job_set(100), None).await;
    let elapsed = start.elapsed();

    assert_eq!(outcome.succeeded(), 100);
    assert!(outcome.is_complete());
    // 100 requests of >= 10ms through 5 slots cannot finish faster than
    // ceil(100/5) * 10ms.
    assert!(elapsed >= Duration::from_millis(190), "finished in {elapsed:?}");
    // Serial dispatch would take ~1s; leave wide slack for slow CI.
    assert!(elapsed < Duration::from_millis(700), "took {elapsed:?}");
}

#[tokio::test]
async fn attached_embeddings_have_the_declared_dimensionality() {
    let embedder = fixture_embedder(FixtureBackend::new(768), 4);
    let outcome = embedder.run(job_set(12), None).await;

    assert!(outcome.is_complete());
    for record in &outcome.records {
        assert_eq!(record.embedding.as_ref().unwrap().len(), 768);
    }
}

#[tokio::test]
async fn failing_every_fifth_request_isolates_twenty_failures() {
    let backend = FixtureBackend::new(8).with_fail_every(5);
    let embedder = fixture_embedder(backend, 5);

    let outcome = embedder.run(job_set(100), None).await;

    assert_eq!(outcome.succeeded(), 80);
    assert_eq!(outcome.failed(), 20);
    assert_eq!(outcome.records.len(), 100);
    for failure in &outcome.failures {
        assert!(matches!(failure.error, EmbedError::Http { status: 500, .. }));
        assert!(!outcome.records[failure.index].is_embedded());
    }
}

#[tokio::test]
async fn reruns_attach_identical_vectors() {
    let embedder_a = fixture_embedder(FixtureBackend::new(32), 4);
    let embedder_b = fixture_embedder(FixtureBackend::new(32), 4);
    let (first, second) = futures::future::join(
        embedder_a.run(job_set(20), None),
        embedder_b.run(job_set(20), None),
    )
    .await;

    for (a, b) in first.records.iter().zip(&second.records) {
        assert_eq!(a.content, b.content);
        assert_eq!(a.embedding, b.embedding);
    }
}

#[tokio::test]
async fn resubmitting_the_failed_subset_completes_the_job_set() {
    let backend = FixtureBackend::new(8).with_fail_every(3);
    let embedder = fixture_embedder(backend, 4);
    let mut outcome = embedder.run(job_set(30), None).await;
    assert!(!outcome.is_complete());

    // Rerun only the failed subset against a healthy backend and merge.
    let retry_embedder = fixture_embedder(FixtureBackend::new(8), 4);
    let retry = retry_embedder.run(outcome.failed_records(), None).await;
    outcome.absorb_retry(retry);

    assert!(outcome.is_complete());
    assert_eq!(outcome.succeeded(), 30);
    for (i, record) in outcome.records.iter().enumerate() {
        assert_eq!(record.content, format!("document {i}"));
    }
}

#[tokio::test]
async fn oversized_input_fails_alone() {
    let backend = FixtureBackend::new(8).with_max_content_len(40);
    let embedder = fixture_embedder(backend, 4);

    let mut records = job_set(10);
    records[6].content = "x".repeat(500);
    let outcome = embedder.run(records, None).await;

    assert_eq!(outcome.succeeded(), 9);
    assert_eq!(outcome.failed(), 1);
    assert_eq!(outcome.failures[0].index, 6);
    assert!(matches!(
        outcome.failures[0].error,
        EmbedError::OversizedInput(_)
    ));
}

#[tokio::test]
async fn cancellation_stops_admission_and_keeps_finished_work() {
    let backend = FixtureBackend::new(8).with_delay(Duration::from_millis(50));
    let embedder = fixture_embedder(backend, 2);

    let cancel = embedder.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(75)).await;
        cancel.cancel();
    });

    let outcome = embedder.run(job_set(20), None).await;

    assert_eq!(outcome.records.len(), 20);
    let succeeded = outcome.succeeded();
    assert!(succeeded >= 1, "first wave should have finished");
    assert!(succeeded < 20, "cancel should have cut the run short");
    assert!(outcome
        .failures
        .iter()
        .all(|f| matches!(f.error, EmbedError::Cancelled(_))));
    assert_eq!(succeeded + outcome.failed(), 20);
}

#[tokio::test]
async fn panicked_task_keeps_failure_indices_aligned() {
    let backend = FixtureBackend::new(4).with_panic_on_call(3);
    // Serial admission so call order matches submission order.
    let embedder = fixture_embedder(backend, 1);

    let outcome = embedder.run(job_set(5), None).await;

    assert_eq!(outcome.records.len(), 5);
    assert_eq!(outcome.failed(), 1);
    assert_eq!(outcome.failures[0].index, 2);
    assert!(matches!(
        outcome.failures[0].error,
        EmbedError::Internal(_)
    ));
    assert!(!outcome.records[2].is_embedded());
    for i in [0usize, 1, 3, 4] {
        assert_eq!(outcome.records[i].content, format!("document {i}"));
        assert!(outcome.records[i].is_embedded());
    }
}

#[tokio::test]
async fn progress_is_published_as_requests_finish() {
    let embedder = fixture_embedder(
        FixtureBackend::new(4).with_delay(Duration::from_millis(2)),
        3,
    );
    let (tx, mut rx) = broadcast::channel(64);

    let outcome = embedder.run(job_set(10), Some(tx)).await;
    assert!(outcome.is_complete());

    let mut last_processed = 0;
    let mut final_phase = BatchPhase::Running;
    while let Ok(status) = rx.try_recv() {
        assert!(status.processed >= last_processed, "progress went backwards");
        assert_eq!(status.total, 10);
        last_processed = status.processed;
        final_phase = status.phase;
    }
    assert_eq!(last_processed, 10);
    assert_eq!(final_phase, BatchPhase::Completed);
}
