use crate::pipeline::task_runner::Task;
use crate::pipeline::{SubmitOutcome, VectorizeStatus};
use crate::requirements::{AuditStatus, RequirementStore};
use crate::relations::RelationStore;

use super::{create_requirement, harness, wait_until_settled};

#[test]
fn vectorize_twice_is_idempotent() {
    let h = harness(2);

    let a = create_requirement(&h.requirements, "email login", "login via email");
    h.embedder.set("login via email", vec![1.0, 0.0]);

    let first = h.pipeline.vectorize_one(a);
    assert_eq!(first.status, VectorizeStatus::Vectorized);
    assert_eq!(h.vectors.count().unwrap(), 1);
    assert!(h.requirements.get(a).unwrap().unwrap().is_vectorized);

    let second = h.pipeline.vectorize_one(a);
    assert_eq!(second.status, VectorizeStatus::Skipped);
    assert_eq!(h.vectors.count().unwrap(), 1);
}

#[test]
fn stale_flag_is_repaired_from_the_index() {
    let h = harness(2);

    let a = create_requirement(&h.requirements, "email login", "login via email");
    h.embedder.set("login via email", vec![1.0, 0.0]);

    assert_eq!(h.pipeline.vectorize_one(a).status, VectorizeStatus::Vectorized);

    // simulate a crash between the index write and the flag write
    h.requirements.set_vectorized(a, false).unwrap();

    let outcome = h.pipeline.vectorize_one(a);
    assert_eq!(outcome.status, VectorizeStatus::Skipped);
    assert!(h.requirements.get(a).unwrap().unwrap().is_vectorized);
    assert_eq!(h.vectors.count().unwrap(), 1);
}

#[test]
fn vectorize_by_document_only_picks_unvectorized_rows() {
    let h = harness(2);

    let a = create_requirement(&h.requirements, "email login", "login via email");
    let b = create_requirement(&h.requirements, "username login", "login via username");
    h.embedder.set("login via email", vec![1.0, 0.0]);
    h.embedder.set("login via username", vec![0.9, 0.1]);

    let outcome = h.pipeline.vectorize_by_document(1).unwrap();
    assert_eq!(outcome.succeeded(), vec![a, b]);
    assert_eq!(h.vectors.count().unwrap(), 2);

    // everything is vectorized now, so a rerun finds nothing to do
    let outcome = h.pipeline.vectorize_by_document(1).unwrap();
    assert!(outcome.outcomes.is_empty());
}

#[test]
fn revectorize_overwrites_the_stored_vector() {
    let h = harness(2);

    let a = create_requirement(&h.requirements, "email login", "login via email");
    h.embedder.set("login via email", vec![1.0, 0.0]);
    h.pipeline.vectorize_one(a);

    h.embedder.set("login via email", vec![0.0, 1.0]);
    h.pipeline.revectorize(a).unwrap();

    assert_eq!(h.vectors.count().unwrap(), 1);
    let hits = h.vectors.search(&[0.0, 1.0], 0.5, 1).unwrap();
    assert_eq!(hits[0].id, a);
    assert!((hits[0].score - 1.0).abs() < 1e-6);
}

#[test]
fn submit_rejects_empty_batch() {
    let h = harness(2);

    let outcome = h.pipeline.submit_for_vectorization(&[]);
    assert!(matches!(outcome, SubmitOutcome::Rejected { .. }));
}

#[test]
fn submit_rejects_whole_batch_when_one_id_is_not_pending() {
    let h = harness(2);

    let a = create_requirement(&h.requirements, "a", "alpha");
    let b = create_requirement(&h.requirements, "b", "beta");
    h.requirements
        .transition_all(&[b], AuditStatus::Pending, AuditStatus::InFlight)
        .unwrap();

    let outcome = h.pipeline.submit_for_vectorization(&[a, b]);
    match outcome {
        SubmitOutcome::Rejected { reason } => assert!(reason.contains("in_flight")),
        other => panic!("expected rejection, got {other:?}"),
    }

    // the atomic flip left a untouched
    assert_eq!(h.requirements.get(a).unwrap().unwrap().status, AuditStatus::Pending);
}

#[test]
fn submit_without_running_queue_reverts_the_flip() {
    let h = harness(2);

    let a = create_requirement(&h.requirements, "a", "alpha");

    let outcome = h.pipeline.submit_for_vectorization(&[a]);
    assert!(matches!(outcome, SubmitOutcome::Rejected { .. }));
    assert_eq!(h.requirements.get(a).unwrap().unwrap().status, AuditStatus::Pending);
}

#[test]
fn partial_batch_commits_successes_and_releases_failures() {
    let mut h = harness(2);

    let a = create_requirement(&h.requirements, "email login", "login via email");
    let b = create_requirement(&h.requirements, "broken", "unembeddable content");
    let c = create_requirement(&h.requirements, "username login", "login via username");

    h.embedder.set("login via email", vec![1.0, 0.0]);
    h.embedder.set("login via username", vec![0.9, 0.1]);
    h.embedder.fail_on("unembeddable content");

    // c is already vectorized so relation building over [a] can find it
    assert_eq!(h.pipeline.vectorize_one(c).status, VectorizeStatus::Vectorized);

    h.pipeline.run_queue();

    let outcome = h.pipeline.submit_for_vectorization(&[a, b]);
    assert!(matches!(outcome, SubmitOutcome::Accepted { .. }));
    wait_until_settled(&h.requirements, &[a, b]);

    let row_a = h.requirements.get(a).unwrap().unwrap();
    assert_eq!(row_a.status, AuditStatus::Confirmed);
    assert!(row_a.is_vectorized);

    let row_b = h.requirements.get(b).unwrap().unwrap();
    assert_eq!(row_b.status, AuditStatus::Pending);
    assert!(!row_b.is_vectorized);

    // relations were built over the successful subset only
    assert!(h.relations.exists(a, c).unwrap());
    assert!(h.relations.exists(c, a).unwrap());
    assert!(h.relations.list_for(b).unwrap().is_empty());

    h.pipeline.shutdown();
    h.pipeline.wait_queue_finish();
}

#[test]
fn confirmed_ids_cannot_be_resubmitted() {
    let mut h = harness(2);

    let a = create_requirement(&h.requirements, "email login", "login via email");
    h.embedder.set("login via email", vec![1.0, 0.0]);

    h.pipeline.run_queue();

    assert!(matches!(
        h.pipeline.submit_for_vectorization(&[a]),
        SubmitOutcome::Accepted { .. }
    ));
    wait_until_settled(&h.requirements, &[a]);
    assert_eq!(h.requirements.get(a).unwrap().unwrap().status, AuditStatus::Confirmed);

    // a confirmed id cannot be resubmitted
    let outcome = h.pipeline.submit_for_vectorization(&[a]);
    assert!(matches!(outcome, SubmitOutcome::Rejected { .. }));
    assert_eq!(h.vectors.count().unwrap(), 1);

    h.pipeline.shutdown();
    h.pipeline.wait_queue_finish();
}

#[test]
fn failed_batch_rolls_back_in_flight_ids() {
    let h = harness(2);
    let core = h.pipeline.core();

    let a = create_requirement(&h.requirements, "a", "alpha");
    let b = create_requirement(&h.requirements, "b", "beta");
    h.requirements
        .transition_all(&[a, b], AuditStatus::Pending, AuditStatus::InFlight)
        .unwrap();

    // an earlier attempt already confirmed a
    h.requirements
        .transition_each(&[a], AuditStatus::InFlight, AuditStatus::Confirmed)
        .unwrap();

    let task = Task::VectorizeBatch {
        requirement_ids: vec![a, b],
    };
    task.rollback(&core);

    // per-id commit: only the id still in flight reverts
    assert_eq!(h.requirements.get(a).unwrap().unwrap().status, AuditStatus::Confirmed);
    assert_eq!(h.requirements.get(b).unwrap().unwrap().status, AuditStatus::Pending);
}
