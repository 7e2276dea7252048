mod support;

use std::sync::Arc;

use attest_core::{
    EnrollError, EnrollOutcome, EnrollmentAggregator, Embedding, MatchScorer, ReadFailurePolicy,
    RejectionReason, DEFAULT_EMBEDDING_THRESHOLD, MAX_SHOTS,
};
use support::*;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    store: Arc<attest_core::EmbeddingStore>,
    faces: Arc<StubFaces>,
    enroller: EnrollmentAggregator,
    scorer: MatchScorer,
}

fn harness(read_failure: ReadFailurePolicy) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = store_at(&dir.path().join("embeddings_db.json"), read_failure);
    let faces = Arc::new(StubFaces::default());
    let enroller = EnrollmentAggregator::new(Arc::clone(&store), faces.clone());
    let scorer = MatchScorer::new(Arc::clone(&store), faces.clone(), DEFAULT_EMBEDDING_THRESHOLD);
    Harness {
        _dir: dir,
        store,
        faces,
        enroller,
        scorer,
    }
}

#[test]
fn enroll_three_shots_then_verify_same_and_different_face() {
    let h = harness(ReadFailurePolicy::TreatAsEmpty);

    for variant in 1..=3 {
        let outcome = h.enroller.enroll("alice", &photo(&[pose(ALICE, variant)])).unwrap();
        assert!(outcome.ok());
        assert_eq!(outcome, EnrollOutcome::Enrolled { shots: variant as usize });
    }
    assert_eq!(
        h.enroller.enroll("alice", &photo(&[pose(ALICE, 3)])).unwrap().message(),
        "User enrolled. shots=4"
    );

    let same = h.scorer.verify("alice", &photo(&[pose(ALICE, 5)])).unwrap();
    assert!(same.matched, "score = {}", same.score);
    assert!(same.score >= 0.55);
    assert_eq!(same.reason, None);

    let other = h.scorer.verify("alice", &photo(&[pose(BOB, 1)])).unwrap();
    assert!(!other.matched);
    assert!(other.score < 0.55, "score = {}", other.score);
    assert_eq!(other.reason, Some(RejectionReason::FaceMismatch));
}

#[test]
fn history_keeps_five_most_recent_shots_and_consistent_centroid() {
    let h = harness(ReadFailurePolicy::TreatAsEmpty);
    for variant in 1..=7 {
        h.enroller.enroll("alice", &photo(&[pose(ALICE, variant)])).unwrap();
    }

    let snapshot = h.store.load().unwrap();
    let record = snapshot.get("alice").unwrap();
    let expected: Vec<Embedding> = (3..=7).map(|v| raw_embedding(ALICE, v).normalized()).collect();
    assert_eq!(record.shots.len(), MAX_SHOTS);
    assert_eq!(record.shots, expected);
    assert_eq!(record.centroid, Embedding::mean_normalized(&record.shots));
    for shot in record.shots.iter().chain(record.centroid.iter()) {
        assert!((shot.l2_norm() - 1.0).abs() < 1e-5);
    }
}

#[test]
fn enrollment_keeps_identities_separate() {
    let h = harness(ReadFailurePolicy::TreatAsEmpty);
    h.enroller.enroll("alice", &photo(&[pose(ALICE, 1)])).unwrap();
    h.enroller.enroll("bob", &photo(&[pose(BOB, 1)])).unwrap();
    h.enroller.enroll("alice", &photo(&[pose(ALICE, 2)])).unwrap();

    let snapshot = h.store.load().unwrap();
    assert_eq!(snapshot.get("alice").unwrap().shots.len(), 2);
    assert_eq!(snapshot.get("bob").unwrap().shots.len(), 1);
}

#[test]
fn enrollment_targets_the_largest_face() {
    let h = harness(ReadFailurePolicy::TreatAsEmpty);
    let group = [
        Pose { identity: BOB, variant: 1, size: 20 },
        Pose { identity: ALICE, variant: 1, size: 90 },
    ];
    h.enroller.enroll("alice", &photo(&group)).unwrap();

    let record = h.store.load().unwrap().get("alice").cloned().unwrap();
    assert_eq!(record.shots, vec![raw_embedding(ALICE, 1).normalized()]);
}

#[test]
fn enrollment_rejections_do_not_touch_the_store() {
    let h = harness(ReadFailurePolicy::TreatAsEmpty);

    let no_face = h.enroller.enroll("alice", &photo(&[])).unwrap();
    assert_eq!(no_face, EnrollOutcome::Rejected(RejectionReason::NoFaceDetected));
    assert_eq!(no_face.message(), "No face detected");

    let garbage = attest_core::ProofImage::new(b"GIF89a but not really".to_vec());
    let unreadable = h.enroller.enroll("alice", &garbage).unwrap();
    assert_eq!(unreadable, EnrollOutcome::Rejected(RejectionReason::ImageUnreadable));
    assert_eq!(unreadable.message(), "Could not read image");

    assert!(!h.store.path().exists());
}

#[test]
fn probe_identical_to_a_shot_scores_one() {
    let h = harness(ReadFailurePolicy::TreatAsEmpty);
    h.enroller.enroll("alice", &photo(&[pose(ALICE, 1)])).unwrap();
    h.enroller.enroll("alice", &photo(&[pose(ALICE, 6)])).unwrap();

    let outcome = h.scorer.verify("alice", &photo(&[pose(ALICE, 6)])).unwrap();
    assert!(outcome.matched);
    assert!((outcome.score - 1.0).abs() < 1e-5, "score = {}", outcome.score);
}

#[test]
fn unknown_identity_is_a_zero_score_non_match() {
    let h = harness(ReadFailurePolicy::TreatAsEmpty);
    h.enroller.enroll("alice", &photo(&[pose(ALICE, 1)])).unwrap();
    let calls_before = calls(&h.faces.calls);

    let outcome = h.scorer.verify("mallory", &photo(&[pose(ALICE, 1)])).unwrap();
    assert!(!outcome.matched);
    assert_eq!(outcome.score, 0.0);
    assert_eq!(outcome.reason, Some(RejectionReason::UnknownIdentity));
    // The store is consulted before any inference runs.
    assert_eq!(calls(&h.faces.calls), calls_before);
}

#[test]
fn unusable_probe_images_are_zero_score_non_matches() {
    let h = harness(ReadFailurePolicy::TreatAsEmpty);
    h.enroller.enroll("alice", &photo(&[pose(ALICE, 1)])).unwrap();

    let blank = h.scorer.verify("alice", &photo(&[])).unwrap();
    assert_eq!((blank.matched, blank.score), (false, 0.0));
    assert_eq!(blank.reason, Some(RejectionReason::NoFaceDetected));

    let garbage = attest_core::ProofImage::new(vec![0u8; 64]);
    let unreadable = h.scorer.verify("alice", &garbage).unwrap();
    assert_eq!((unreadable.matched, unreadable.score), (false, 0.0));
    assert_eq!(unreadable.reason, Some(RejectionReason::ImageUnreadable));
}

#[test]
fn bystander_does_not_shadow_the_claimant() {
    let h = harness(ReadFailurePolicy::TreatAsEmpty);
    h.enroller.enroll("alice", &photo(&[pose(ALICE, 1)])).unwrap();

    let crowd = [
        Pose { identity: BOB, variant: 2, size: 120 },
        Pose { identity: ALICE, variant: 2, size: 30 },
    ];
    let outcome = h.scorer.verify("alice", &photo(&crowd)).unwrap();
    assert!(outcome.matched, "score = {}", outcome.score);
}

#[test]
fn dimensionality_mismatch_is_fatal() {
    let h = harness(ReadFailurePolicy::TreatAsEmpty);
    h.enroller.enroll("alice", &photo(&[pose(ALICE, 1)])).unwrap();

    let err = h
        .enroller
        .enroll("alice", &photo(&[pose(ODD_DIM_IDENTITY, 1)]))
        .unwrap_err();
    assert!(matches!(err, EnrollError::DimensionMismatch { expected: 8, found: 4, .. }));
    assert_eq!(h.store.load().unwrap().get("alice").unwrap().shots.len(), 1);

    assert!(h
        .scorer
        .verify("alice", &photo(&[pose(ODD_DIM_IDENTITY, 1)]))
        .is_err());
}

#[test]
fn unreadable_store_follows_the_read_failure_policy() {
    let lenient = harness(ReadFailurePolicy::TreatAsEmpty);
    std::fs::write(lenient.store.path(), b"{\"version\":1,\"identities\":{\"ali").unwrap();
    let outcome = lenient.scorer.verify("alice", &photo(&[pose(ALICE, 1)])).unwrap();
    assert_eq!(outcome.reason, Some(RejectionReason::UnknownIdentity));
    let enrolled = lenient.enroller.enroll("alice", &photo(&[pose(ALICE, 1)])).unwrap();
    assert_eq!(enrolled, EnrollOutcome::Rejected(RejectionReason::StoreUnavailable));
    assert_eq!(
        std::fs::read(lenient.store.path()).unwrap(),
        b"{\"version\":1,\"identities\":{\"ali"
    );

    let strict = harness(ReadFailurePolicy::Surface);
    std::fs::write(strict.store.path(), b"{\"version\":1,\"identities\":{\"ali").unwrap();
    let outcome = strict.scorer.verify("alice", &photo(&[pose(ALICE, 1)])).unwrap();
    assert_eq!(outcome.reason, Some(RejectionReason::StoreUnavailable));
    assert_eq!(outcome.score, 0.0);

    let enrolled = strict.enroller.enroll("alice", &photo(&[pose(ALICE, 1)])).unwrap();
    assert_eq!(enrolled, EnrollOutcome::Rejected(RejectionReason::StoreUnavailable));
}
