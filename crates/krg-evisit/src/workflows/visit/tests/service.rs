use std::sync::{Arc, Barrier};
use std::thread;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use super::common::*;
use crate::workflows::visit::clock::{Clock, ManualClock};
use crate::workflows::visit::domain::{
    ApplicationId, ApplicationStatus, AuditAction, LogType, PriorityLevel, Severity,
};
use crate::workflows::visit::lifecycle::{self, commit_transition, Transition, MAX_COMMIT_ATTEMPTS};
use crate::workflows::visit::memory::InMemoryStore;
use crate::workflows::visit::repository::{ApplicationRepository, NotificationKind};
use crate::workflows::visit::screening::RiskCheck;
use crate::workflows::visit::service::{
    ApplicationServiceError, ApprovalInput, DocumentRequest, ListQuery, OverrideInput,
    RejectionInput, VisitApplicationService,
};
use crate::workflows::visit::watchlist::{IdentityKeys, WatchlistFlagType, WatchlistRepository};
use crate::workflows::visit::checkpoint::{CheckpointAction, CheckpointRequest};

fn justification(text: &str) -> OverrideInput {
    OverrideInput {
        justification: text.to_string(),
    }
}

#[test]
fn submissions_receive_sequential_reference_numbers() {
    let h = harness();
    let first = h
        .services
        .applications
        .submit(submission("A1000001", "+9647500000001"))
        .expect("first");
    let second = h
        .services
        .applications
        .submit(submission("A1000002", "+9647500000002"))
        .expect("second");

    assert_eq!(first.application.reference_number.as_str(), "KRG-2026-000001");
    assert_eq!(second.application.reference_number.as_str(), "KRG-2026-000002");
    assert_eq!(first.application.status, ApplicationStatus::Submitted);
    assert_eq!(first.application.priority, PriorityLevel::Normal);
    assert_eq!(first.assessment.risk_score, 0);
    assert_eq!(h.notifier.kinds(), vec![NotificationKind::Submitted; 2]);
}

#[test]
fn invalid_submission_touches_nothing() {
    let h = harness();
    let mut bad = submission("A1000001", "+9647500000001");
    bad.applicant.phone_number = " ".to_string();

    let err = h.services.applications.submit(bad).expect_err("invalid");
    assert_eq!(err.code(), "VALIDATION");
    assert!(h.notifier.sent().is_empty());

    let next = h
        .services
        .applications
        .submit(submission("A1000001", "+9647500000001"))
        .expect("valid");
    assert_eq!(next.application.reference_number.as_str(), "KRG-2026-000001");
}

#[test]
fn duplicate_submission_is_flagged_for_manual_review() {
    let h = harness();
    h.approved("X1234567", "+9647500000010");
    h.clock.advance(Duration::days(2));

    let second = h
        .services
        .applications
        .submit(submission("X1234567", "+9647500000010"))
        .expect("second submission");

    assert!(second.assessment.risk_score >= 40);
    assert!(second.assessment.requires_manual_review);
    assert_eq!(second.application.priority, PriorityLevel::High);
    assert_eq!(second.application.risk_flags[0].check, RiskCheck::Duplicate);
}

#[test]
fn notification_failures_are_swallowed() {
    let store = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now()));
    let service = VisitApplicationService::new(
        store.clone(),
        Arc::new(FailingNotifier),
        codec(),
        clock,
    );

    let receipt = service
        .submit(submission("A1000001", "+9647500000001"))
        .expect("submission survives notifier outage");
    assert!(store
        .fetch(&receipt.application.id)
        .expect("store")
        .is_some());
}

#[test]
fn storage_failure_surfaces_as_storage_failure() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now()));
    let service = VisitApplicationService::new(
        Arc::new(UnavailableRepository),
        Arc::new(RecordingNotifier::default()),
        codec(),
        clock,
    );

    let err = service
        .submit(submission("A1000001", "+9647500000001"))
        .expect_err("database offline");
    assert_eq!(err.code(), "STORAGE_FAILURE");
}

#[test]
fn approval_mints_a_verifiable_permit() {
    let h = harness();
    let receipt = h.approved("X1234567", "+9647500000010");

    let application = &receipt.application;
    assert_eq!(application.status, ApplicationStatus::Approved);
    assert_eq!(
        application.permit.as_ref().map(|permit| permit.payload.as_str()),
        Some(receipt.permit.raw.as_str())
    );
    assert_eq!(receipt.permit.image.content_type, "image/svg+xml");

    let verified = codec()
        .parse_and_verify(&receipt.permit.raw, now())
        .expect("fresh permit verifies");
    assert_eq!(verified, application.id);

    let approved = h
        .notifier
        .sent()
        .into_iter()
        .find(|notification| notification.kind == NotificationKind::Approved)
        .expect("approval notification");
    assert_eq!(
        approved.details.get("valid_until").map(String::as_str),
        Some("2026-11-16")
    );
}

#[test]
fn failed_screening_blocks_approval_without_override() {
    let h = harness();
    let id = h.under_review("Y7654321", "+9647500000020");
    WatchlistRepository::insert(&*h.store, watchlist_entry("Y7654321", Severity::Critical))
        .expect("watchlist insert");

    let err = h
        .services
        .applications
        .approve(&director(), &id, approval_window(0, 30))
        .expect_err("security gate");
    assert_eq!(err.code(), "SECURITY_GATE");
    match err {
        ApplicationServiceError::SecurityGate { assessment } => {
            assert_eq!(assessment.severity, Severity::Critical);
            assert!(!assessment.passed);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(h.stored(&id).status, ApplicationStatus::UnderReview);
    assert!(h.stored(&id).permit.is_none());
}

#[test]
fn director_cannot_supply_their_own_override() {
    let h = harness();
    let id = h.under_review("Y7654321", "+9647500000020");
    WatchlistRepository::insert(&*h.store, watchlist_entry("Y7654321", Severity::Critical))
        .expect("watchlist insert");

    // Override fields in the approval body are not part of the approval input.
    let window: ApprovalInput = serde_json::from_value(json!({
        "valid_from": today(),
        "valid_until": today() + Duration::days(30),
        "screening_override": {
            "supervisor_id": "made-up-by-director",
            "justification": "x",
        },
    }))
    .expect("approval body");
    let err = h
        .services
        .applications
        .approve(&director(), &id, window)
        .expect_err("no supervisor acted");
    assert_eq!(err.code(), "SECURITY_GATE");

    let err = h
        .services
        .applications
        .override_screening(&director(), &id, justification("cleared by director"))
        .expect_err("directors cannot override");
    assert_eq!(err.code(), "FORBIDDEN");

    let stored = h.stored(&id);
    assert_eq!(stored.status, ApplicationStatus::UnderReview);
    assert!(stored.screening_override.is_none());
}

#[test]
fn supervisor_override_unlocks_approval() {
    let h = harness();
    let id = h.under_review("Y7654321", "+9647500000020");
    WatchlistRepository::insert(&*h.store, watchlist_entry("Y7654321", Severity::Critical))
        .expect("watchlist insert");

    let overridden = h
        .services
        .applications
        .override_screening(
            &supervisor(),
            &id,
            justification("entry cleared by liaison office"),
        )
        .expect("override");
    assert_eq!(overridden.status, ApplicationStatus::UnderReview);
    let granted = overridden.screening_override.expect("override recorded");
    assert_eq!(granted.supervisor_id, "supervisor-1");
    assert_eq!(granted.risk_score, 80);
    assert_eq!(granted.granted_at, now());

    let receipt = h
        .services
        .applications
        .approve(&director(), &id, approval_window(0, 30))
        .expect("override approval");
    let approval = receipt.application.approval.expect("approval recorded");
    assert_eq!(
        approval
            .screening_override
            .map(|screening_override| screening_override.supervisor_id),
        Some("supervisor-1".to_string())
    );
    assert_eq!(receipt.application.priority, PriorityLevel::Urgent);

    let actions: Vec<AuditAction> = h
        .store
        .audit_trail(&id)
        .expect("audit")
        .into_iter()
        .map(|entry| entry.action)
        .collect();
    assert_eq!(
        actions[actions.len() - 2..],
        [AuditAction::OverrideScreening, AuditAction::Approve]
    );
}

#[test]
fn override_does_not_cover_a_higher_score() {
    let h = harness();
    let id = h.under_review("Y7654321", "+9647500000020");
    WatchlistRepository::insert(&*h.store, watchlist_entry("Y7654321", Severity::High))
        .expect("watchlist insert");
    h.services
        .applications
        .override_screening(&supervisor(), &id, justification("known family"))
        .expect("override at 50");

    WatchlistRepository::insert(&*h.store, watchlist_entry("Y7654321", Severity::Critical))
        .expect("watchlist insert");
    let err = h
        .services
        .applications
        .approve(&director(), &id, approval_window(0, 30))
        .expect_err("score rose after the override");
    assert_eq!(err.code(), "SECURITY_GATE");
}

#[test]
fn blank_override_is_rejected() {
    let h = harness();
    let id = h.under_review("Y7654321", "+9647500000020");
    let err = h
        .services
        .applications
        .override_screening(&supervisor(), &id, justification("  "))
        .expect_err("blank justification");
    assert_eq!(err.code(), "VALIDATION");
    assert!(h.stored(&id).screening_override.is_none());
}

#[test]
fn inverted_validity_window_is_rejected() {
    let h = harness();
    let id = h.under_review("A1000001", "+9647500000001");
    let err = h
        .services
        .applications
        .approve(&director(), &id, approval_window(10, 5))
        .expect_err("inverted window");
    assert_eq!(err.code(), "VALIDATION");
}

#[test]
fn rescreen_keeps_earlier_flags() {
    let h = harness();
    let first = h.under_review("X1234567", "+9647500000010");
    let second = h
        .services
        .applications
        .submit(submission("X1234567", "+9647500000010"))
        .expect("second")
        .application;
    assert_eq!(second.risk_score, 40);

    h.services
        .applications
        .reject(
            &director(),
            &first,
            RejectionInput {
                reason: "sponsor not reachable".to_string(),
                notes: None,
            },
        )
        .expect("reject first");

    let rescreened = h
        .services
        .applications
        .rescreen(&officer(), &second.id)
        .expect("rescreen");

    assert_eq!(rescreened.assessment.risk_score, 25);
    assert_eq!(rescreened.application.risk_score, 25);
    let checks: Vec<RiskCheck> = rescreened
        .application
        .risk_flags
        .iter()
        .map(|flag| flag.check)
        .collect();
    assert_eq!(checks, vec![RiskCheck::Duplicate, RiskCheck::RecentRejection]);
}

#[test]
fn rejection_notifies_with_reason() {
    let h = harness();
    let id = h.under_review("A1000001", "+9647500000001");
    let rejected = h
        .services
        .applications
        .reject(
            &director(),
            &id,
            RejectionInput {
                reason: "incomplete sponsor letter".to_string(),
                notes: None,
            },
        )
        .expect("reject");
    assert_eq!(rejected.status, ApplicationStatus::Rejected);

    let sent = h.notifier.sent();
    let notice = sent.last().expect("rejection notice");
    assert_eq!(notice.kind, NotificationKind::Rejected);
    assert_eq!(
        notice.details.get("reason").map(String::as_str),
        Some("incomplete sponsor letter")
    );

    let err = h
        .services
        .applications
        .reject(
            &director(),
            &ApplicationId("missing".to_string()),
            RejectionInput {
                reason: "n/a".to_string(),
                notes: None,
            },
        )
        .expect_err("unknown application");
    assert_eq!(err.code(), "NOT_FOUND");
}

#[test]
fn documents_requested_then_review_resumes() {
    let h = harness();
    let id = h.under_review("A1000001", "+9647500000001");
    let pending = h
        .services
        .applications
        .request_documents(
            &officer(),
            &id,
            DocumentRequest {
                documents: vec!["hotel booking".to_string()],
                notes: None,
            },
        )
        .expect("request documents");
    assert_eq!(pending.status, ApplicationStatus::PendingDocuments);
    assert_eq!(
        h.notifier.kinds().last(),
        Some(&NotificationKind::DocumentsRequested)
    );

    let tracked = h
        .services
        .applications
        .track(pending.reference_number.as_str())
        .expect("track");
    assert_eq!(tracked.requested_documents, vec!["hotel booking".to_string()]);

    let resumed = h
        .services
        .applications
        .resume_review(&officer(), &id, Some("booking received".to_string()))
        .expect("resume");
    assert_eq!(resumed.status, ApplicationStatus::UnderReview);
}

#[test]
fn audit_trail_follows_the_lifecycle() {
    let h = harness();
    let receipt = h.approved("A1000001", "+9647500000001");
    let trail = h
        .services
        .applications
        .audit_trail(&supervisor(), &receipt.application.id)
        .expect("audit trail");
    let actions: Vec<AuditAction> = trail.iter().map(|entry| entry.action).collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::Submit,
            AuditAction::Assign,
            AuditAction::Review,
            AuditAction::Approve
        ]
    );
    assert_eq!(trail[3].actor_id, "director-1");
    assert_eq!(receipt.application.version, 4);
}

#[test]
fn track_unknown_reference_is_not_found() {
    let h = harness();
    for reference in ["KRG-2026-000099", "not-a-reference"] {
        let err = h
            .services
            .applications
            .track(reference)
            .expect_err("unknown reference");
        assert_eq!(err.code(), "NOT_FOUND");
    }
}

#[test]
fn listing_filters_and_paginates() {
    let h = harness();
    for index in 0..5 {
        h.services
            .applications
            .submit(submission(
                &format!("L{index:07}"),
                &format!("+96475000001{index:02}"),
            ))
            .expect("submit");
        h.clock.advance(Duration::minutes(1));
    }
    h.under_review("R0000001", "+9647500000200");

    let page = h
        .services
        .applications
        .list(
            &officer(),
            &ListQuery {
                status: Some(ApplicationStatus::Submitted),
                page: Some(2),
                limit: Some(2),
            },
        )
        .expect("list");
    assert_eq!(page.total, 5);
    assert_eq!(page.pages, 3);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].reference_number.as_str(), "KRG-2026-000003");

    let err = h
        .services
        .applications
        .list(&checkpoint_officer(), &ListQuery::default())
        .expect_err("checkpoint officers cannot list");
    assert_eq!(err.code(), "FORBIDDEN");
}

#[test]
fn reissued_permit_is_fresh() {
    let h = harness();
    let receipt = h.approved("A1000001", "+9647500000001");
    h.clock.advance(Duration::hours(30));

    assert!(codec()
        .parse_and_verify(&receipt.permit.raw, h.clock.now())
        .is_err());

    let fresh = h
        .services
        .applications
        .issue_permit(&officer(), &receipt.application.id)
        .expect("reissue");
    assert_eq!(
        codec()
            .parse_and_verify(&fresh.raw, h.clock.now())
            .expect("fresh"),
        receipt.application.id
    );

    let pending = h.under_review("A1000002", "+9647500000002");
    let err = h
        .services
        .applications
        .issue_permit(&officer(), &pending)
        .expect_err("not approved yet");
    assert_eq!(err.code(), "INVALID_STATE_TRANSITION");
}

#[test]
fn overstay_sweep_flags_and_watchlists() {
    let h = harness();
    let short = h.approved_with("S1000001", "+9647500000301", approval_window(0, 5));
    let long = h.approved_with("S1000002", "+9647500000302", approval_window(0, 30));
    for receipt in [&short, &long] {
        h.services
            .checkpoint
            .verify(
                &checkpoint_officer(),
                CheckpointRequest {
                    qr_payload: receipt.permit.raw.clone(),
                    action: CheckpointAction::Entry,
                    checkpoint_id: "CP-1".to_string(),
                },
            )
            .expect("entry");
    }

    // The short permit lapses at 2026-10-23T00:00Z.
    h.clock.set(Utc.with_ymd_and_hms(2026, 11, 2, 1, 0, 0).unwrap());
    let report = h
        .services
        .applications
        .detect_and_flag_overstays()
        .expect("sweep");

    assert_eq!(report.examined, 2);
    assert_eq!(report.flagged.len(), 1);
    let finding = &report.flagged[0];
    assert_eq!(finding.application_id, short.application.id);
    assert_eq!(finding.overstay_days, 10);
    assert_eq!(finding.watchlist_severity, Some(Severity::Low));

    let flagged = h.stored(&short.application.id);
    assert_eq!(flagged.status, ApplicationStatus::Overstayed);
    assert_eq!(flagged.overstay_days, Some(10));
    assert_eq!(h.stored(&long.application.id).status, ApplicationStatus::Active);

    let entries = h.store.watchlist_entries().expect("watchlist");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].flag_type, WatchlistFlagType::Overstay);
    assert_eq!(entries[0].national_id, "S1000001");
    assert_eq!(
        entries[0].expires_at,
        Some(h.clock.now() + Duration::days(180))
    );

    let again = h
        .services
        .applications
        .detect_and_flag_overstays()
        .expect("second sweep");
    assert!(again.flagged.is_empty());
}

#[test]
fn short_overstay_is_flagged_without_watchlist() {
    let h = harness();
    let receipt = h.approved_with("S1000003", "+9647500000303", approval_window(0, 2));
    h.services
        .checkpoint
        .verify(
            &checkpoint_officer(),
            CheckpointRequest {
                qr_payload: receipt.permit.raw.clone(),
                action: CheckpointAction::Entry,
                checkpoint_id: "CP-1".to_string(),
            },
        )
        .expect("entry");

    // Lapses at 2026-10-20T00:00Z; exactly three days later is still grace.
    h.clock.set(Utc.with_ymd_and_hms(2026, 10, 23, 0, 0, 0).unwrap());
    let report = h
        .services
        .applications
        .detect_and_flag_overstays()
        .expect("sweep");
    assert!(report.flagged.is_empty());

    h.clock.advance(Duration::days(2));
    let report = h
        .services
        .applications
        .detect_and_flag_overstays()
        .expect("sweep");
    assert_eq!(report.flagged.len(), 1);
    assert_eq!(report.flagged[0].overstay_days, 5);
    assert_eq!(report.flagged[0].watchlist_severity, None);
    assert!(h.store.watchlist_entries().expect("watchlist").is_empty());
}

fn enter(h: &Harness, raw: &str) {
    h.services
        .checkpoint
        .verify(
            &checkpoint_officer(),
            CheckpointRequest {
                qr_payload: raw.to_string(),
                action: CheckpointAction::Entry,
                checkpoint_id: "CP-1".to_string(),
            },
        )
        .expect("entry");
}

#[test]
fn overstay_watchlist_entry_reaches_later_screening() {
    let h = harness();
    let receipt = h.approved_with("S1000004", "+9647500000304", approval_window(0, 5));
    enter(&h, &receipt.permit.raw);

    h.clock.set(Utc.with_ymd_and_hms(2026, 11, 2, 1, 0, 0).unwrap());
    h.services
        .applications
        .detect_and_flag_overstays()
        .expect("sweep");

    let hit = h
        .services
        .watchlist
        .check(&IdentityKeys::national_id("S1000004"))
        .expect("check")
        .expect("overstay entry in force");
    assert_eq!(hit.flag_type, WatchlistFlagType::Overstay);

    let again = h
        .services
        .applications
        .submit(submission("S1000004", "+9647500000304"))
        .expect("resubmit");
    let checks: Vec<RiskCheck> = again.assessment.flags.iter().map(|flag| flag.check).collect();
    assert!(checks.contains(&RiskCheck::Watchlist));
    assert!(checks.contains(&RiskCheck::OverstayHistory));
}

#[test]
fn overstay_sweep_and_checkpoint_exit_never_interleave() {
    for round in 0..8 {
        let h = harness();
        let national_id = format!("S20000{round:02}");
        let phone_number = format!("+96475000004{round:02}");
        let receipt = h.approved_with(&national_id, &phone_number, approval_window(0, 5));
        let id = receipt.application.id.clone();
        enter(&h, &receipt.permit.raw);
        h.clock.set(Utc.with_ymd_and_hms(2026, 11, 2, 1, 0, 0).unwrap());

        let barrier = Barrier::new(2);
        let (sweep, exit) = thread::scope(|scope| {
            let sweep = scope.spawn(|| {
                barrier.wait();
                h.services.applications.detect_and_flag_overstays()
            });
            let exit = scope.spawn(|| {
                barrier.wait();
                // The desk refuses a lapsed permit, so commit the exit the way the desk does.
                commit_transition::<_, ApplicationServiceError, _, ()>(&*h.store, &id, |current| {
                    let outcome = lifecycle::apply(
                        current,
                        &checkpoint_officer(),
                        Transition::CheckpointExit {
                            checkpoint_id: "CP-1".to_string(),
                        },
                        h.clock.now(),
                    )?;
                    Ok((outcome, ()))
                })
            });
            (
                sweep.join().expect("sweep thread"),
                exit.join().expect("exit thread"),
            )
        });

        let report = sweep.expect("sweep");
        let stored = h.stored(&id);
        let exits = h
            .logs_for(&id)
            .iter()
            .filter(|log| log.log_type == LogType::Exit)
            .count();
        let watchlisted = h.store.watchlist_entries().expect("watchlist").len();
        match exit {
            Ok((application, _, ())) => {
                assert_eq!(application.status, ApplicationStatus::Completed);
                assert_eq!(stored.status, ApplicationStatus::Completed);
                assert_eq!(stored.overstay_days, None);
                assert_eq!(exits, 1);
                assert!(report.flagged.is_empty());
                assert_eq!(watchlisted, 0);
            }
            Err(err) => {
                assert_eq!(err.code(), "INVALID_STATE_TRANSITION");
                assert_eq!(stored.status, ApplicationStatus::Overstayed);
                assert_eq!(exits, 0);
                assert_eq!(report.flagged.len(), 1);
                assert_eq!(watchlisted, 1);
            }
        }
    }
}

fn contended_service() -> (
    Arc<ContendedStore>,
    VisitApplicationService<ContendedStore, ContendedStore, RecordingNotifier>,
    ApplicationId,
) {
    let store = Arc::new(ContendedStore::default());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now()));
    let service = VisitApplicationService::new(
        store.clone(),
        Arc::new(RecordingNotifier::default()),
        codec(),
        clock,
    );
    let id = service
        .submit(submission("V1000001", "+9647500000501"))
        .expect("submit")
        .application
        .id;
    (store, service, id)
}

fn actions(store: &ContendedStore, id: &ApplicationId) -> Vec<AuditAction> {
    store
        .audit_trail(id)
        .expect("audit")
        .into_iter()
        .map(|entry| entry.action)
        .collect()
}

#[test]
fn version_conflict_rereads_and_reapplies() {
    let (store, service, id) = contended_service();
    let before = store.fetch(&id).expect("fetch").expect("stored").version;

    store.contend(1);
    let assigned = service
        .assign(&supervisor(), &id, "officer-1")
        .expect("assign after retry");

    assert_eq!(store.commits_attempted(), 2);
    assert_eq!(assigned.assigned_officer_id.as_deref(), Some("officer-1"));
    assert_eq!(assigned.version, before + 1);
    assert_eq!(actions(&store, &id), vec![AuditAction::Submit, AuditAction::Assign]);
}

#[test]
fn persistent_version_conflict_gives_up() {
    let (store, service, id) = contended_service();
    let before = store.fetch(&id).expect("fetch").expect("stored");

    store.contend(MAX_COMMIT_ATTEMPTS + 2);
    let err = service
        .assign(&supervisor(), &id, "officer-1")
        .expect_err("conflict persists");

    assert_eq!(err.code(), "CONFLICT");
    assert_eq!(store.commits_attempted(), MAX_COMMIT_ATTEMPTS);
    assert_eq!(store.fetch(&id).expect("fetch").expect("stored"), before);
    assert_eq!(actions(&store, &id), vec![AuditAction::Submit]);
}
