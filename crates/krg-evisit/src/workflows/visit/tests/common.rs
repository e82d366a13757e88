use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::to_bytes;
use axum::response::Response;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde_json::Value;

use crate::workflows::visit::clock::{Clock, ManualClock};
use crate::workflows::visit::domain::{
    Actor, ApplicantIdentity, Application, ApplicationId, ApplicationStatus,
    ApplicationSubmission, ApprovalRecord, AuditEntry, EntryExitLog, PermitRecord, PriorityLevel,
    ReferenceNumber, Role, Severity, ValidityWindow, VisitDetails, VisitPurpose, VisitorLocation,
};
use crate::workflows::visit::memory::InMemoryStore;
use crate::workflows::visit::permit::PermitCodec;
use crate::workflows::visit::repository::{
    ApplicationChange, ApplicationFilter, ApplicationRepository, LogFilter, Notification,
    NotificationDispatcher, NotificationError, NotificationKind, RepositoryError,
};
use crate::workflows::visit::service::{
    ApprovalInput, ApprovalReceipt, ReviewInput, VisitServices,
};
use crate::workflows::visit::signature::SignatureService;
use crate::workflows::visit::watchlist::{
    IdentityKeys, WatchlistEntry, WatchlistFlagType, WatchlistRepository,
};

pub(super) const TEST_SECRET: &[u8] = b"test-permit-secret-0123456789abcdef";

pub(super) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap()
}

pub(super) fn today() -> NaiveDate {
    now().date_naive()
}

pub(super) fn codec() -> PermitCodec {
    PermitCodec::with_qr_renderer(SignatureService::new(TEST_SECRET))
}

pub(super) fn officer() -> Actor {
    Actor::new("officer-1", Role::Officer)
}

pub(super) fn supervisor() -> Actor {
    Actor::new("supervisor-1", Role::Supervisor)
}

pub(super) fn director() -> Actor {
    Actor::new("director-1", Role::Director)
}

pub(super) fn checkpoint_officer() -> Actor {
    Actor::new("gate-officer-7", Role::CheckpointOfficer)
}

pub(super) fn applicant(national_id: &str, phone_number: &str) -> ApplicantIdentity {
    ApplicantIdentity {
        national_id: national_id.to_string(),
        full_name: "Layla Hassan".to_string(),
        phone_number: phone_number.to_string(),
        email: Some(format!("{}@example.org", national_id.to_ascii_lowercase())),
        date_of_birth: NaiveDate::from_ymd_opt(1990, 4, 12).expect("valid date"),
        nationality: "IQ".to_string(),
    }
}

pub(super) fn visit() -> VisitDetails {
    VisitDetails {
        origin_governorate: "Baghdad".to_string(),
        destination_governorate: "Erbil".to_string(),
        purpose: VisitPurpose::FamilyVisit,
        start_date: NaiveDate::from_ymd_opt(2026, 10, 20).expect("valid date"),
        end_date: NaiveDate::from_ymd_opt(2026, 11, 10).expect("valid date"),
        declared_accommodation: Some("Ankawa, Erbil".to_string()),
    }
}

pub(super) fn submission(national_id: &str, phone_number: &str) -> ApplicationSubmission {
    ApplicationSubmission {
        applicant: applicant(national_id, phone_number),
        visit: visit(),
    }
}

/// Bare application in `status`, for exercising the state machine directly.
pub(super) fn application(status: ApplicationStatus) -> Application {
    Application {
        id: ApplicationId("app-fixture".to_string()),
        reference_number: ReferenceNumber::new(2026, 1).expect("in range"),
        applicant: applicant("A1234567", "+9647501234567"),
        visit: visit(),
        status,
        priority: PriorityLevel::Normal,
        assigned_officer_id: None,
        risk_score: 0,
        risk_severity: Severity::Low,
        risk_flags: Vec::new(),
        review: None,
        approval: None,
        rejection: None,
        requested_documents: Vec::new(),
        permit: None,
        location: VisitorLocation::NotEntered,
        entered_at: None,
        exited_at: None,
        overstay_days: None,
        screening_override: None,
        created_at: now() - Duration::days(3),
        updated_at: now() - Duration::days(3),
        version: 1,
    }
}

/// Approved application valid from today for 30 days.
pub(super) fn approved_application() -> Application {
    let mut approved = application(ApplicationStatus::Approved);
    approved.approval = Some(ApprovalRecord {
        approved_by: "director-1".to_string(),
        approved_at: now() - Duration::hours(1),
        validity: ValidityWindow::new(today(), today() + Duration::days(30)).expect("ordered"),
        notes: None,
        screening_override: None,
    });
    approved.permit = Some(PermitRecord {
        payload: "{}".to_string(),
        signature: "00".to_string(),
        issued_at: now() - Duration::hours(1),
    });
    approved
}

pub(super) fn watchlist_entry(national_id: &str, severity: Severity) -> WatchlistEntry {
    WatchlistEntry {
        id: format!("wl-{national_id}-{severity}"),
        national_id: national_id.to_string(),
        full_name: "Flagged Person".to_string(),
        phone_number: None,
        email: None,
        reason: "forged residency card".to_string(),
        flag_type: WatchlistFlagType::Fraud,
        severity,
        active: true,
        expires_at: None,
        created_by: "supervisor-9".to_string(),
        created_at: now() - Duration::days(10),
    }
}

pub(super) fn approval_window(from_offset_days: i64, until_offset_days: i64) -> ApprovalInput {
    ApprovalInput {
        valid_from: today() + Duration::days(from_offset_days),
        valid_until: today() + Duration::days(until_offset_days),
        notes: Some("family visit confirmed".to_string()),
    }
}

#[derive(Default)]
pub(super) struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub(super) fn sent(&self) -> Vec<Notification> {
        self.sent.lock().expect("notifier lock").clone()
    }

    pub(super) fn kinds(&self) -> Vec<NotificationKind> {
        self.sent().into_iter().map(|notification| notification.kind).collect()
    }
}

impl NotificationDispatcher for RecordingNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotificationError> {
        self.sent.lock().expect("notifier lock").push(notification);
        Ok(())
    }
}

pub(super) struct FailingNotifier;

impl NotificationDispatcher for FailingNotifier {
    fn notify(&self, _notification: Notification) -> Result<(), NotificationError> {
        Err(NotificationError::Transport("sms gateway timeout".to_string()))
    }
}

pub(super) struct UnavailableRepository;

fn offline<T>() -> Result<T, RepositoryError> {
    Err(RepositoryError::Unavailable("database offline".to_string()))
}

impl ApplicationRepository for UnavailableRepository {
    fn next_reference_sequence(&self, _year: i32) -> Result<u32, RepositoryError> {
        offline()
    }

    fn insert(
        &self,
        _application: Application,
        _audit: AuditEntry,
    ) -> Result<Application, RepositoryError> {
        offline()
    }

    fn commit(&self, _change: ApplicationChange) -> Result<Application, RepositoryError> {
        offline()
    }

    fn fetch(&self, _id: &ApplicationId) -> Result<Option<Application>, RepositoryError> {
        offline()
    }

    fn fetch_by_reference(
        &self,
        _reference: &ReferenceNumber,
    ) -> Result<Option<Application>, RepositoryError> {
        offline()
    }

    fn query(&self, _filter: &ApplicationFilter) -> Result<Vec<Application>, RepositoryError> {
        offline()
    }

    fn count(&self, _filter: &ApplicationFilter) -> Result<usize, RepositoryError> {
        offline()
    }

    fn logs(&self, _filter: &LogFilter) -> Result<Vec<EntryExitLog>, RepositoryError> {
        offline()
    }

    fn audit_trail(&self, _id: &ApplicationId) -> Result<Vec<AuditEntry>, RepositoryError> {
        offline()
    }
}

impl WatchlistRepository for UnavailableRepository {
    fn insert(&self, _entry: WatchlistEntry) -> Result<WatchlistEntry, RepositoryError> {
        offline()
    }

    fn deactivate(
        &self,
        _national_id: &str,
        _flag_type: Option<WatchlistFlagType>,
    ) -> Result<usize, RepositoryError> {
        offline()
    }

    fn candidates(&self, _keys: &IdentityKeys) -> Result<Vec<WatchlistEntry>, RepositoryError> {
        offline()
    }
}

/// Store whose next `conflicts` commits fail as if another writer got there first.
#[derive(Default)]
pub(super) struct ContendedStore {
    pub(super) inner: InMemoryStore,
    conflicts: AtomicUsize,
    commits: AtomicUsize,
}

impl ContendedStore {
    pub(super) fn contend(&self, conflicts: usize) {
        self.conflicts.store(conflicts, Ordering::SeqCst);
        self.commits.store(0, Ordering::SeqCst);
    }

    pub(super) fn commits_attempted(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl ApplicationRepository for ContendedStore {
    fn next_reference_sequence(&self, year: i32) -> Result<u32, RepositoryError> {
        self.inner.next_reference_sequence(year)
    }

    fn insert(
        &self,
        application: Application,
        audit: AuditEntry,
    ) -> Result<Application, RepositoryError> {
        ApplicationRepository::insert(&self.inner, application, audit)
    }

    fn commit(&self, change: ApplicationChange) -> Result<Application, RepositoryError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let contended = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if contended {
            return Err(RepositoryError::VersionConflict {
                expected: change.expected_version,
                found: change.expected_version + 1,
            });
        }
        self.inner.commit(change)
    }

    fn fetch(&self, id: &ApplicationId) -> Result<Option<Application>, RepositoryError> {
        self.inner.fetch(id)
    }

    fn fetch_by_reference(
        &self,
        reference: &ReferenceNumber,
    ) -> Result<Option<Application>, RepositoryError> {
        self.inner.fetch_by_reference(reference)
    }

    fn query(&self, filter: &ApplicationFilter) -> Result<Vec<Application>, RepositoryError> {
        self.inner.query(filter)
    }

    fn count(&self, filter: &ApplicationFilter) -> Result<usize, RepositoryError> {
        self.inner.count(filter)
    }

    fn logs(&self, filter: &LogFilter) -> Result<Vec<EntryExitLog>, RepositoryError> {
        self.inner.logs(filter)
    }

    fn audit_trail(&self, id: &ApplicationId) -> Result<Vec<AuditEntry>, RepositoryError> {
        self.inner.audit_trail(id)
    }
}

impl WatchlistRepository for ContendedStore {
    fn insert(&self, entry: WatchlistEntry) -> Result<WatchlistEntry, RepositoryError> {
        WatchlistRepository::insert(&self.inner, entry)
    }

    fn deactivate(
        &self,
        national_id: &str,
        flag_type: Option<WatchlistFlagType>,
    ) -> Result<usize, RepositoryError> {
        self.inner.deactivate(national_id, flag_type)
    }

    fn candidates(&self, keys: &IdentityKeys) -> Result<Vec<WatchlistEntry>, RepositoryError> {
        self.inner.candidates(keys)
    }
}

pub(super) type TestServices = VisitServices<InMemoryStore, InMemoryStore, RecordingNotifier>;

pub(super) struct Harness {
    pub store: Arc<InMemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub services: TestServices,
}

pub(super) fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let clock = Arc::new(ManualClock::new(now()));
    let shared_clock: Arc<dyn Clock> = clock.clone();
    let services = VisitServices::new(
        store.clone(),
        notifier.clone(),
        codec(),
        shared_clock,
    );
    Harness {
        store,
        notifier,
        clock,
        services,
    }
}

impl Harness {
    /// Submit, assign, review, and approve a fresh application for `national_id`.
    pub(super) fn approved(&self, national_id: &str, phone_number: &str) -> ApprovalReceipt {
        self.approved_with(national_id, phone_number, approval_window(0, 30))
    }

    pub(super) fn approved_with(
        &self,
        national_id: &str,
        phone_number: &str,
        window: ApprovalInput,
    ) -> ApprovalReceipt {
        let id = self.under_review(national_id, phone_number);
        self.services
            .applications
            .approve(&director(), &id, window)
            .expect("approve")
    }

    /// Submit, assign, and review, leaving the application under review.
    pub(super) fn under_review(&self, national_id: &str, phone_number: &str) -> ApplicationId {
        let receipt = self
            .services
            .applications
            .submit(submission(national_id, phone_number))
            .expect("submit");
        let id = receipt.application.id;
        self.services
            .applications
            .assign(&supervisor(), &id, "officer-1")
            .expect("assign");
        self.services
            .applications
            .review(
                &officer(),
                &id,
                ReviewInput {
                    notes: "documents verified".to_string(),
                    recommendation: Some("approve".to_string()),
                },
            )
            .expect("review");
        id
    }

    pub(super) fn stored(&self, id: &ApplicationId) -> Application {
        self.store
            .fetch(id)
            .expect("store available")
            .expect("application stored")
    }

    pub(super) fn logs_for(&self, id: &ApplicationId) -> Vec<EntryExitLog> {
        self.store
            .logs(&LogFilter::for_application(id.clone()))
            .expect("store available")
    }
}

pub(super) async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    serde_json::from_slice(&bytes).expect("json body")
}
