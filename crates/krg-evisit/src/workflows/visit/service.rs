use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::checkpoint::CheckpointDesk;
use super::clock::Clock;
use super::domain::{
    Actor, Application, ApplicationId, ApplicationStatus, ApplicationSubmission, AuditAction,
    AuditEntry, ReferenceNumber, Role, ValidityWindow, VisitorLocation,
};
use super::intake::{IntakeGuard, IntakeViolation};
use super::lifecycle::{
    self, commit_transition, Action, LifecycleError, Transition, TransitionOutcome,
};
use super::permit::{IssuedPermit, PermitCodec, PermitError};
use super::repository::{
    ApplicationFilter, ApplicationRepository, Notification, NotificationDispatcher,
    NotificationKind, RepositoryError,
};
use super::screening::overstay::{self, SkippedApplication, SweepReport};
use super::screening::{
    priority_for, RiskAssessment, ScreeningConfig, ScreeningRequest, SecurityScreener,
};
use super::watchlist::{WatchlistRegistry, WatchlistRepository};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionReceipt {
    pub application: Application,
    pub assessment: RiskAssessment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewInput {
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalInput {
    pub valid_from: NaiveDate,
    pub valid_until: NaiveDate,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideInput {
    pub justification: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalReceipt {
    pub application: Application,
    pub permit: IssuedPermit,
    pub assessment: RiskAssessment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionInput {
    pub reason: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub documents: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<ApplicationStatus>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub pages: usize,
}

/// Public view returned when an applicant tracks a reference number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackingView {
    pub reference_number: ReferenceNumber,
    pub full_name: String,
    pub status: ApplicationStatus,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
    pub requested_documents: Vec<String>,
}

impl From<&Application> for TrackingView {
    fn from(application: &Application) -> Self {
        let validity = application.validity();
        Self {
            reference_number: application.reference_number.clone(),
            full_name: application.applicant.full_name.clone(),
            status: application.status,
            submitted_at: application.created_at,
            reviewed_at: application.review.as_ref().map(|review| review.reviewed_at),
            approved_at: application.approval.as_ref().map(|approval| approval.approved_at),
            rejected_at: application.rejection.as_ref().map(|rejection| rejection.rejected_at),
            rejection_reason: application
                .rejection
                .as_ref()
                .map(|rejection| rejection.reason.clone()),
            valid_from: validity.map(|validity| validity.valid_from),
            valid_until: validity.map(|validity| validity.valid_until),
            requested_documents: application.requested_documents.clone(),
        }
    }
}

/// Hands `notification` to the dispatcher; delivery failures are logged only.
pub(crate) fn deliver<N>(notifier: &N, notification: Notification)
where
    N: NotificationDispatcher + ?Sized,
{
    let kind = notification.kind;
    let reference = notification.reference_number.clone();
    if let Err(err) = notifier.notify(notification) {
        warn!(?kind, %reference, error = %err, "notification delivery failed");
    }
}

/// Service composing intake validation, screening, the lifecycle, and permit minting.
pub struct VisitApplicationService<R, W, N> {
    intake: IntakeGuard,
    repository: Arc<R>,
    notifier: Arc<N>,
    screener: SecurityScreener<R, W>,
    codec: PermitCodec,
    clock: Arc<dyn Clock>,
}

impl<S, N> VisitApplicationService<S, S, N>
where
    S: ApplicationRepository + WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    /// Service over one `store` for applications and the watchlist. Overstay
    /// watchlist entries are committed with the application change, so screening
    /// must read the watchlist from the same store.
    pub fn new(
        store: Arc<S>,
        notifier: Arc<N>,
        codec: PermitCodec,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_screening_config(store, notifier, codec, clock, ScreeningConfig::default())
    }

    pub fn with_screening_config(
        store: Arc<S>,
        notifier: Arc<N>,
        codec: PermitCodec,
        clock: Arc<dyn Clock>,
        config: ScreeningConfig,
    ) -> Self {
        let screener = SecurityScreener::new(store.clone(), store.clone(), config);
        Self {
            intake: IntakeGuard::new(),
            repository: store,
            notifier,
            screener,
            codec,
            clock,
        }
    }
}

impl<R, W, N> VisitApplicationService<R, W, N>
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    fn ensure_staff(actor: &Actor) -> Result<(), ApplicationServiceError> {
        if actor.role.is_staff() {
            Ok(())
        } else {
            Err(ApplicationServiceError::Forbidden(actor.role))
        }
    }

    fn fetch(&self, id: &ApplicationId) -> Result<Application, ApplicationServiceError> {
        Ok(self
            .repository
            .fetch(id)?
            .ok_or(RepositoryError::NotFound)?)
    }

    fn commit<T>(
        &self,
        id: &ApplicationId,
        build: impl FnMut(&Application) -> Result<(TransitionOutcome, T), ApplicationServiceError>,
    ) -> Result<(Application, TransitionOutcome, T), ApplicationServiceError> {
        commit_transition(&*self.repository, id, build)
    }

    fn announce(&self, application: &Application, outcome: &TransitionOutcome) {
        if let Some(kind) = outcome.notification {
            deliver(&*self.notifier, Notification::describing(kind, application));
        }
    }

    fn run(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        transition: Transition,
    ) -> Result<Application, ApplicationServiceError> {
        let now = self.clock.now();
        let action = transition.action();
        let (application, outcome, ()) = self.commit(id, |current| {
            let outcome = lifecycle::apply(current, actor, transition.clone(), now)?;
            Ok((outcome, ()))
        })?;
        info!(
            application_id = %application.id,
            reference = %application.reference_number,
            %action,
            status = %application.status,
            actor = %actor.id,
            "application transitioned"
        );
        self.announce(&application, &outcome);
        Ok(application)
    }

    /// Validate, screen, and persist a new application under a fresh reference number.
    pub fn submit(
        &self,
        submission: ApplicationSubmission,
    ) -> Result<SubmissionReceipt, ApplicationServiceError> {
        let submission = self.intake.validate(submission)?;
        let now = self.clock.now();

        let assessment = self
            .screener
            .screen(&ScreeningRequest::for_applicant(&submission.applicant), now)?;

        let year = now.year();
        let sequence = self.repository.next_reference_sequence(year)?;
        let reference_number = ReferenceNumber::new(year, sequence).ok_or_else(|| {
            RepositoryError::Unavailable(format!("reference sequence exhausted for {year}"))
        })?;

        let application = Application {
            id: ApplicationId::generate(),
            reference_number,
            applicant: submission.applicant,
            visit: submission.visit,
            status: ApplicationStatus::Submitted,
            priority: priority_for(&assessment),
            assigned_officer_id: None,
            risk_score: assessment.risk_score,
            risk_severity: assessment.severity,
            risk_flags: assessment.flags.clone(),
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
            created_at: now,
            updated_at: now,
            version: 0,
        };

        let mut details = BTreeMap::new();
        details.insert(
            "reference_number".to_string(),
            application.reference_number.to_string(),
        );
        details.insert("risk_score".to_string(), assessment.risk_score.to_string());
        details.insert("severity".to_string(), assessment.severity.to_string());
        let audit = AuditEntry {
            application_id: application.id.clone(),
            action: AuditAction::Submit,
            actor_id: "applicant".to_string(),
            at: now,
            details,
        };

        let stored = self.repository.insert(application, audit)?;
        info!(
            application_id = %stored.id,
            reference = %stored.reference_number,
            risk_score = assessment.risk_score,
            severity = %assessment.severity,
            "application submitted"
        );
        if assessment.requires_manual_review {
            warn!(
                reference = %stored.reference_number,
                summary = %assessment.summary(),
                "submission flagged for manual review"
            );
        }
        deliver(
            &*self.notifier,
            Notification::describing(NotificationKind::Submitted, &stored),
        );

        Ok(SubmissionReceipt {
            application: stored,
            assessment,
        })
    }

    /// Run the risk checks for an identity without touching any application.
    pub fn screen(
        &self,
        actor: &Actor,
        request: &ScreeningRequest,
    ) -> Result<RiskAssessment, ApplicationServiceError> {
        Self::ensure_staff(actor)?;
        Ok(self.screener.screen(request, self.clock.now())?)
    }

    /// Re-run screening for a pending application, merging any new flags.
    pub fn rescreen(
        &self,
        actor: &Actor,
        id: &ApplicationId,
    ) -> Result<SubmissionReceipt, ApplicationServiceError> {
        let now = self.clock.now();
        let (application, _, assessment) = self.commit(id, |current| {
            lifecycle::authorize(current, actor, Action::Rescreen)?;
            let assessment = self
                .screener
                .screen(&ScreeningRequest::for_application(current), now)?;
            let transition = Transition::Rescreen {
                assessment: assessment.clone(),
            };
            Ok((lifecycle::apply(current, actor, transition, now)?, assessment))
        })?;
        info!(
            reference = %application.reference_number,
            risk_score = application.risk_score,
            "application rescreened"
        );
        Ok(SubmissionReceipt {
            application,
            assessment,
        })
    }

    pub fn assign(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        officer_id: &str,
    ) -> Result<Application, ApplicationServiceError> {
        self.run(
            actor,
            id,
            Transition::Assign {
                officer_id: officer_id.to_string(),
            },
        )
    }

    pub fn review(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        input: ReviewInput,
    ) -> Result<Application, ApplicationServiceError> {
        self.run(
            actor,
            id,
            Transition::Review {
                notes: input.notes,
                recommendation: input.recommendation,
            },
        )
    }

    /// Supervisor sign-off letting a director approve a failed screening.
    ///
    /// The application is re-screened and the override is bound to that score.
    pub fn override_screening(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        input: OverrideInput,
    ) -> Result<Application, ApplicationServiceError> {
        if input.justification.trim().is_empty() {
            return Err(LifecycleError::Validation("justification is required".to_string()).into());
        }
        let now = self.clock.now();
        let (application, _, ()) = self.commit(id, |current| {
            lifecycle::authorize(current, actor, Action::OverrideScreening)?;
            let assessment = self
                .screener
                .screen(&ScreeningRequest::for_application(current), now)?;
            let transition = Transition::OverrideScreening {
                justification: input.justification.clone(),
                assessment,
            };
            Ok((lifecycle::apply(current, actor, transition, now)?, ()))
        })?;
        warn!(
            reference = %application.reference_number,
            supervisor = %actor.id,
            risk_score = application.risk_score,
            "screening override granted"
        );
        Ok(application)
    }

    /// Approve after a fresh screening and mint the permit in the same commit.
    ///
    /// A failed screening blocks approval with `SECURITY_GATE` unless a
    /// supervisor override covering the fresh score is on record.
    pub fn approve(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        input: ApprovalInput,
    ) -> Result<ApprovalReceipt, ApplicationServiceError> {
        let validity = ValidityWindow::new(input.valid_from, input.valid_until).ok_or_else(|| {
            LifecycleError::Validation("valid_from must not be after valid_until".to_string())
        })?;
        let now = self.clock.now();

        let (application, outcome, (permit, assessment)) = self.commit(id, |current| {
            lifecycle::authorize(current, actor, Action::Approve)?;
            let assessment = self
                .screener
                .screen(&ScreeningRequest::for_application(current), now)?;
            let covered = current
                .screening_override
                .as_ref()
                .is_some_and(|granted| granted.covers(assessment.risk_score));
            if !assessment.passed && !covered {
                warn!(
                    reference = %current.reference_number,
                    risk_score = assessment.risk_score,
                    severity = %assessment.severity,
                    "approval blocked by security screening"
                );
                return Err(ApplicationServiceError::SecurityGate { assessment });
            }

            let permit = self.codec.issue(&current.id, now)?;
            let transition = Transition::Approve {
                validity,
                permit: permit.record(),
                assessment: assessment.clone(),
                notes: input.notes.clone(),
            };
            let outcome = lifecycle::apply(current, actor, transition, now)?;
            Ok((outcome, (permit, assessment)))
        })?;

        let screening_override = application
            .approval
            .as_ref()
            .and_then(|approval| approval.screening_override.as_ref());
        if let Some(screening_override) = screening_override {
            warn!(
                reference = %application.reference_number,
                supervisor = %screening_override.supervisor_id,
                risk_score = assessment.risk_score,
                "approval granted under screening override"
            );
        }
        info!(
            reference = %application.reference_number,
            valid_from = %validity.valid_from,
            valid_until = %validity.valid_until,
            actor = %actor.id,
            "application approved"
        );
        self.announce(&application, &outcome);

        Ok(ApprovalReceipt {
            application,
            permit,
            assessment,
        })
    }

    pub fn reject(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        input: RejectionInput,
    ) -> Result<Application, ApplicationServiceError> {
        if input.reason.trim().is_empty() {
            return Err(LifecycleError::Validation("reason is required".to_string()).into());
        }
        self.run(
            actor,
            id,
            Transition::Reject {
                reason: input.reason,
                notes: input.notes,
            },
        )
    }

    pub fn request_documents(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        request: DocumentRequest,
    ) -> Result<Application, ApplicationServiceError> {
        self.run(
            actor,
            id,
            Transition::RequestDocuments {
                documents: request.documents,
                notes: request.notes,
            },
        )
    }

    pub fn resume_review(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        notes: Option<String>,
    ) -> Result<Application, ApplicationServiceError> {
        self.run(actor, id, Transition::ResumeReview { notes })
    }

    /// Mint a fresh QR for an approved or active permit.
    pub fn issue_permit(
        &self,
        actor: &Actor,
        id: &ApplicationId,
    ) -> Result<IssuedPermit, ApplicationServiceError> {
        let application = self.fetch(id)?;
        lifecycle::authorize(&application, actor, Action::IssuePermit)?;
        let permit = self.codec.issue(&application.id, self.clock.now())?;
        info!(reference = %application.reference_number, actor = %actor.id, "permit issued");
        Ok(permit)
    }

    pub fn get(
        &self,
        actor: &Actor,
        id: &ApplicationId,
    ) -> Result<Application, ApplicationServiceError> {
        Self::ensure_staff(actor)?;
        self.fetch(id)
    }

    /// Limited public view looked up by reference number.
    pub fn track(&self, reference: &str) -> Result<TrackingView, ApplicationServiceError> {
        let reference = ReferenceNumber::parse(reference).ok_or(RepositoryError::NotFound)?;
        let application = self
            .repository
            .fetch_by_reference(&reference)?
            .ok_or(RepositoryError::NotFound)?;
        Ok(TrackingView::from(&application))
    }

    pub fn list(
        &self,
        actor: &Actor,
        query: &ListQuery,
    ) -> Result<Page<Application>, ApplicationServiceError> {
        Self::ensure_staff(actor)?;
        let page = query.page.unwrap_or(1).max(1);
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        let mut filter = ApplicationFilter::default();
        if let Some(status) = query.status {
            filter = filter.statuses(&[status]);
        }
        let total = self.repository.count(&filter)?;
        let items = self
            .repository
            .query(&filter.page((page - 1) * limit, limit))?;

        Ok(Page {
            items,
            page,
            limit,
            total,
            pages: total.div_ceil(limit),
        })
    }

    pub fn audit_trail(
        &self,
        actor: &Actor,
        id: &ApplicationId,
    ) -> Result<Vec<AuditEntry>, ApplicationServiceError> {
        Self::ensure_staff(actor)?;
        self.fetch(id)?;
        Ok(self.repository.audit_trail(id)?)
    }

    /// Flag every active visitor still inside more than three days after permit expiry.
    ///
    /// Each application is committed on its own; a failure is reported in the sweep
    /// result and does not stop the remaining applications.
    pub fn detect_and_flag_overstays(&self) -> Result<SweepReport, ApplicationServiceError> {
        let now = self.clock.now();
        let system = Actor::system();
        let active = self
            .repository
            .query(&ApplicationFilter::default().statuses(&[ApplicationStatus::Active]))?;

        let mut report = SweepReport {
            examined: active.len(),
            ..SweepReport::default()
        };

        for candidate in active {
            if overstay::detect(&candidate, now).is_none() {
                continue;
            }
            let result = self.commit(&candidate.id, |current| {
                let finding = overstay::detect(current, now).ok_or(
                    LifecycleError::InvalidStateTransition {
                        action: Action::FlagOverstay,
                        from: current.status,
                    },
                )?;
                let transition = Transition::FlagOverstay {
                    overstay_days: finding.overstay_days,
                };
                let mut outcome = lifecycle::apply(current, &system, transition, now)?;
                outcome.watchlist = overstay::watchlist_entry(current, &finding, now);
                Ok((outcome, finding))
            });

            match result {
                Ok((application, _, finding)) => {
                    warn!(
                        reference = %application.reference_number,
                        overstay_days = finding.overstay_days,
                        watchlisted = finding.watchlist_severity.is_some(),
                        "visitor flagged for overstay"
                    );
                    report.flagged.push(finding);
                }
                Err(err) => {
                    error!(
                        application_id = %candidate.id,
                        error = %err,
                        "overstay flag could not be committed"
                    );
                    report.skipped.push(SkippedApplication {
                        application_id: candidate.id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        info!(
            examined = report.examined,
            flagged = report.flagged.len(),
            skipped = report.skipped.len(),
            "overstay sweep finished"
        );
        Ok(report)
    }
}

/// Error raised by the application service.
#[derive(Debug, thiserror::Error)]
pub enum ApplicationServiceError {
    #[error(transparent)]
    Intake(#[from] IntakeViolation),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("role {0} may not read application records")]
    Forbidden(Role),
    #[error("security screening blocked approval (risk score {})", .assessment.risk_score)]
    SecurityGate { assessment: RiskAssessment },
    #[error(transparent)]
    Permit(#[from] PermitError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ApplicationServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ApplicationServiceError::Intake(err) => err.code(),
            ApplicationServiceError::Lifecycle(err) => err.code(),
            ApplicationServiceError::Forbidden(_) => "FORBIDDEN",
            ApplicationServiceError::SecurityGate { .. } => "SECURITY_GATE",
            ApplicationServiceError::Permit(err) => err.code(),
            ApplicationServiceError::Repository(err) => err.code(),
        }
    }
}

/// The three services sharing one store, notifier, codec, and clock.
pub struct VisitServices<R, W, N> {
    pub applications: Arc<VisitApplicationService<R, W, N>>,
    pub checkpoint: Arc<CheckpointDesk<R, W, N>>,
    pub watchlist: Arc<WatchlistRegistry<W>>,
}

impl<R, W, N> Clone for VisitServices<R, W, N> {
    fn clone(&self) -> Self {
        Self {
            applications: self.applications.clone(),
            checkpoint: self.checkpoint.clone(),
            watchlist: self.watchlist.clone(),
        }
    }
}

impl<S, N> VisitServices<S, S, N>
where
    S: ApplicationRepository + WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    /// Wires all three services to one `store` backing both repository traits.
    pub fn new(
        store: Arc<S>,
        notifier: Arc<N>,
        codec: PermitCodec,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let applications = Arc::new(VisitApplicationService::new(
            store.clone(),
            notifier.clone(),
            codec.clone(),
            clock.clone(),
        ));
        let checkpoint = Arc::new(CheckpointDesk::new(
            store.clone(),
            store.clone(),
            notifier,
            codec,
            clock.clone(),
        ));
        let watchlist = Arc::new(WatchlistRegistry::new(store, clock));
        Self {
            applications,
            checkpoint,
            watchlist,
        }
    }
}
