//! Application state machine: role and status guards plus the state each
//! transition produces.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::domain::{
    Actor, Application, ApplicationId, ApplicationStatus, ApprovalRecord, AuditAction, AuditEntry,
    EntryExitLog, LogType, PermitRecord, RejectionRecord, ReviewRecord, Role, ScreeningOverride,
    ValidityWindow, VisitorLocation,
};
use super::repository::{
    ApplicationChange, ApplicationRepository, NotificationKind, RepositoryError,
};
use super::screening::{merge_flags, priority_for, RiskAssessment};
use super::watchlist::WatchlistEntry;

use ApplicationStatus::*;

/// Attempts made before a version conflict is surfaced to the caller.
pub(crate) const MAX_COMMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Rescreen,
    OverrideScreening,
    Assign,
    Review,
    Approve,
    Reject,
    RequestDocuments,
    ResumeReview,
    IssuePermit,
    CheckpointEntry,
    CheckpointExit,
    FlagOverstay,
}

impl Action {
    pub const fn label(self) -> &'static str {
        match self {
            Action::Rescreen => "rescreen",
            Action::OverrideScreening => "override screening for",
            Action::Assign => "assign",
            Action::Review => "review",
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::RequestDocuments => "request documents for",
            Action::ResumeReview => "resume review of",
            Action::IssuePermit => "issue a permit for",
            Action::CheckpointEntry => "record checkpoint entry for",
            Action::CheckpointExit => "record checkpoint exit for",
            Action::FlagOverstay => "flag an overstay on",
        }
    }

    pub const fn permits(self, role: Role) -> bool {
        match self {
            Action::Rescreen => matches!(role, Role::Officer | Role::Supervisor | Role::Director),
            Action::OverrideScreening => matches!(role, Role::Supervisor),
            Action::Assign => matches!(role, Role::Supervisor),
            Action::Review => matches!(role, Role::Officer),
            Action::Approve | Action::Reject => matches!(role, Role::Director),
            Action::RequestDocuments => {
                matches!(role, Role::Officer | Role::Supervisor | Role::Director)
            }
            Action::ResumeReview => matches!(role, Role::Officer | Role::Supervisor),
            Action::IssuePermit => matches!(role, Role::Officer | Role::Supervisor | Role::Director),
            Action::CheckpointEntry | Action::CheckpointExit => {
                matches!(role, Role::CheckpointOfficer)
            }
            Action::FlagOverstay => matches!(role, Role::System | Role::Admin),
        }
    }

    pub const fn allowed_from(self) -> &'static [ApplicationStatus] {
        match self {
            Action::Rescreen => &[Submitted, Assigned, UnderReview, PendingDocuments],
            Action::Assign => &[Submitted, Assigned],
            Action::Review => &[Assigned],
            Action::OverrideScreening
            | Action::Approve
            | Action::Reject
            | Action::RequestDocuments => &[UnderReview],
            Action::ResumeReview => &[PendingDocuments],
            Action::IssuePermit | Action::CheckpointEntry | Action::CheckpointExit => {
                &[Approved, Active]
            }
            Action::FlagOverstay => &[Active],
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A requested change with the inputs it needs.
#[derive(Debug, Clone)]
pub enum Transition {
    Rescreen {
        assessment: RiskAssessment,
    },
    OverrideScreening {
        justification: String,
        assessment: RiskAssessment,
    },
    Assign {
        officer_id: String,
    },
    Review {
        notes: String,
        recommendation: Option<String>,
    },
    Approve {
        validity: ValidityWindow,
        permit: PermitRecord,
        assessment: RiskAssessment,
        notes: Option<String>,
    },
    Reject {
        reason: String,
        notes: Option<String>,
    },
    RequestDocuments {
        documents: Vec<String>,
        notes: Option<String>,
    },
    ResumeReview {
        notes: Option<String>,
    },
    CheckpointEntry {
        checkpoint_id: String,
    },
    CheckpointExit {
        checkpoint_id: String,
    },
    FlagOverstay {
        overstay_days: u32,
    },
}

impl Transition {
    pub fn action(&self) -> Action {
        match self {
            Transition::Rescreen { .. } => Action::Rescreen,
            Transition::OverrideScreening { .. } => Action::OverrideScreening,
            Transition::Assign { .. } => Action::Assign,
            Transition::Review { .. } => Action::Review,
            Transition::Approve { .. } => Action::Approve,
            Transition::Reject { .. } => Action::Reject,
            Transition::RequestDocuments { .. } => Action::RequestDocuments,
            Transition::ResumeReview { .. } => Action::ResumeReview,
            Transition::CheckpointEntry { .. } => Action::CheckpointEntry,
            Transition::CheckpointExit { .. } => Action::CheckpointExit,
            Transition::FlagOverstay { .. } => Action::FlagOverstay,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("role {role} may not {action} an application")]
    Forbidden { action: Action, role: Role },
    #[error("cannot {action} an application in status {from}")]
    InvalidStateTransition {
        action: Action,
        from: ApplicationStatus,
    },
    #[error("{0}")]
    Validation(String),
    #[error("visitor is already inside")]
    AlreadyInside,
    #[error("visitor is not inside")]
    NotInside,
    #[error("permit is not valid on {today}")]
    OutsideValidity { today: NaiveDate },
}

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::Forbidden { .. } => "FORBIDDEN",
            LifecycleError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            LifecycleError::Validation(_) => "VALIDATION",
            LifecycleError::AlreadyInside => "ALREADY_INSIDE",
            LifecycleError::NotInside => "NOT_INSIDE",
            LifecycleError::OutsideValidity { .. } => "PERMIT_EXPIRED",
        }
    }
}

/// Everything a successful transition commits, plus the notification it triggers.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub application: Application,
    pub audit: AuditEntry,
    pub log: Option<EntryExitLog>,
    pub watchlist: Option<WatchlistEntry>,
    pub notification: Option<NotificationKind>,
}

/// Checks role, status, and location guards for `action` without changing anything.
pub fn authorize(
    application: &Application,
    actor: &Actor,
    action: Action,
) -> Result<(), LifecycleError> {
    if !action.permits(actor.role) {
        return Err(LifecycleError::Forbidden {
            action,
            role: actor.role,
        });
    }
    if !action.allowed_from().contains(&application.status) {
        return Err(LifecycleError::InvalidStateTransition {
            action,
            from: application.status,
        });
    }
    match action {
        Action::CheckpointEntry if application.is_inside() => Err(LifecycleError::AlreadyInside),
        Action::CheckpointExit if !application.is_inside() => Err(LifecycleError::NotInside),
        Action::Approve | Action::Reject
            if application.approval.is_some() || application.rejection.is_some() =>
        {
            Err(LifecycleError::InvalidStateTransition {
                action,
                from: application.status,
            })
        }
        _ => Ok(()),
    }
}

fn required(value: &str, field: &str) -> Result<String, LifecycleError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LifecycleError::Validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn checkpoint_log(
    application: &Application,
    actor: &Actor,
    log_type: LogType,
    checkpoint_id: &str,
    now: DateTime<Utc>,
) -> EntryExitLog {
    EntryExitLog {
        id: Uuid::new_v4().to_string(),
        application_id: application.id.clone(),
        log_type,
        checkpoint_id: checkpoint_id.to_string(),
        officer_id: actor.id.clone(),
        recorded_at: now,
    }
}

/// Applies `assessment` to the application's risk fields, keeping earlier flags.
pub(crate) fn record_assessment(application: &mut Application, assessment: &RiskAssessment) {
    application.risk_score = assessment.risk_score;
    application.risk_severity = assessment.severity;
    application.priority = priority_for(assessment);
    merge_flags(&mut application.risk_flags, &assessment.flags);
}

/// Computes the next state of `application` for `transition` performed by `actor` at `now`.
pub fn apply(
    application: &Application,
    actor: &Actor,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, LifecycleError> {
    let action = transition.action();
    authorize(application, actor, action)?;

    let mut next = application.clone();
    next.updated_at = now;
    let mut details = BTreeMap::new();
    let mut log = None;
    let mut notification = None;

    let audit_action = match transition {
        Transition::Rescreen { assessment } => {
            record_assessment(&mut next, &assessment);
            details.insert("risk_score".to_string(), assessment.risk_score.to_string());
            details.insert("severity".to_string(), assessment.severity.to_string());
            AuditAction::Rescreen
        }
        Transition::OverrideScreening {
            justification,
            assessment,
        } => {
            let justification = required(&justification, "justification")?;
            record_assessment(&mut next, &assessment);
            details.insert("risk_score".to_string(), assessment.risk_score.to_string());
            details.insert("severity".to_string(), assessment.severity.to_string());
            details.insert("justification".to_string(), justification.clone());
            next.screening_override = Some(ScreeningOverride {
                supervisor_id: actor.id.clone(),
                justification,
                risk_score: assessment.risk_score,
                granted_at: now,
            });
            AuditAction::OverrideScreening
        }
        Transition::Assign { officer_id } => {
            let officer_id = required(&officer_id, "officer_id")?;
            if let Some(previous) = &application.assigned_officer_id {
                details.insert("previous_officer_id".to_string(), previous.clone());
            }
            details.insert("officer_id".to_string(), officer_id.clone());
            next.assigned_officer_id = Some(officer_id);
            next.status = Assigned;
            AuditAction::Assign
        }
        Transition::Review {
            notes,
            recommendation,
        } => {
            let recommendation = optional(recommendation);
            if let Some(recommendation) = &recommendation {
                details.insert("recommendation".to_string(), recommendation.clone());
            }
            next.review = Some(ReviewRecord {
                reviewer_id: actor.id.clone(),
                notes: notes.trim().to_string(),
                recommendation,
                reviewed_at: now,
            });
            next.status = UnderReview;
            AuditAction::Review
        }
        Transition::Approve {
            validity,
            permit,
            assessment,
            notes,
        } => {
            if validity.valid_until < now.date_naive() {
                return Err(LifecycleError::Validation(
                    "validity window ends in the past".to_string(),
                ));
            }
            let screening_override = application
                .screening_override
                .clone()
                .filter(|granted| granted.covers(assessment.risk_score));
            if !assessment.passed && screening_override.is_none() {
                return Err(LifecycleError::Validation(
                    "failed screening requires a supervisor override".to_string(),
                ));
            }
            record_assessment(&mut next, &assessment);
            details.insert("valid_from".to_string(), validity.valid_from.to_string());
            details.insert("valid_until".to_string(), validity.valid_until.to_string());
            details.insert("risk_score".to_string(), assessment.risk_score.to_string());
            if let Some(screening_override) = &screening_override {
                details.insert(
                    "override_supervisor_id".to_string(),
                    screening_override.supervisor_id.clone(),
                );
            }
            next.approval = Some(ApprovalRecord {
                approved_by: actor.id.clone(),
                approved_at: now,
                validity,
                notes: optional(notes),
                screening_override,
            });
            next.permit = Some(permit);
            next.status = Approved;
            notification = Some(NotificationKind::Approved);
            AuditAction::Approve
        }
        Transition::Reject { reason, notes } => {
            let reason = required(&reason, "reason")?;
            details.insert("reason".to_string(), reason.clone());
            next.rejection = Some(RejectionRecord {
                rejected_by: actor.id.clone(),
                rejected_at: now,
                reason,
                notes: optional(notes),
            });
            next.status = Rejected;
            notification = Some(NotificationKind::Rejected);
            AuditAction::Reject
        }
        Transition::RequestDocuments { documents, notes } => {
            let documents: Vec<String> = documents
                .iter()
                .map(|document| document.trim().to_string())
                .filter(|document| !document.is_empty())
                .collect();
            if documents.is_empty() {
                return Err(LifecycleError::Validation(
                    "at least one document must be requested".to_string(),
                ));
            }
            details.insert("documents".to_string(), documents.join(", "));
            if let Some(notes) = optional(notes) {
                details.insert("notes".to_string(), notes);
            }
            next.requested_documents = documents;
            next.status = PendingDocuments;
            notification = Some(NotificationKind::DocumentsRequested);
            AuditAction::RequestDocuments
        }
        Transition::ResumeReview { notes } => {
            if let Some(notes) = optional(notes) {
                details.insert("notes".to_string(), notes);
            }
            next.status = UnderReview;
            AuditAction::ResumeReview
        }
        Transition::CheckpointEntry { checkpoint_id } => {
            let checkpoint_id = required(&checkpoint_id, "checkpoint_id")?;
            let within = application
                .validity()
                .is_some_and(|validity| validity.contains(now));
            if !within {
                return Err(LifecycleError::OutsideValidity {
                    today: now.date_naive(),
                });
            }
            details.insert("checkpoint_id".to_string(), checkpoint_id.clone());
            log = Some(checkpoint_log(
                application,
                actor,
                LogType::Entry,
                &checkpoint_id,
                now,
            ));
            next.location = VisitorLocation::Inside { checkpoint_id };
            next.entered_at = Some(now);
            next.status = Active;
            notification = Some(NotificationKind::EntryRecorded);
            AuditAction::CheckpointEntry
        }
        Transition::CheckpointExit { checkpoint_id } => {
            let checkpoint_id = required(&checkpoint_id, "checkpoint_id")?;
            details.insert("checkpoint_id".to_string(), checkpoint_id.clone());
            log = Some(checkpoint_log(
                application,
                actor,
                LogType::Exit,
                &checkpoint_id,
                now,
            ));
            next.location = VisitorLocation::Exited { checkpoint_id };
            next.exited_at = Some(now);
            next.status = Completed;
            AuditAction::CheckpointExit
        }
        Transition::FlagOverstay { overstay_days } => {
            details.insert("overstay_days".to_string(), overstay_days.to_string());
            next.overstay_days = Some(overstay_days);
            next.status = Overstayed;
            AuditAction::FlagOverstay
        }
    };

    details.insert("from".to_string(), application.status.to_string());
    details.insert("to".to_string(), next.status.to_string());
    debug!(
        application_id = %application.id,
        action = %action,
        from = %application.status,
        to = %next.status,
        "transition applied"
    );

    Ok(TransitionOutcome {
        audit: AuditEntry {
            application_id: application.id.clone(),
            action: audit_action,
            actor_id: actor.id.clone(),
            at: now,
            details,
        },
        application: next,
        log,
        watchlist: None,
        notification,
    })
}

/// Re-reads the application and commits the outcome of `build`, retrying when
/// a concurrent writer bumped the version in between. `build` may hand back a
/// value computed alongside the outcome.
pub(crate) fn commit_transition<R, E, F, T>(
    repository: &R,
    id: &ApplicationId,
    mut build: F,
) -> Result<(Application, TransitionOutcome, T), E>
where
    R: ApplicationRepository + ?Sized,
    E: From<RepositoryError>,
    F: FnMut(&Application) -> Result<(TransitionOutcome, T), E>,
{
    let mut attempt = 1;
    loop {
        let current = repository.fetch(id)?.ok_or(RepositoryError::NotFound)?;
        let (outcome, extra) = build(&current)?;
        let change = ApplicationChange {
            application: outcome.application.clone(),
            expected_version: current.version,
            audit: outcome.audit.clone(),
            log: outcome.log.clone(),
            watchlist: outcome.watchlist.clone(),
        };
        match repository.commit(change) {
            Ok(stored) => return Ok((stored, outcome, extra)),
            Err(RepositoryError::VersionConflict { expected, found })
                if attempt < MAX_COMMIT_ATTEMPTS =>
            {
                debug!(
                    application_id = %id,
                    attempt,
                    expected,
                    found,
                    "retrying after version conflict"
                );
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}
