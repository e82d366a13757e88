//! Checkpoint verification: QR signature and freshness, application state,
//! permit validity, watchlist, then the entry or exit transition.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::clock::Clock;
use super::domain::{
    Actor, Application, ApplicationStatus, EntryExitLog, ReferenceNumber, Role, Severity,
    VisitPurpose, VisitorLocation,
};
use super::lifecycle::{self, commit_transition, Action, LifecycleError, Transition};
use super::permit::{PermitCodec, PermitError};
use super::repository::{
    ApplicationFilter, ApplicationRepository, LogFilter, Notification, NotificationDispatcher,
    RepositoryError,
};
use super::service::deliver;
use super::watchlist::{strongest_match, IdentityKeys, WatchlistFlagType, WatchlistRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointAction {
    Entry,
    Exit,
}

impl fmt::Display for CheckpointAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointAction::Entry => f.write_str("ENTRY"),
            CheckpointAction::Exit => f.write_str("EXIT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub qr_payload: String,
    pub action: CheckpointAction,
    pub checkpoint_id: String,
}

/// What the officer at the barrier sees about the visitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisitorSummary {
    pub reference_number: ReferenceNumber,
    pub full_name: String,
    pub national_id: String,
    pub nationality: String,
    pub purpose: VisitPurpose,
    pub destination_governorate: String,
    pub status: ApplicationStatus,
    pub location: VisitorLocation,
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
}

impl From<&Application> for VisitorSummary {
    fn from(application: &Application) -> Self {
        let validity = application.validity();
        Self {
            reference_number: application.reference_number.clone(),
            full_name: application.applicant.full_name.clone(),
            national_id: application.applicant.national_id.clone(),
            nationality: application.applicant.nationality.clone(),
            purpose: application.visit.purpose,
            destination_governorate: application.visit.destination_governorate.clone(),
            status: application.status,
            location: application.location.clone(),
            valid_from: validity.map(|validity| validity.valid_from),
            valid_until: validity.map(|validity| validity.valid_until),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointPass {
    pub visitor: VisitorSummary,
    pub log: EntryExitLog,
    pub message: String,
}

/// Details surfaced to the officer when a watchlist match stops a crossing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchlistAlert {
    pub reason: String,
    pub flag_type: WatchlistFlagType,
    pub severity: Severity,
    pub flagged_by: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("role {0} may not operate a checkpoint")]
    Forbidden(Role),
    #[error("{0}")]
    Validation(String),
    #[error("invalid permit QR: {0}")]
    InvalidQr(PermitError),
    #[error("application not found for permit")]
    ApplicationNotFound,
    #[error("application is {0}, not approved for travel")]
    NotApproved(ApplicationStatus),
    #[error("permit is not valid today")]
    PermitExpired,
    #[error("visitor matches an active watchlist entry ({})", .0.flag_type)]
    WatchlistAlert(WatchlistAlert),
    #[error(transparent)]
    Transition(#[from] LifecycleError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl CheckpointError {
    pub fn code(&self) -> &'static str {
        match self {
            CheckpointError::Forbidden(_) => "FORBIDDEN",
            CheckpointError::Validation(_) => "VALIDATION",
            CheckpointError::InvalidQr(_) => "INVALID_QR",
            CheckpointError::ApplicationNotFound
            | CheckpointError::Repository(RepositoryError::NotFound) => "APPLICATION_NOT_FOUND",
            CheckpointError::NotApproved(_) => "NOT_APPROVED",
            CheckpointError::PermitExpired => "PERMIT_EXPIRED",
            CheckpointError::WatchlistAlert(_) => "WATCHLIST_ALERT",
            CheckpointError::Transition(err) => err.code(),
            CheckpointError::Repository(err) => err.code(),
        }
    }
}

/// Checkpoint-facing service.
pub struct CheckpointDesk<R, W, N> {
    repository: Arc<R>,
    watchlist: Arc<W>,
    notifier: Arc<N>,
    codec: PermitCodec,
    clock: Arc<dyn Clock>,
}

impl<R, W, N> CheckpointDesk<R, W, N>
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    pub fn new(
        repository: Arc<R>,
        watchlist: Arc<W>,
        notifier: Arc<N>,
        codec: PermitCodec,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            watchlist,
            notifier,
            codec,
            clock,
        }
    }

    fn ensure_checkpoint_officer(actor: &Actor) -> Result<(), CheckpointError> {
        if Action::CheckpointEntry.permits(actor.role) {
            Ok(())
        } else {
            Err(CheckpointError::Forbidden(actor.role))
        }
    }

    pub fn verify(
        &self,
        actor: &Actor,
        request: CheckpointRequest,
    ) -> Result<CheckpointPass, CheckpointError> {
        Self::ensure_checkpoint_officer(actor)?;
        let checkpoint_id = request.checkpoint_id.trim().to_string();
        if checkpoint_id.is_empty() {
            return Err(CheckpointError::Validation(
                "checkpoint_id is required".to_string(),
            ));
        }
        let now = self.clock.now();

        let application_id = self
            .codec
            .parse_and_verify(&request.qr_payload, now)
            .map_err(|err| {
                warn!(%checkpoint_id, code = err.code(), error = %err, "rejected permit QR");
                CheckpointError::InvalidQr(err)
            })?;

        let application = self
            .repository
            .fetch(&application_id)?
            .ok_or(CheckpointError::ApplicationNotFound)?;

        if !matches!(
            application.status,
            ApplicationStatus::Approved | ApplicationStatus::Active
        ) {
            return Err(CheckpointError::NotApproved(application.status));
        }

        let within = application
            .validity()
            .is_some_and(|validity| validity.contains(now));
        if !within {
            return Err(CheckpointError::PermitExpired);
        }

        let keys = IdentityKeys::for_checkpoint(&application.applicant);
        let candidates = self.watchlist.candidates(&keys)?;
        if let Some(entry) = strongest_match(&candidates, &keys, now) {
            warn!(
                reference = %application.reference_number,
                %checkpoint_id,
                flag_type = %entry.flag_type,
                severity = %entry.severity,
                "watchlist match at checkpoint"
            );
            return Err(CheckpointError::WatchlistAlert(WatchlistAlert {
                reason: entry.reason.clone(),
                flag_type: entry.flag_type,
                severity: entry.severity,
                flagged_by: entry.created_by.clone(),
            }));
        }

        let transition = match request.action {
            CheckpointAction::Entry => Transition::CheckpointEntry {
                checkpoint_id: checkpoint_id.clone(),
            },
            CheckpointAction::Exit => Transition::CheckpointExit {
                checkpoint_id: checkpoint_id.clone(),
            },
        };
        let (stored, outcome, ()) =
            commit_transition(&*self.repository, &application.id, |current| {
                let outcome = lifecycle::apply(current, actor, transition.clone(), now)
                    .map_err(CheckpointError::Transition)?;
                Ok::<_, CheckpointError>((outcome, ()))
            })?;

        let log = outcome
            .log
            .clone()
            .ok_or_else(|| RepositoryError::Unavailable("checkpoint log missing".to_string()))?;
        if let Some(kind) = outcome.notification {
            deliver(&*self.notifier, Notification::describing(kind, &stored));
        }
        info!(
            reference = %stored.reference_number,
            %checkpoint_id,
            action = %request.action,
            officer = %actor.id,
            "checkpoint crossing recorded"
        );

        let message = match request.action {
            CheckpointAction::Entry => format!("Entry recorded at {checkpoint_id}"),
            CheckpointAction::Exit => format!("Exit recorded at {checkpoint_id}"),
        };
        Ok(CheckpointPass {
            visitor: VisitorSummary::from(&stored),
            log,
            message,
        })
    }

    pub fn logs(&self, filter: &LogFilter) -> Result<Vec<EntryExitLog>, CheckpointError> {
        Ok(self.repository.logs(filter)?)
    }

    /// Visitors currently recorded inside the region.
    pub fn visitors_inside(&self) -> Result<Vec<VisitorSummary>, CheckpointError> {
        let active = self
            .repository
            .query(&ApplicationFilter::default().statuses(&[ApplicationStatus::Active]))?;
        Ok(active
            .iter()
            .filter(|application| application.is_inside())
            .map(VisitorSummary::from)
            .collect())
    }
}
