use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    Application, ApplicationId, ApplicationStatus, AuditEntry, EntryExitLog, LogType,
    ReferenceNumber, VisitorLocation,
};
use super::watchlist::WatchlistEntry;

/// Errors surfaced by the persistence layer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("application already exists")]
    Conflict,
    #[error("application not found")]
    NotFound,
    #[error("application changed concurrently (expected version {expected}, found {found})")]
    VersionConflict { expected: u64, found: u64 },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    pub fn code(&self) -> &'static str {
        match self {
            RepositoryError::Conflict | RepositoryError::VersionConflict { .. } => "CONFLICT",
            RepositoryError::NotFound => "NOT_FOUND",
            RepositoryError::Unavailable(_) => "STORAGE_FAILURE",
        }
    }
}

/// A state change committed atomically: the application, its audit entry, and
/// any checkpoint log or watchlist entry produced by the same transition.
#[derive(Debug, Clone)]
pub struct ApplicationChange {
    pub application: Application,
    pub expected_version: u64,
    pub audit: AuditEntry,
    pub log: Option<EntryExitLog>,
    /// Written to the watchlist held by the same store; implementors that commit
    /// changes must also implement `WatchlistRepository` over that data.
    pub watchlist: Option<WatchlistEntry>,
}

/// Criteria for application queries. Empty fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationFilter {
    pub national_id: Option<String>,
    pub phone_number: Option<String>,
    pub statuses: Vec<ApplicationStatus>,
    pub created_since: Option<DateTime<Utc>>,
    pub assigned_officer_id: Option<String>,
    pub exclude: Option<ApplicationId>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ApplicationFilter {
    pub fn national_id(mut self, national_id: impl Into<String>) -> Self {
        self.national_id = Some(national_id.into());
        self
    }

    pub fn phone_number(mut self, phone_number: impl Into<String>) -> Self {
        self.phone_number = Some(phone_number.into());
        self
    }

    pub fn statuses(mut self, statuses: &[ApplicationStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn created_since(mut self, since: DateTime<Utc>) -> Self {
        self.created_since = Some(since);
        self
    }

    pub fn excluding(mut self, id: Option<ApplicationId>) -> Self {
        self.exclude = id;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// Whether `application` satisfies every criterion except paging.
    pub fn matches(&self, application: &Application) -> bool {
        if let Some(national_id) = &self.national_id {
            if &application.applicant.national_id != national_id {
                return false;
            }
        }
        if let Some(phone_number) = &self.phone_number {
            if &application.applicant.phone_number != phone_number {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&application.status) {
            return false;
        }
        if let Some(since) = self.created_since {
            if application.created_at < since {
                return false;
            }
        }
        if let Some(officer) = &self.assigned_officer_id {
            if application.assigned_officer_id.as_ref() != Some(officer) {
                return false;
            }
        }
        if let Some(excluded) = &self.exclude {
            if &application.id == excluded {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    #[serde(default)]
    pub application_id: Option<ApplicationId>,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub log_type: Option<LogType>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn for_application(id: ApplicationId) -> Self {
        Self {
            application_id: Some(id),
            ..Self::default()
        }
    }

    pub fn matches(&self, log: &EntryExitLog) -> bool {
        self.application_id
            .as_ref()
            .map_or(true, |id| &log.application_id == id)
            && self
                .checkpoint_id
                .as_ref()
                .map_or(true, |checkpoint| &log.checkpoint_id == checkpoint)
            && self.log_type.map_or(true, |log_type| log.log_type == log_type)
            && self.since.map_or(true, |since| log.recorded_at >= since)
    }
}

/// Storage seam for applications and everything committed alongside them.
pub trait ApplicationRepository: Send + Sync {
    /// Atomically allocates the next reference sequence for `year`, starting at 1.
    fn next_reference_sequence(&self, year: i32) -> Result<u32, RepositoryError>;
    fn insert(
        &self,
        application: Application,
        audit: AuditEntry,
    ) -> Result<Application, RepositoryError>;
    /// Persists `change` only if the stored version still equals `expected_version`.
    fn commit(&self, change: ApplicationChange) -> Result<Application, RepositoryError>;
    fn fetch(&self, id: &ApplicationId) -> Result<Option<Application>, RepositoryError>;
    fn fetch_by_reference(
        &self,
        reference: &ReferenceNumber,
    ) -> Result<Option<Application>, RepositoryError>;
    /// Matching applications, newest first, with the filter's paging applied.
    fn query(&self, filter: &ApplicationFilter) -> Result<Vec<Application>, RepositoryError>;
    fn count(&self, filter: &ApplicationFilter) -> Result<usize, RepositoryError>;
    /// Matching logs in recording order.
    fn logs(&self, filter: &LogFilter) -> Result<Vec<EntryExitLog>, RepositoryError>;
    fn audit_trail(&self, id: &ApplicationId) -> Result<Vec<AuditEntry>, RepositoryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Submitted,
    Approved,
    Rejected,
    DocumentsRequested,
    EntryRecorded,
}

/// Message handed to the outbound notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub application_id: ApplicationId,
    pub reference_number: ReferenceNumber,
    pub recipient_name: String,
    pub recipient_phone: String,
    #[serde(default)]
    pub recipient_email: Option<String>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl Notification {
    pub fn for_application(kind: NotificationKind, application: &Application) -> Self {
        Self {
            kind,
            application_id: application.id.clone(),
            reference_number: application.reference_number.clone(),
            recipient_name: application.applicant.full_name.clone(),
            recipient_phone: application.applicant.phone_number.clone(),
            recipient_email: application.applicant.email.clone(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Notification for `kind` carrying the details the applicant needs.
    pub fn describing(kind: NotificationKind, application: &Application) -> Self {
        let notification = Self::for_application(kind, application);
        match kind {
            NotificationKind::Submitted => notification,
            NotificationKind::Approved => match (&application.approval, &application.permit) {
                (Some(approval), Some(permit)) => notification
                    .with_detail("valid_from", approval.validity.valid_from.to_string())
                    .with_detail("valid_until", approval.validity.valid_until.to_string())
                    .with_detail("permit_payload", permit.payload.clone()),
                _ => notification,
            },
            NotificationKind::Rejected => match &application.rejection {
                Some(rejection) => notification.with_detail("reason", rejection.reason.clone()),
                None => notification,
            },
            NotificationKind::DocumentsRequested => {
                notification.with_detail("documents", application.requested_documents.join(", "))
            }
            NotificationKind::EntryRecorded => match &application.location {
                VisitorLocation::Inside { checkpoint_id } => {
                    notification.with_detail("checkpoint_id", checkpoint_id.clone())
                }
                _ => notification,
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification transport failed: {0}")]
    Transport(String),
}

/// Outbound applicant notifications (SMS/e-mail gateways live behind this).
pub trait NotificationDispatcher: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<(), NotificationError>;
}
