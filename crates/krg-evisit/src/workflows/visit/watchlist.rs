//! Supervisor-curated watchlist consulted by screening and at checkpoints.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::clock::Clock;
use super::domain::{Actor, ApplicantIdentity, Role, Severity};
use super::repository::RepositoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchlistFlagType {
    Overstay,
    Fraud,
    SecurityConcern,
    Duplicate,
}

impl WatchlistFlagType {
    pub const fn label(self) -> &'static str {
        match self {
            WatchlistFlagType::Overstay => "OVERSTAY",
            WatchlistFlagType::Fraud => "FRAUD",
            WatchlistFlagType::SecurityConcern => "SECURITY_CONCERN",
            WatchlistFlagType::Duplicate => "DUPLICATE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "OVERSTAY" => Some(Self::Overstay),
            "FRAUD" => Some(Self::Fraud),
            "SECURITY_CONCERN" => Some(Self::SecurityConcern),
            "DUPLICATE" => Some(Self::Duplicate),
            _ => None,
        }
    }
}

impl fmt::Display for WatchlistFlagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Flagged identity. Entries are deactivated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub id: String,
    pub national_id: String,
    pub full_name: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub reason: String,
    pub flag_type: WatchlistFlagType,
    pub severity: Severity,
    pub active: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl WatchlistEntry {
    pub fn is_in_force(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map_or(true, |expires_at| expires_at >= now)
    }

    pub fn matches(&self, keys: &IdentityKeys) -> bool {
        if self.national_id == keys.national_id {
            return true;
        }
        let phone_match = matches!(
            (&self.phone_number, &keys.phone_number),
            (Some(ours), Some(theirs)) if ours == theirs
        );
        let email_match = matches!(
            (&self.email, &keys.email),
            (Some(ours), Some(theirs)) if ours.eq_ignore_ascii_case(theirs)
        );
        phone_match || email_match
    }
}

/// Identifiers a watchlist lookup may match on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentityKeys {
    pub national_id: String,
    pub phone_number: Option<String>,
    pub email: Option<String>,
}

impl IdentityKeys {
    pub fn national_id(national_id: impl Into<String>) -> Self {
        Self {
            national_id: national_id.into(),
            ..Self::default()
        }
    }

    /// Keys used at checkpoints: national id plus e-mail.
    pub fn for_checkpoint(applicant: &ApplicantIdentity) -> Self {
        Self {
            national_id: applicant.national_id.clone(),
            phone_number: None,
            email: applicant.email.clone(),
        }
    }
}

/// Most severe in-force entry among `entries` matching `keys`.
pub fn strongest_match<'a>(
    entries: &'a [WatchlistEntry],
    keys: &IdentityKeys,
    now: DateTime<Utc>,
) -> Option<&'a WatchlistEntry> {
    entries
        .iter()
        .filter(|entry| entry.is_in_force(now) && entry.matches(keys))
        .max_by_key(|entry| (entry.severity, entry.created_at))
}

/// Storage seam for watchlist entries.
pub trait WatchlistRepository: Send + Sync {
    fn insert(&self, entry: WatchlistEntry) -> Result<WatchlistEntry, RepositoryError>;
    /// Deactivates active entries for `national_id`, optionally limited to one flag type.
    fn deactivate(
        &self,
        national_id: &str,
        flag_type: Option<WatchlistFlagType>,
    ) -> Result<usize, RepositoryError>;
    /// Entries sharing any identifier with `keys`, whether or not they are in force.
    fn candidates(&self, keys: &IdentityKeys) -> Result<Vec<WatchlistEntry>, RepositoryError>;
}

/// Supervisor input for a manual watchlist entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWatchlistEntry {
    pub national_id: String,
    pub full_name: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub reason: String,
    pub flag_type: WatchlistFlagType,
    pub severity: Severity,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchlistError {
    #[error("role {0} may not manage the watchlist")]
    Forbidden(Role),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl WatchlistError {
    pub fn code(&self) -> &'static str {
        match self {
            WatchlistError::Forbidden(_) => "FORBIDDEN",
            WatchlistError::Validation(_) => "VALIDATION",
            WatchlistError::Repository(err) => err.code(),
        }
    }
}

/// Watchlist management operations.
pub struct WatchlistRegistry<W> {
    repository: Arc<W>,
    clock: Arc<dyn Clock>,
}

impl<W> WatchlistRegistry<W>
where
    W: WatchlistRepository + 'static,
{
    pub fn new(repository: Arc<W>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }

    fn ensure_curator(actor: &Actor) -> Result<(), WatchlistError> {
        match actor.role {
            Role::Supervisor | Role::Director | Role::Admin => Ok(()),
            other => Err(WatchlistError::Forbidden(other)),
        }
    }

    pub fn add(
        &self,
        actor: &Actor,
        request: NewWatchlistEntry,
    ) -> Result<WatchlistEntry, WatchlistError> {
        Self::ensure_curator(actor)?;
        let now = self.clock.now();

        let national_id = request.national_id.trim().to_string();
        let reason = request.reason.trim().to_string();
        if national_id.is_empty() {
            return Err(WatchlistError::Validation("national_id is required".to_string()));
        }
        if reason.is_empty() {
            return Err(WatchlistError::Validation("reason is required".to_string()));
        }
        if request.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Err(WatchlistError::Validation(
                "expires_at must be in the future".to_string(),
            ));
        }

        let entry = WatchlistEntry {
            id: Uuid::new_v4().to_string(),
            national_id,
            full_name: request.full_name.trim().to_string(),
            phone_number: request.phone_number,
            email: request.email.map(|email| email.trim().to_ascii_lowercase()),
            reason,
            flag_type: request.flag_type,
            severity: request.severity,
            active: true,
            expires_at: request.expires_at,
            created_by: actor.id.clone(),
            created_at: now,
        };

        let stored = self.repository.insert(entry)?;
        info!(
            national_id = %stored.national_id,
            flag_type = %stored.flag_type,
            severity = %stored.severity,
            actor = %actor.id,
            "watchlist entry added"
        );
        Ok(stored)
    }

    pub fn remove(
        &self,
        actor: &Actor,
        national_id: &str,
        flag_type: Option<WatchlistFlagType>,
    ) -> Result<usize, WatchlistError> {
        Self::ensure_curator(actor)?;
        let removed = self.repository.deactivate(national_id.trim(), flag_type)?;
        info!(%national_id, removed, actor = %actor.id, "watchlist entries deactivated");
        Ok(removed)
    }

    /// In-force entry for `keys`, if any.
    pub fn check(&self, keys: &IdentityKeys) -> Result<Option<WatchlistEntry>, WatchlistError> {
        let now = self.clock.now();
        let candidates = self.repository.candidates(keys)?;
        Ok(strongest_match(&candidates, keys, now).cloned())
    }

    /// Every entry ever recorded for a national id, for supervisor review.
    pub fn history(
        &self,
        actor: &Actor,
        national_id: &str,
    ) -> Result<Vec<WatchlistEntry>, WatchlistError> {
        if !actor.role.is_staff() {
            return Err(WatchlistError::Forbidden(actor.role));
        }
        let keys = IdentityKeys::national_id(national_id.trim());
        let mut entries: Vec<_> = self
            .repository
            .candidates(&keys)?
            .into_iter()
            .filter(|entry| entry.national_id == keys.national_id)
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }
}
