//! Mutex-guarded in-process storage for applications, logs, audit, and watchlist.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::domain::{Application, ApplicationId, AuditEntry, EntryExitLog, ReferenceNumber};
use super::repository::{
    ApplicationChange, ApplicationFilter, ApplicationRepository, LogFilter, RepositoryError,
};
use super::watchlist::{IdentityKeys, WatchlistEntry, WatchlistFlagType, WatchlistRepository};

#[derive(Default)]
struct StoreState {
    applications: HashMap<ApplicationId, Application>,
    references: HashMap<ReferenceNumber, ApplicationId>,
    sequences: HashMap<i32, u32>,
    logs: Vec<EntryExitLog>,
    audit: Vec<AuditEntry>,
    watchlist: Vec<WatchlistEntry>,
}

/// Single-lock store: every commit is serialized, so a change and its side
/// records become visible together.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, StoreState>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Unavailable("store lock poisoned".to_string()))
    }

    pub fn watchlist_entries(&self) -> Result<Vec<WatchlistEntry>, RepositoryError> {
        Ok(self.state()?.watchlist.clone())
    }
}

impl ApplicationRepository for InMemoryStore {
    fn next_reference_sequence(&self, year: i32) -> Result<u32, RepositoryError> {
        let mut state = self.state()?;
        let sequence = state.sequences.entry(year).or_insert(0);
        *sequence += 1;
        Ok(*sequence)
    }

    fn insert(
        &self,
        mut application: Application,
        audit: AuditEntry,
    ) -> Result<Application, RepositoryError> {
        let mut state = self.state()?;
        if state.applications.contains_key(&application.id)
            || state.references.contains_key(&application.reference_number)
        {
            return Err(RepositoryError::Conflict);
        }
        application.version = 1;
        state
            .references
            .insert(application.reference_number.clone(), application.id.clone());
        state
            .applications
            .insert(application.id.clone(), application.clone());
        state.audit.push(audit);
        Ok(application)
    }

    fn commit(&self, change: ApplicationChange) -> Result<Application, RepositoryError> {
        let mut state = self.state()?;
        let ApplicationChange {
            mut application,
            expected_version,
            audit,
            log,
            watchlist,
        } = change;

        let stored = state
            .applications
            .get(&application.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.version != expected_version {
            return Err(RepositoryError::VersionConflict {
                expected: expected_version,
                found: stored.version,
            });
        }
        if stored.reference_number != application.reference_number {
            return Err(RepositoryError::Conflict);
        }

        application.version = expected_version + 1;
        state
            .applications
            .insert(application.id.clone(), application.clone());
        state.audit.push(audit);
        if let Some(log) = log {
            state.logs.push(log);
        }
        if let Some(entry) = watchlist {
            state.watchlist.push(entry);
        }
        Ok(application)
    }

    fn fetch(&self, id: &ApplicationId) -> Result<Option<Application>, RepositoryError> {
        Ok(self.state()?.applications.get(id).cloned())
    }

    fn fetch_by_reference(
        &self,
        reference: &ReferenceNumber,
    ) -> Result<Option<Application>, RepositoryError> {
        let state = self.state()?;
        Ok(state
            .references
            .get(reference)
            .and_then(|id| state.applications.get(id))
            .cloned())
    }

    fn query(&self, filter: &ApplicationFilter) -> Result<Vec<Application>, RepositoryError> {
        let state = self.state()?;
        let mut matching: Vec<&Application> = state
            .applications
            .values()
            .filter(|application| filter.matches(application))
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.reference_number.cmp(&a.reference_number))
        });
        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn count(&self, filter: &ApplicationFilter) -> Result<usize, RepositoryError> {
        let state = self.state()?;
        Ok(state
            .applications
            .values()
            .filter(|application| filter.matches(application))
            .count())
    }

    fn logs(&self, filter: &LogFilter) -> Result<Vec<EntryExitLog>, RepositoryError> {
        let state = self.state()?;
        Ok(state
            .logs
            .iter()
            .filter(|log| filter.matches(log))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn audit_trail(&self, id: &ApplicationId) -> Result<Vec<AuditEntry>, RepositoryError> {
        let state = self.state()?;
        Ok(state
            .audit
            .iter()
            .filter(|entry| &entry.application_id == id)
            .cloned()
            .collect())
    }
}

impl WatchlistRepository for InMemoryStore {
    fn insert(&self, entry: WatchlistEntry) -> Result<WatchlistEntry, RepositoryError> {
        let mut state = self.state()?;
        if state.watchlist.iter().any(|existing| existing.id == entry.id) {
            return Err(RepositoryError::Conflict);
        }
        state.watchlist.push(entry.clone());
        Ok(entry)
    }

    fn deactivate(
        &self,
        national_id: &str,
        flag_type: Option<WatchlistFlagType>,
    ) -> Result<usize, RepositoryError> {
        let mut state = self.state()?;
        let mut deactivated = 0;
        for entry in state.watchlist.iter_mut().filter(|entry| {
            entry.active
                && entry.national_id == national_id
                && flag_type.map_or(true, |flag_type| entry.flag_type == flag_type)
        }) {
            entry.active = false;
            deactivated += 1;
        }
        Ok(deactivated)
    }

    fn candidates(&self, keys: &IdentityKeys) -> Result<Vec<WatchlistEntry>, RepositoryError> {
        let state = self.state()?;
        Ok(state
            .watchlist
            .iter()
            .filter(|entry| entry.matches(keys))
            .cloned()
            .collect())
    }
}
