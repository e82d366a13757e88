//! Additive risk scoring over watchlist, history, and pattern checks.

mod config;
pub mod overstay;
mod policy;
mod rules;

pub use config::ScreeningConfig;
pub use policy::{merge_flags, priority_for};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::domain::{ApplicantIdentity, Application, ApplicationId, Severity};
use super::repository::{ApplicationFilter, ApplicationRepository, RepositoryError};
use super::watchlist::{IdentityKeys, WatchlistEntry, WatchlistRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskCheck {
    Watchlist,
    Duplicate,
    RecentRejection,
    OverstayHistory,
    SuspiciousPattern,
}

impl fmt::Display for RiskCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RiskCheck::Watchlist => "WATCHLIST",
            RiskCheck::Duplicate => "DUPLICATE",
            RiskCheck::RecentRejection => "RECENT_REJECTION",
            RiskCheck::OverstayHistory => "OVERSTAY_HISTORY",
            RiskCheck::SuspiciousPattern => "SUSPICIOUS_PATTERN",
        };
        f.write_str(label)
    }
}

/// One triggered check, kept for audit display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFlag {
    pub check: RiskCheck,
    pub points: u8,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_score: u8,
    pub severity: Severity,
    pub passed: bool,
    pub requires_supervisor_review: bool,
    pub requires_manual_review: bool,
    pub flags: Vec<RiskFlag>,
    pub screened_at: DateTime<Utc>,
}

impl RiskAssessment {
    pub fn summary(&self) -> String {
        if self.flags.is_empty() {
            return format!("risk score {} ({}), no checks triggered", self.risk_score, self.severity);
        }
        let details: Vec<&str> = self.flags.iter().map(|flag| flag.detail.as_str()).collect();
        format!(
            "risk score {} ({}): {}",
            self.risk_score,
            self.severity,
            details.join("; ")
        )
    }
}

/// Identity under screening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreeningRequest {
    pub national_id: String,
    pub phone_number: String,
    pub full_name: String,
    /// Application being re-screened, excluded from its own duplicate check.
    #[serde(default)]
    pub exclude: Option<ApplicationId>,
}

impl ScreeningRequest {
    pub fn for_applicant(applicant: &ApplicantIdentity) -> Self {
        Self {
            national_id: applicant.national_id.clone(),
            phone_number: applicant.phone_number.clone(),
            full_name: applicant.full_name.clone(),
            exclude: None,
        }
    }

    pub fn for_application(application: &Application) -> Self {
        Self {
            exclude: Some(application.id.clone()),
            ..Self::for_applicant(&application.applicant)
        }
    }
}

/// Records the checks run against.
#[derive(Debug, Clone, Default)]
pub struct ScreeningEvidence {
    pub watchlist: Vec<WatchlistEntry>,
    pub same_identity: Vec<Application>,
    pub same_phone: Vec<Application>,
}

/// Stateless scoring over a consistent evidence snapshot.
pub fn assess(
    request: &ScreeningRequest,
    evidence: &ScreeningEvidence,
    config: &ScreeningConfig,
    now: DateTime<Utc>,
) -> RiskAssessment {
    let flags = rules::triggered_flags(request, evidence, config, now);
    policy::assess(flags, now)
}

/// Gathers screening evidence from storage and scores it.
pub struct SecurityScreener<R, W> {
    applications: Arc<R>,
    watchlist: Arc<W>,
    config: ScreeningConfig,
}

impl<R, W> SecurityScreener<R, W>
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
{
    pub fn new(applications: Arc<R>, watchlist: Arc<W>, config: ScreeningConfig) -> Self {
        Self {
            applications,
            watchlist,
            config,
        }
    }

    pub fn config(&self) -> &ScreeningConfig {
        &self.config
    }

    pub fn screen(
        &self,
        request: &ScreeningRequest,
        now: DateTime<Utc>,
    ) -> Result<RiskAssessment, RepositoryError> {
        let evidence = self.gather(request, now)?;
        let assessment = assess(request, &evidence, &self.config, now);
        debug!(
            national_id = %request.national_id,
            risk_score = assessment.risk_score,
            severity = %assessment.severity,
            flags = assessment.flags.len(),
            "screening completed"
        );
        Ok(assessment)
    }

    fn gather(
        &self,
        request: &ScreeningRequest,
        now: DateTime<Utc>,
    ) -> Result<ScreeningEvidence, RepositoryError> {
        let watchlist = self
            .watchlist
            .candidates(&IdentityKeys::national_id(request.national_id.clone()))?;
        let same_identity = self.applications.query(
            &ApplicationFilter::default()
                .national_id(request.national_id.clone())
                .excluding(request.exclude.clone()),
        )?;
        let same_phone = self.applications.query(
            &ApplicationFilter::default()
                .phone_number(request.phone_number.clone())
                .created_since(now - Duration::days(self.config.phone_pattern_window_days)),
        )?;

        Ok(ScreeningEvidence {
            watchlist,
            same_identity,
            same_phone,
        })
    }
}
