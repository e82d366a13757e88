//! Detection of visitors still inside after their permit expired.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::super::domain::{
    Application, ApplicationId, ApplicationStatus, ReferenceNumber, Severity,
};
use super::super::watchlist::{WatchlistEntry, WatchlistFlagType};

/// Days past expiry tolerated before an active visitor is flagged.
pub const GRACE_DAYS: i64 = 3;
pub const WATCHLIST_TTL_DAYS: i64 = 180;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverstayFinding {
    pub application_id: ApplicationId,
    pub reference_number: ReferenceNumber,
    pub overstay_days: u32,
    pub watchlist_severity: Option<Severity>,
}

/// Outcome of one sweep over active applications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub flagged: Vec<OverstayFinding>,
    pub skipped: Vec<SkippedApplication>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedApplication {
    pub application_id: ApplicationId,
    pub reason: String,
}

pub fn watchlist_severity(overstay_days: u32) -> Option<Severity> {
    match overstay_days {
        31.. => Some(Severity::High),
        15..=30 => Some(Severity::Medium),
        8..=14 => Some(Severity::Low),
        _ => None,
    }
}

/// Overstay finding for `application`, if it is active with no exit and past the grace period.
pub fn detect(application: &Application, now: DateTime<Utc>) -> Option<OverstayFinding> {
    if application.status != ApplicationStatus::Active || application.exited_at.is_some() {
        return None;
    }
    let expires_at = application.validity()?.expires_at();
    if expires_at >= now - Duration::days(GRACE_DAYS) {
        return None;
    }

    let overstay_days = u32::try_from((now - expires_at).num_days()).unwrap_or(u32::MAX);
    Some(OverstayFinding {
        application_id: application.id.clone(),
        reference_number: application.reference_number.clone(),
        overstay_days,
        watchlist_severity: watchlist_severity(overstay_days),
    })
}

/// Automatic watchlist entry for a finding that warrants one.
pub fn watchlist_entry(
    application: &Application,
    finding: &OverstayFinding,
    now: DateTime<Utc>,
) -> Option<WatchlistEntry> {
    let severity = finding.watchlist_severity?;
    Some(WatchlistEntry {
        id: Uuid::new_v4().to_string(),
        national_id: application.applicant.national_id.clone(),
        full_name: application.applicant.full_name.clone(),
        phone_number: Some(application.applicant.phone_number.clone()),
        email: application.applicant.email.clone(),
        reason: format!(
            "Overstayed permit {} by {} days",
            application.reference_number, finding.overstay_days
        ),
        flag_type: WatchlistFlagType::Overstay,
        severity,
        active: true,
        expires_at: Some(now + Duration::days(WATCHLIST_TTL_DAYS)),
        created_by: "system".to_string(),
        created_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bands_follow_overstay_length() {
        assert_eq!(watchlist_severity(7), None);
        assert_eq!(watchlist_severity(8), Some(Severity::Low));
        assert_eq!(watchlist_severity(14), Some(Severity::Low));
        assert_eq!(watchlist_severity(15), Some(Severity::Medium));
        assert_eq!(watchlist_severity(30), Some(Severity::Medium));
        assert_eq!(watchlist_severity(31), Some(Severity::High));
    }
}
