use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use super::super::domain::{Application, ApplicationStatus, Severity};
use super::super::watchlist::{strongest_match, IdentityKeys};
use super::config::ScreeningConfig;
use super::{RiskCheck, RiskFlag, ScreeningEvidence, ScreeningRequest};

pub(crate) const WATCHLIST_CRITICAL_POINTS: u8 = 80;
pub(crate) const WATCHLIST_HIGH_POINTS: u8 = 50;
pub(crate) const WATCHLIST_MEDIUM_POINTS: u8 = 30;
pub(crate) const WATCHLIST_LOW_POINTS: u8 = 15;
pub(crate) const DUPLICATE_POINTS: u8 = 40;
pub(crate) const RECENT_REJECTION_POINTS: u8 = 25;
pub(crate) const OVERSTAY_HISTORY_POINTS: u8 = 35;
pub(crate) const SUSPICIOUS_PATTERN_POINTS: u8 = 30;

/// Statuses that make an earlier application count as a live duplicate.
pub(crate) const DUPLICATE_STATUSES: [ApplicationStatus; 4] = [
    ApplicationStatus::Submitted,
    ApplicationStatus::UnderReview,
    ApplicationStatus::Approved,
    ApplicationStatus::Active,
];

pub(crate) const fn watchlist_points(severity: Severity) -> u8 {
    match severity {
        Severity::Critical => WATCHLIST_CRITICAL_POINTS,
        Severity::High => WATCHLIST_HIGH_POINTS,
        Severity::Medium => WATCHLIST_MEDIUM_POINTS,
        Severity::Low => WATCHLIST_LOW_POINTS,
    }
}

pub(crate) fn triggered_flags(
    request: &ScreeningRequest,
    evidence: &ScreeningEvidence,
    config: &ScreeningConfig,
    now: DateTime<Utc>,
) -> Vec<RiskFlag> {
    let history: Vec<&Application> = evidence
        .same_identity
        .iter()
        .filter(|application| {
            application.applicant.national_id == request.national_id
                && Some(&application.id) != request.exclude.as_ref()
        })
        .collect();

    [
        watchlist_flag(request, evidence, now),
        duplicate_flag(&history, config, now),
        recent_rejection_flag(&history, config, now),
        overstay_history_flag(&history, config),
        suspicious_pattern_flag(request, evidence, config, now),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn watchlist_flag(
    request: &ScreeningRequest,
    evidence: &ScreeningEvidence,
    now: DateTime<Utc>,
) -> Option<RiskFlag> {
    let keys = IdentityKeys::national_id(request.national_id.clone());
    let entry = strongest_match(&evidence.watchlist, &keys, now)?;
    Some(RiskFlag {
        check: RiskCheck::Watchlist,
        points: watchlist_points(entry.severity),
        detail: format!("WATCHLIST: {} - {}", entry.flag_type, entry.reason),
    })
}

fn duplicate_flag(
    history: &[&Application],
    config: &ScreeningConfig,
    now: DateTime<Utc>,
) -> Option<RiskFlag> {
    let since = now - Duration::days(config.duplicate_window_days);
    let existing = history
        .iter()
        .filter(|application| {
            application.created_at >= since && DUPLICATE_STATUSES.contains(&application.status)
        })
        .max_by_key(|application| application.created_at)?;
    Some(RiskFlag {
        check: RiskCheck::Duplicate,
        points: DUPLICATE_POINTS,
        detail: format!(
            "DUPLICATE: application {} already exists",
            existing.reference_number
        ),
    })
}

fn recent_rejection_flag(
    history: &[&Application],
    config: &ScreeningConfig,
    now: DateTime<Utc>,
) -> Option<RiskFlag> {
    let since = now - Duration::days(config.rejection_window_days);
    let rejected_at = history
        .iter()
        .filter(|application| application.status == ApplicationStatus::Rejected)
        .filter_map(|application| application.rejection.as_ref())
        .map(|rejection| rejection.rejected_at)
        .filter(|rejected_at| *rejected_at >= since)
        .max()?;
    Some(RiskFlag {
        check: RiskCheck::RecentRejection,
        points: RECENT_REJECTION_POINTS,
        detail: format!("RECENT_REJECTION: rejected on {}", rejected_at.date_naive()),
    })
}

fn overstay_history_flag(history: &[&Application], config: &ScreeningConfig) -> Option<RiskFlag> {
    let days = history
        .iter()
        .filter_map(|application| application.overstay_days)
        .filter(|days| *days > config.overstay_history_min_days)
        .max()?;
    Some(RiskFlag {
        check: RiskCheck::OverstayHistory,
        points: OVERSTAY_HISTORY_POINTS,
        detail: format!("OVERSTAY_HISTORY: {days} days overstay"),
    })
}

fn suspicious_pattern_flag(
    request: &ScreeningRequest,
    evidence: &ScreeningEvidence,
    config: &ScreeningConfig,
    now: DateTime<Utc>,
) -> Option<RiskFlag> {
    let since = now - Duration::days(config.phone_pattern_window_days);
    let identities: BTreeSet<&str> = evidence
        .same_phone
        .iter()
        .filter(|application| {
            application.applicant.phone_number == request.phone_number
                && application.applicant.national_id != request.national_id
                && application.created_at >= since
        })
        .map(|application| application.applicant.national_id.as_str())
        .collect();

    (identities.len() >= config.phone_pattern_min_identities).then(|| RiskFlag {
        check: RiskCheck::SuspiciousPattern,
        points: SUSPICIOUS_PATTERN_POINTS,
        detail: format!(
            "SUSPICIOUS: {} different IDs using same phone",
            identities.len()
        ),
    })
}
