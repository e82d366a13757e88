use chrono::{DateTime, Utc};

use super::super::domain::{PriorityLevel, Severity};
use super::{RiskAssessment, RiskFlag};

pub(crate) const MAX_RISK_SCORE: u8 = 100;

/// Sum of flag points, clamped to `0..=100`.
pub(crate) fn score_flags(flags: &[RiskFlag]) -> u8 {
    let total: u32 = flags.iter().map(|flag| u32::from(flag.points)).sum();
    total.min(u32::from(MAX_RISK_SCORE)) as u8
}

pub(crate) const fn severity_for_score(score: u8) -> Severity {
    match score {
        80.. => Severity::Critical,
        50..=79 => Severity::High,
        30..=49 => Severity::Medium,
        _ => Severity::Low,
    }
}

pub(crate) fn assess(flags: Vec<RiskFlag>, now: DateTime<Utc>) -> RiskAssessment {
    let risk_score = score_flags(&flags);
    let severity = severity_for_score(risk_score);
    RiskAssessment {
        risk_score,
        severity,
        passed: severity < Severity::High,
        requires_supervisor_review: severity >= Severity::High,
        requires_manual_review: severity >= Severity::Medium,
        flags,
        screened_at: now,
    }
}

/// Queue priority derived from an assessment.
pub fn priority_for(assessment: &RiskAssessment) -> PriorityLevel {
    if assessment.requires_supervisor_review {
        PriorityLevel::Urgent
    } else if assessment.requires_manual_review {
        PriorityLevel::High
    } else {
        PriorityLevel::Normal
    }
}

/// Adds flags from a fresh assessment to those already recorded, skipping repeats.
pub fn merge_flags(existing: &mut Vec<RiskFlag>, fresh: &[RiskFlag]) {
    for flag in fresh {
        if !existing.contains(flag) {
            existing.push(flag.clone());
        }
    }
}
