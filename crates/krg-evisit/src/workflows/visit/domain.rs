use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::screening::RiskFlag;

/// Opaque internal identifier of an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationId(pub String);

impl ApplicationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Applicant-facing tracking number, `KRG-<year>-<6-digit sequence>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceNumber(String);

impl ReferenceNumber {
    pub const PREFIX: &'static str = "KRG";
    pub const MAX_SEQUENCE: u32 = 999_999;

    /// Returns `None` once the yearly sequence no longer fits in six digits.
    pub fn new(year: i32, sequence: u32) -> Option<Self> {
        if !(0..=9999).contains(&year) || sequence == 0 || sequence > Self::MAX_SEQUENCE {
            return None;
        }
        Some(Self(format!("{}-{year:04}-{sequence:06}", Self::PREFIX)))
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().splitn(3, '-');
        let prefix = parts.next()?;
        let year = parts.next()?;
        let sequence = parts.next()?;
        if prefix != Self::PREFIX
            || year.len() != 4
            || sequence.len() != 6
            || !year.bytes().chain(sequence.bytes()).all(|b| b.is_ascii_digit())
        {
            return None;
        }
        Self::new(year.parse().ok()?, sequence.parse().ok()?)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn year(&self) -> i32 {
        self.0
            .get(4..8)
            .and_then(|year| year.parse().ok())
            .unwrap_or_default()
    }

    pub fn sequence(&self) -> u32 {
        self.0
            .get(9..)
            .and_then(|sequence| sequence.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for ReferenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status tracked throughout the application lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Submitted,
    Assigned,
    UnderReview,
    PendingDocuments,
    Approved,
    Rejected,
    Active,
    Completed,
    Overstayed,
}

impl ApplicationStatus {
    pub const fn label(self) -> &'static str {
        match self {
            ApplicationStatus::Submitted => "SUBMITTED",
            ApplicationStatus::Assigned => "ASSIGNED",
            ApplicationStatus::UnderReview => "UNDER_REVIEW",
            ApplicationStatus::PendingDocuments => "PENDING_DOCUMENTS",
            ApplicationStatus::Approved => "APPROVED",
            ApplicationStatus::Rejected => "REJECTED",
            ApplicationStatus::Active => "ACTIVE",
            ApplicationStatus::Completed => "COMPLETED",
            ApplicationStatus::Overstayed => "OVERSTAYED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        const ALL: [ApplicationStatus; 9] = [
            ApplicationStatus::Submitted,
            ApplicationStatus::Assigned,
            ApplicationStatus::UnderReview,
            ApplicationStatus::PendingDocuments,
            ApplicationStatus::Approved,
            ApplicationStatus::Rejected,
            ApplicationStatus::Active,
            ApplicationStatus::Completed,
            ApplicationStatus::Overstayed,
        ];
        let wanted = raw.trim().to_ascii_uppercase();
        ALL.into_iter().find(|status| status.label() == wanted)
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityLevel {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VisitPurpose {
    Tourism,
    Business,
    FamilyVisit,
    Medical,
    Education,
    Other,
}

/// Shared severity scale for risk assessments and watchlist entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const fn label(self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity fields supplied by the applicant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicantIdentity {
    pub national_id: String,
    pub full_name: String,
    pub phone_number: String,
    #[serde(default)]
    pub email: Option<String>,
    pub date_of_birth: NaiveDate,
    pub nationality: String,
}

/// Trip details declared on the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitDetails {
    pub origin_governorate: String,
    pub destination_governorate: String,
    pub purpose: VisitPurpose,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub declared_accommodation: Option<String>,
}

/// Inbound application payload prior to intake validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSubmission {
    pub applicant: ApplicantIdentity,
    pub visit: VisitDetails,
}

/// Inclusive range of calendar days (UTC) on which the permit authorizes presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub valid_from: NaiveDate,
    pub valid_until: NaiveDate,
}

impl ValidityWindow {
    pub fn new(valid_from: NaiveDate, valid_until: NaiveDate) -> Option<Self> {
        (valid_from <= valid_until).then_some(Self {
            valid_from,
            valid_until,
        })
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        self.valid_from <= today && today <= self.valid_until
    }

    /// First instant after the last valid day.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let next_day = self.valid_until + Duration::days(1);
        Utc.from_utc_datetime(&next_day.and_time(chrono::NaiveTime::MIN))
    }
}

/// Role carried by the caller of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Officer,
    Supervisor,
    Director,
    CheckpointOfficer,
    Admin,
    System,
}

impl Role {
    pub const fn label(self) -> &'static str {
        match self {
            Role::Officer => "OFFICER",
            Role::Supervisor => "SUPERVISOR",
            Role::Director => "DIRECTOR",
            Role::CheckpointOfficer => "CHECKPOINT_OFFICER",
            Role::Admin => "ADMIN",
            Role::System => "SYSTEM",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "OFFICER" => Some(Role::Officer),
            "SUPERVISOR" => Some(Role::Supervisor),
            "DIRECTOR" => Some(Role::Director),
            "CHECKPOINT_OFFICER" | "CHECKPOINT" => Some(Role::CheckpointOfficer),
            "ADMIN" => Some(Role::Admin),
            "SYSTEM" => Some(Role::System),
            _ => None,
        }
    }

    /// Roles allowed to read internal application data.
    pub const fn is_staff(self) -> bool {
        !matches!(self, Role::CheckpointOfficer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Authenticated caller identity attached to every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn system() -> Self {
        Self::new("system", Role::System)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub reviewer_id: String,
    pub notes: String,
    #[serde(default)]
    pub recommendation: Option<String>,
    pub reviewed_at: DateTime<Utc>,
}

/// Supervisor sign-off that lets a director approve despite a failed screening.
///
/// Granted against the risk score at the time; a later screening that scores
/// higher is not covered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreeningOverride {
    pub supervisor_id: String,
    pub justification: String,
    pub risk_score: u8,
    pub granted_at: DateTime<Utc>,
}

impl ScreeningOverride {
    pub fn covers(&self, risk_score: u8) -> bool {
        risk_score <= self.risk_score
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    pub validity: ValidityWindow,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub screening_override: Option<ScreeningOverride>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub rejected_by: String,
    pub rejected_at: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Signed permit minted on approval. The QR image is re-rendered from `payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermitRecord {
    pub payload: String,
    pub signature: String,
    pub issued_at: DateTime<Utc>,
}

/// Where the visitor is relative to the region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VisitorLocation {
    NotEntered,
    Inside { checkpoint_id: String },
    Exited { checkpoint_id: String },
}

/// Aggregate root for a visit application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    pub reference_number: ReferenceNumber,
    pub applicant: ApplicantIdentity,
    pub visit: VisitDetails,
    pub status: ApplicationStatus,
    pub priority: PriorityLevel,
    pub assigned_officer_id: Option<String>,
    pub risk_score: u8,
    pub risk_severity: Severity,
    pub risk_flags: Vec<RiskFlag>,
    pub review: Option<ReviewRecord>,
    pub approval: Option<ApprovalRecord>,
    pub rejection: Option<RejectionRecord>,
    pub requested_documents: Vec<String>,
    pub permit: Option<PermitRecord>,
    pub location: VisitorLocation,
    pub entered_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub overstay_days: Option<u32>,
    /// Supervisor override recorded while under review, consumed by approval.
    #[serde(default)]
    pub screening_override: Option<ScreeningOverride>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped by every committed change.
    pub version: u64,
}

impl Application {
    pub fn validity(&self) -> Option<ValidityWindow> {
        self.approval.as_ref().map(|approval| approval.validity)
    }

    pub fn is_inside(&self) -> bool {
        matches!(self.location, VisitorLocation::Inside { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    Entry,
    Exit,
}

/// Immutable checkpoint record, one per accepted entry or exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryExitLog {
    pub id: String,
    pub application_id: ApplicationId,
    pub log_type: LogType,
    pub checkpoint_id: String,
    pub officer_id: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Submit,
    Rescreen,
    OverrideScreening,
    Assign,
    Review,
    Approve,
    Reject,
    RequestDocuments,
    ResumeReview,
    CheckpointEntry,
    CheckpointExit,
    FlagOverstay,
}

/// Audit trail entry committed together with the state change it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub application_id: ApplicationId,
    pub action: AuditAction,
    pub actor_id: String,
    pub at: DateTime<Utc>,
    pub details: BTreeMap<String, String>,
}
