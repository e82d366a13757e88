//! Visitor e-permit workflow: intake, security screening, review lifecycle,
//! signed QR permits, and checkpoint verification.

pub mod checkpoint;
pub mod clock;
pub mod domain;
pub(crate) mod intake;
pub mod lifecycle;
pub mod memory;
pub mod permit;
pub mod repository;
pub mod router;
pub mod screening;
pub mod service;
pub mod signature;
pub mod watchlist;

#[cfg(test)]
mod tests;

pub use checkpoint::{
    CheckpointAction, CheckpointDesk, CheckpointError, CheckpointPass, CheckpointRequest,
    VisitorSummary, WatchlistAlert,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::{
    Actor, ApplicantIdentity, Application, ApplicationId, ApplicationStatus,
    ApplicationSubmission, AuditAction, AuditEntry, EntryExitLog, LogType, PriorityLevel,
    ReferenceNumber, Role, ScreeningOverride, Severity, ValidityWindow, VisitDetails,
    VisitPurpose, VisitorLocation,
};
pub use intake::IntakeViolation;
pub use lifecycle::{Action, LifecycleError, Transition, TransitionOutcome};
pub use memory::InMemoryStore;
pub use permit::{IssuedPermit, PermitCodec, PermitError, PermitPayload, QR_FRESHNESS_HOURS};
pub use repository::{
    ApplicationFilter, ApplicationRepository, LogFilter, Notification, NotificationDispatcher,
    NotificationError, NotificationKind, RepositoryError,
};
pub use router::visit_router;
pub use screening::overstay::{OverstayFinding, SweepReport};
pub use screening::{
    RiskAssessment, RiskCheck, RiskFlag, ScreeningConfig, ScreeningRequest, SecurityScreener,
};
pub use service::{
    ApplicationServiceError, ApprovalInput, ApprovalReceipt, DocumentRequest, ListQuery,
    OverrideInput, Page, RejectionInput, ReviewInput, SubmissionReceipt, TrackingView, VisitApplicationService,
    VisitServices,
};
pub use signature::SignatureService;
pub use watchlist::{
    IdentityKeys, NewWatchlistEntry, WatchlistEntry, WatchlistError, WatchlistFlagType,
    WatchlistRegistry, WatchlistRepository,
};
