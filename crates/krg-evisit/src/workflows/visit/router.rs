use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::checkpoint::{CheckpointError, CheckpointRequest};
use super::domain::{Actor, ApplicationId, ApplicationSubmission, Role};
use super::repository::{ApplicationRepository, LogFilter, NotificationDispatcher};
use super::screening::ScreeningRequest;
use super::service::{
    ApplicationServiceError, ApprovalInput, DocumentRequest, ListQuery, OverrideInput,
    RejectionInput, ReviewInput, VisitServices,
};
use super::watchlist::{
    IdentityKeys, NewWatchlistEntry, WatchlistError, WatchlistFlagType, WatchlistRepository,
};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

/// Error body shared by every handler: `{"error": {"code", "message", "details"?}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: status_for(code),
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

/// HTTP status for a machine-readable error code.
pub fn status_for(code: &str) -> StatusCode {
    match code {
        "VALIDATION" => StatusCode::UNPROCESSABLE_ENTITY,
        "UNAUTHENTICATED" => StatusCode::UNAUTHORIZED,
        "NOT_FOUND" | "APPLICATION_NOT_FOUND" => StatusCode::NOT_FOUND,
        "FORBIDDEN" | "NOT_APPROVED" | "PERMIT_EXPIRED" | "WATCHLIST_ALERT" => {
            StatusCode::FORBIDDEN
        }
        "INVALID_STATE_TRANSITION" | "ALREADY_INSIDE" | "NOT_INSIDE" | "CONFLICT" => {
            StatusCode::CONFLICT
        }
        "SECURITY_GATE" => StatusCode::LOCKED,
        "INVALID_QR" => StatusCode::BAD_REQUEST,
        "STORAGE_FAILURE" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = self.details {
            error["details"] = details;
        }
        (self.status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<ApplicationServiceError> for ApiError {
    fn from(err: ApplicationServiceError) -> Self {
        let api = ApiError::new(err.code(), err.to_string());
        match err {
            ApplicationServiceError::SecurityGate { assessment } => {
                api.with_details(json!(assessment))
            }
            _ => api,
        }
    }
}

impl From<CheckpointError> for ApiError {
    fn from(err: CheckpointError) -> Self {
        let api = ApiError::new(err.code(), err.to_string());
        match err {
            CheckpointError::InvalidQr(reason) => api.with_details(json!({
                "reason": reason.code(),
            })),
            CheckpointError::WatchlistAlert(alert) => api.with_details(json!(alert)),
            CheckpointError::NotApproved(status) => api.with_details(json!({
                "status": status,
            })),
            _ => api,
        }
    }
}

impl From<WatchlistError> for ApiError {
    fn from(err: WatchlistError) -> Self {
        ApiError::new(err.code(), err.to_string())
    }
}

/// Actor from the identity headers set by the upstream gateway.
pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let id = headers
        .get(ACTOR_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::new("UNAUTHENTICATED", "missing X-Actor-Id header"))?;
    let role = headers
        .get(ACTOR_ROLE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(Role::parse)
        .ok_or_else(|| ApiError::new("UNAUTHENTICATED", "missing or unknown X-Actor-Role header"))?;
    Ok(Actor::new(id, role))
}

type ApiResult = Result<Response, ApiError>;

/// Router exposing intake, review, checkpoint, watchlist, and sweep endpoints.
pub fn visit_router<R, W, N>(services: VisitServices<R, W, N>) -> Router
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    Router::new()
        .route(
            "/api/v1/applications",
            post(submit_handler::<R, W, N>).get(list_handler::<R, W, N>),
        )
        .route(
            "/api/v1/applications/:application_id",
            get(get_handler::<R, W, N>),
        )
        .route(
            "/api/v1/applications/:application_id/audit",
            get(audit_handler::<R, W, N>),
        )
        .route(
            "/api/v1/applications/:application_id/screening",
            post(rescreen_handler::<R, W, N>),
        )
        .route(
            "/api/v1/applications/:application_id/assign",
            post(assign_handler::<R, W, N>),
        )
        .route(
            "/api/v1/applications/:application_id/review",
            post(review_handler::<R, W, N>),
        )
        .route(
            "/api/v1/applications/:application_id/override",
            post(override_handler::<R, W, N>),
        )
        .route(
            "/api/v1/applications/:application_id/approve",
            post(approve_handler::<R, W, N>),
        )
        .route(
            "/api/v1/applications/:application_id/reject",
            post(reject_handler::<R, W, N>),
        )
        .route(
            "/api/v1/applications/:application_id/documents",
            post(request_documents_handler::<R, W, N>),
        )
        .route(
            "/api/v1/applications/:application_id/resume",
            post(resume_handler::<R, W, N>),
        )
        .route(
            "/api/v1/applications/:application_id/permit",
            post(permit_handler::<R, W, N>),
        )
        .route("/api/v1/track/:reference", get(track_handler::<R, W, N>))
        .route("/api/v1/screening", post(screen_handler::<R, W, N>))
        .route(
            "/api/v1/checkpoint/verify",
            post(checkpoint_verify_handler::<R, W, N>),
        )
        .route(
            "/api/v1/checkpoint/logs",
            get(checkpoint_logs_handler::<R, W, N>),
        )
        .route(
            "/api/v1/checkpoint/inside",
            get(visitors_inside_handler::<R, W, N>),
        )
        .route(
            "/api/v1/watchlist",
            post(watchlist_add_handler::<R, W, N>),
        )
        .route(
            "/api/v1/watchlist/:national_id",
            get(watchlist_history_handler::<R, W, N>).delete(watchlist_remove_handler::<R, W, N>),
        )
        .route(
            "/api/v1/overstays/sweep",
            post(overstay_sweep_handler::<R, W, N>),
        )
        .with_state(services)
}

pub(crate) async fn submit_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    Json(submission): Json<ApplicationSubmission>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let receipt = services.applications.submit(submission)?;
    let body = json!({
        "id": receipt.application.id,
        "reference_number": receipt.application.reference_number,
        "status": receipt.application.status,
        "priority": receipt.application.priority,
        "risk_score": receipt.assessment.risk_score,
        "severity": receipt.assessment.severity,
        "requires_manual_review": receipt.assessment.requires_manual_review,
    });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

async fn list_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let page = services.applications.list(&actor, &query)?;
    Ok(Json(page).into_response())
}

async fn get_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let application = services
        .applications
        .get(&actor, &ApplicationId(application_id))?;
    Ok(Json(application).into_response())
}

async fn audit_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let trail = services
        .applications
        .audit_trail(&actor, &ApplicationId(application_id))?;
    Ok(Json(trail).into_response())
}

async fn rescreen_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let receipt = services
        .applications
        .rescreen(&actor, &ApplicationId(application_id))?;
    Ok(Json(receipt).into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct AssignBody {
    officer_id: String,
}

async fn assign_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
    Json(body): Json<AssignBody>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let application =
        services
            .applications
            .assign(&actor, &ApplicationId(application_id), &body.officer_id)?;
    Ok(Json(application).into_response())
}

async fn review_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
    Json(input): Json<ReviewInput>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let application = services
        .applications
        .review(&actor, &ApplicationId(application_id), input)?;
    Ok(Json(application).into_response())
}

async fn override_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
    Json(input): Json<OverrideInput>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let application =
        services
            .applications
            .override_screening(&actor, &ApplicationId(application_id), input)?;
    Ok(Json(application).into_response())
}

pub(crate) async fn approve_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
    Json(input): Json<ApprovalInput>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let receipt = services
        .applications
        .approve(&actor, &ApplicationId(application_id), input)?;
    let body = json!({
        "application": receipt.application,
        "assessment": receipt.assessment,
        "permit": {
            "payload": receipt.permit.raw,
            "issued_at": receipt.permit.issued_at,
            "qr_image": receipt.permit.image.data_url(),
        },
    });
    Ok(Json(body).into_response())
}

async fn reject_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
    Json(input): Json<RejectionInput>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let application = services
        .applications
        .reject(&actor, &ApplicationId(application_id), input)?;
    Ok(Json(application).into_response())
}

async fn request_documents_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
    Json(request): Json<DocumentRequest>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let application =
        services
            .applications
            .request_documents(&actor, &ApplicationId(application_id), request)?;
    Ok(Json(application).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ResumeBody {
    #[serde(default)]
    notes: Option<String>,
}

async fn resume_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
    Json(body): Json<ResumeBody>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let application =
        services
            .applications
            .resume_review(&actor, &ApplicationId(application_id), body.notes)?;
    Ok(Json(application).into_response())
}

async fn permit_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let permit = services
        .applications
        .issue_permit(&actor, &ApplicationId(application_id))?;
    let body = json!({
        "payload": permit.raw,
        "issued_at": permit.issued_at,
        "qr_image": permit.image.data_url(),
    });
    Ok(Json(body).into_response())
}

async fn track_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    Path(reference): Path<String>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let view = services.applications.track(&reference)?;
    Ok(Json(view).into_response())
}

async fn screen_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Json(request): Json<ScreeningRequest>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let assessment = services.applications.screen(&actor, &request)?;
    Ok(Json(assessment).into_response())
}

pub(crate) async fn checkpoint_verify_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Json(request): Json<CheckpointRequest>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let pass = services.checkpoint.verify(&actor, request)?;
    Ok(Json(pass).into_response())
}

async fn checkpoint_logs_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Query(filter): Query<LogFilter>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    actor_from_headers(&headers)?;
    let logs = services.checkpoint.logs(&filter)?;
    Ok(Json(logs).into_response())
}

async fn visitors_inside_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    actor_from_headers(&headers)?;
    let visitors = services.checkpoint.visitors_inside()?;
    Ok(Json(visitors).into_response())
}

async fn watchlist_add_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Json(request): Json<NewWatchlistEntry>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let entry = services.watchlist.add(&actor, request)?;
    Ok((StatusCode::CREATED, Json(entry)).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WatchlistRemoveQuery {
    #[serde(default)]
    flag_type: Option<String>,
}

async fn watchlist_remove_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Path(national_id): Path<String>,
    Query(query): Query<WatchlistRemoveQuery>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let flag_type = match query.flag_type.as_deref() {
        Some(raw) => Some(WatchlistFlagType::parse(raw).ok_or_else(|| {
            ApiError::new("VALIDATION", format!("unknown watchlist flag type {raw:?}"))
        })?),
        None => None,
    };
    let removed = services.watchlist.remove(&actor, &national_id, flag_type)?;
    Ok(Json(json!({ "deactivated": removed })).into_response())
}

async fn watchlist_history_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
    Path(national_id): Path<String>,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    let entries = services.watchlist.history(&actor, &national_id)?;
    let active = services
        .watchlist
        .check(&IdentityKeys::national_id(national_id.trim()))?;
    Ok(Json(json!({ "active": active, "entries": entries })).into_response())
}

async fn overstay_sweep_handler<R, W, N>(
    State(services): State<VisitServices<R, W, N>>,
    headers: HeaderMap,
) -> ApiResult
where
    R: ApplicationRepository + 'static,
    W: WatchlistRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    let actor = actor_from_headers(&headers)?;
    if !matches!(actor.role, Role::Admin | Role::System) {
        return Err(ApiError::new(
            "FORBIDDEN",
            format!("role {} may not trigger the overstay sweep", actor.role),
        ));
    }
    let report = services.applications.detect_and_flag_overstays()?;
    Ok(Json(report).into_response())
}
