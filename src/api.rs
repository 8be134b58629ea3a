use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::{
    cache::Cache,
    config::Config,
    database::Database,
    errors::{EngineError, ErrorContext},
    mastery::TopicMasteryUpdater,
    models::*,
    question_pool::QuestionPool,
    quota::{DatabaseQuotaService, QuotaGate},
    resilience::{RateLimiter, ReadTtls, RetryPolicy},
    session_service::SessionManager,
    submission::SubmissionPipeline,
};

// Import logging macros
use crate::{log_api_error, log_api_start, log_api_success, log_api_warn, log_validation};

pub const USER_ID_HEADER: &str = "x-user-id";
const DEFAULT_LIST_LIMIT: i64 = 20;
const MAX_LIST_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub submissions: SubmissionPipeline,
    pub mastery: TopicMasteryUpdater,
    pub quota: QuotaGate,
}

impl AppState {
    /// Wire the engine over one store and one cache.
    pub fn new(db: Database, cache: Arc<dyn Cache>, config: &Config) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let ttls = ReadTtls::from_config(&config.cache);
        let rate_limiter = RateLimiter::new(cache.clone(), config.rate_limits.clone());

        let pool = QuestionPool::new(
            Arc::new(db.clone()),
            cache.clone(),
            retry.clone(),
            Duration::from_secs(config.cache.pool_ttl_secs),
            config.session.provenance_tag.clone(),
        );
        let quota = QuotaGate::new(
            Arc::new(DatabaseQuotaService::new(db.clone(), config.quota.free_daily_limit)),
            cache.clone(),
            retry.clone(),
            ttls,
            config.quota.free_daily_limit,
        );
        let mastery = TopicMasteryUpdater::new(db.clone(), retry.clone());

        let sessions = SessionManager::new(
            db.clone(),
            pool,
            quota.clone(),
            rate_limiter.clone(),
            cache.clone(),
            retry.clone(),
            ttls,
            config.session.max_question_count,
        );
        let submissions = SubmissionPipeline::new(db, mastery.clone(), rate_limiter, cache, retry);

        Self {
            sessions,
            submissions,
            mastery,
            quota,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub code: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            code: None,
        }
    }

    pub fn error_with_code(message: String, code: &str) -> Self {
        Self {
            code: Some(code.to_string()),
            ..Self::error(message)
        }
    }
}

type ApiError = (StatusCode, Json<ApiResponse<()>>);
type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Authenticated caller, taken from the `x-user-id` header.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(AuthUser)
            .ok_or_else(|| EngineError::Unauthorized.to_response_with_context(ErrorContext::new("authenticate", "user")))
    }
}

/// Body rejections (not JSON, wrong content type, failed deserialization)
/// answer in the same envelope as every other `InvalidRequest`.
fn json_body<T>(body: Result<Json<T>, JsonRejection>, operation: &str) -> Result<T, ApiError> {
    body.map(|Json(value)| value).map_err(|rejection| {
        let message = rejection.body_text();
        log_validation!(failure, operation, error = &message);
        EngineError::InvalidRequest(message).to_response_with_context(ErrorContext::new(operation, "Request"))
    })
}

#[derive(Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

#[derive(Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
    pub source: DataSource,
}

#[derive(Serialize, Deserialize)]
pub struct QuotaStatusResponse {
    pub quota: QuotaState,
    pub source: DataSource,
}

#[derive(Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}

// Session endpoints
pub async fn create_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> ApiResult<CreatedSession> {
    log_api_start!("create_session", user_id = user_id);
    let request = json_body(body, "create_session")?;

    match state.sessions.create_session(user_id, request).await {
        Ok(created) => {
            log_api_success!("create_session", session_id = created.session.id, "session created");
            Ok(Json(ApiResponse::success(created)))
        }
        Err(e) => {
            if matches!(e, EngineError::Unexpected(_)) {
                log_api_error!("create_session", error = e, "session creation failed");
            }
            let context = ErrorContext::new("create_session", "Session").with_user(user_id);
            Err(e.to_response_with_context(context))
        }
    }
}

pub async fn list_sessions(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(params): Query<ListParams>,
) -> ApiResult<SessionListResponse> {
    log_api_start!("list_sessions", user_id = user_id);
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    let listed = state.sessions.list_sessions(user_id, limit).await;
    if listed.source == DataSource::ErrorDefault {
        log_api_warn!("list_sessions", "store unavailable, returning empty list");
    }
    log_api_success!("list_sessions", count = listed.data.len(), "sessions listed");
    Ok(Json(ApiResponse::success(SessionListResponse {
        sessions: listed.data,
        source: listed.source,
    })))
}

pub async fn get_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(session_id): Path<Uuid>,
) -> ApiResult<SessionDetail> {
    log_api_start!("get_session", user_id = user_id, session_id = session_id);

    match state.sessions.get_session(user_id, session_id).await {
        Ok(detail) => Ok(Json(ApiResponse::success(detail))),
        Err(e) => {
            let context = ErrorContext::new("get_session", "Session")
                .with_id(&session_id.to_string())
                .with_user(user_id);
            Err(e.to_response_with_context(context))
        }
    }
}

pub async fn submit_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(session_id): Path<Uuid>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> ApiResult<SubmissionResult> {
    log_api_start!("submit_session", user_id = user_id, session_id = session_id);
    let body = json_body(body, "submit_session")?;

    match state.submissions.submit_answers(user_id, session_id, body).await {
        Ok(result) => {
            log_api_success!("submit_session", session_id = session_id, result.message);
            Ok(Json(ApiResponse::success(result)))
        }
        Err(e) => {
            if matches!(e, EngineError::Unexpected(_)) {
                log_api_error!("submit_session", session_id = session_id, error = e, "submission failed");
            }
            let context = ErrorContext::new("submit_session", "Session")
                .with_id(&session_id.to_string())
                .with_user(user_id);
            Err(e.to_response_with_context(context))
        }
    }
}

// Mastery and quota endpoints
pub async fn get_mastery(State(state): State<AppState>, AuthUser(user_id): AuthUser) -> ApiResult<Vec<TopicMastery>> {
    log_api_start!("get_mastery", user_id = user_id);

    match state.mastery.list_for_user(user_id).await {
        Ok(rows) => {
            log_api_success!("get_mastery", count = rows.len(), "mastery rows retrieved");
            Ok(Json(ApiResponse::success(rows)))
        }
        Err(e) => {
            let context = ErrorContext::new("get_mastery", "TopicMastery").with_user(user_id);
            Err(e.to_response_with_context(context))
        }
    }
}

pub async fn get_quota(State(state): State<AppState>, AuthUser(user_id): AuthUser) -> ApiResult<QuotaStatusResponse> {
    log_api_start!("get_quota", user_id = user_id);

    let status = state.quota.status(user_id).await;
    Ok(Json(ApiResponse::success(QuotaStatusResponse {
        quota: status.data,
        source: status.source,
    })))
}

pub async fn health() -> Json<ApiResponse<HealthStatus>> {
    Json(ApiResponse::success(HealthStatus {
        status: "ok".to_string(),
    }))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        // Session routes
        .route("/api/sessions", post(create_session))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/submit", post(submit_session))
        // Learner progress routes
        .route("/api/mastery", get(get_mastery))
        .route("/api/quota", get(get_quota))
        .with_state(state)
}
