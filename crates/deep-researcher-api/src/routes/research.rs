use std::convert::Infallible;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::{FromRequestParts, Path, Query},
    http::{StatusCode, header, request::Parts},
    response::Response,
    routing::{get, post},
};
use deep_researcher_core::session::DEFAULT_PAGE_SIZE;
use deep_researcher_core::{
    ConfigOverrides, ResearchSession, SecretValue, SessionStatus, StartResearch,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::AppError;
use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
const SUBJECT_TOKEN_HEADER: &str = "x-subject-token";
const NDJSON: &str = "application/x-ndjson";

pub fn research_router() -> Router<AppState> {
    Router::new()
        .route("/start", post(start_research))
        .route("/checkpoint", get(get_checkpoint))
        .route("/sessions", get(list_sessions))
        .route("/session/:id", get(get_session).delete(delete_session))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResearchRequest {
    /// Absent or blank continues the chat's thread from its checkpoint.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "chat_id")]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub configuration: ConfigOverrides,
}

#[instrument(skip_all, fields(user_id = %caller.user_id))]
async fn start_research(
    caller: CallerIdentity,
    Json(payload): Json<StartResearchRequest>,
) -> Result<Response, AppError> {
    let CallerIdentity {
        state,
        user_id,
        subject_token,
    } = caller;
    let permit = state.acquire_run_permit()?;

    let started = state
        .service()
        .start(StartResearch {
            user_id,
            chat_id: payload.chat_id,
            message: payload.message,
            overrides: payload.configuration,
            subject_token,
        })
        .await?;
    info!(
        session_id = %started.session_id,
        thread_key = %started.thread_key,
        resumed = started.resumed,
        "streaming research run"
    );

    let body = Body::from_stream(started.events.map(move |event| {
        let _slot = &permit;
        Ok::<_, Infallible>(event.to_ndjson())
    }));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, NDJSON)
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-session-id", started.session_id)
        .header("x-thread-id", started.thread_key)
        .header("x-resume-mode", if started.resumed { "resume" } else { "new" })
        .body(body)
        .map_err(AppError::internal)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointQuery {
    #[serde(alias = "chat_id")]
    chat_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResponse {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research_brief: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_node: Option<&'static str>,
}

async fn get_checkpoint(
    caller: CallerIdentity,
    Query(query): Query<CheckpointQuery>,
) -> Result<Json<CheckpointResponse>, AppError> {
    let found = caller
        .state
        .service()
        .checkpoint_for_chat(&caller.user_id, &query.chat_id)
        .await?;
    let response = match found {
        Some((session, checkpoint)) => CheckpointResponse {
            exists: true,
            session_id: Some(session.id),
            thread_key: Some(session.thread_key),
            status: Some(session.status),
            research_brief: session.research_brief,
            step: Some(checkpoint.step),
            next_node: checkpoint.status.next_node().map(|node| node.name()),
        },
        None => CheckpointResponse {
            exists: false,
            session_id: None,
            thread_key: None,
            status: None,
            research_brief: None,
            step: None,
            next_node: None,
        },
    };
    Ok(Json(response))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<ResearchSession>,
}

async fn list_sessions(
    caller: CallerIdentity,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListSessionsResponse>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<SessionStatus>)
        .transpose()?;
    let sessions = caller
        .state
        .service()
        .sessions()
        .user_sessions(
            &caller.user_id,
            status,
            query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(ListSessionsResponse { sessions }))
}

async fn get_session(
    caller: CallerIdentity,
    Path(session_id): Path<String>,
) -> Result<Json<ResearchSession>, AppError> {
    caller
        .state
        .service()
        .sessions()
        .get_session(&session_id, &caller.user_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found("session not found"))
}

async fn delete_session(
    caller: CallerIdentity,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let deleted = caller
        .state
        .service()
        .sessions()
        .delete_session(&session_id, &caller.user_id)
        .await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found("session not found"))
    }
}

/// The authenticated caller. Authentication itself happens upstream; this
/// only checks the optional shared bearer token and reads the user id.
pub struct CallerIdentity {
    pub state: AppState,
    pub user_id: String,
    pub subject_token: Option<SecretValue>,
}

#[async_trait]
impl FromRequestParts<AppState> for CallerIdentity {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let app_state = state.clone();

        if let Some(expected) = app_state.auth_token() {
            let provided = header_value(parts, header::AUTHORIZATION.as_str())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::trim);

            match provided {
                Some(token) if token == expected.as_str() => {}
                _ => {
                    return Err(AppError::new(
                        StatusCode::UNAUTHORIZED,
                        "invalid auth token",
                    ));
                }
            }
        }

        let user_id = header_value(parts, USER_ID_HEADER)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "missing x-user-id header"))?
            .to_string();
        let subject_token = header_value(parts, SUBJECT_TOKEN_HEADER)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(SecretValue::new);

        Ok(CallerIdentity {
            state: app_state,
            user_id,
            subject_token,
        })
    }
}

fn header_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|value| value.to_str().ok())
}
