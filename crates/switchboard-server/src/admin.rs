//! JSON admin API mounted under `/admin`.

use crate::handlers::AppState;
use axum::{
    extract::{Path, Query, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use switchboard_admission::parse_bearer_token;
use switchboard_core::delivery::DEFAULT_HISTORY_LIMIT;
use switchboard_core::{
    BroadcastReport, BroadcastRequest, ConnectionFilter, ConnectionInfo, CoreError, HubStats,
    Message, PresenceRecord, Room, RoomSpec, RoomUpdate,
};
use switchboard_protocol::ErrorBody;
use tracing::warn;

/// A [`CoreError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CoreError::NotFound(_) | CoreError::RoomNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InvalidFrame(_) | CoreError::UnknownType(_) | CoreError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            CoreError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            CoreError::RoomFull(_) | CoreError::FeatureDisabled(_) | CoreError::NotSubscribed(_) => {
                StatusCode::CONFLICT
            }
            CoreError::BrokerUnavailable(_) | CoreError::StoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            code: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(serde_json::json!({ "error": body }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Admin routes, guarded by the configured bearer token.
pub fn routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/stats", get(stats))
        .route("/connections", get(list_connections))
        .route("/connections/:id/disconnect", post(disconnect))
        .route("/rooms", get(list_rooms).post(create_room))
        .route("/rooms/:name", put(update_room))
        .route("/rooms/:name/members", get(room_members))
        .route("/rooms/:name/presence", get(room_presence))
        .route("/rooms/:name/history", get(room_history))
        .route("/rooms/:name/system", post(send_system))
        .route("/broadcast", post(broadcast))
        .route("/events/:topic", post(publish_event))
        .route_layer(middleware::from_fn_with_state(state, require_admin))
}

async fn require_admin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.admin.token.as_deref() else {
        return next.run(request).await;
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_bearer_token(value).ok());

    if presented.as_deref() == Some(expected) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "Admin request without valid token");
        let body = ErrorBody {
            code: "unauthorized".to_string(),
            message: "Admin token required".to_string(),
        };
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": body })),
        )
            .into_response()
    }
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<HubStats> {
    Json(state.hub.stats())
}

async fn list_connections(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ConnectionFilter>,
) -> Json<Vec<ConnectionInfo>> {
    Json(state.hub.list_connections(&filter))
}

async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.hub.force_disconnect(&id)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Default, Deserialize)]
struct RoomListParams {
    #[serde(default)]
    include_inactive: bool,
}

async fn list_rooms(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RoomListParams>,
) -> Json<Vec<Room>> {
    Json(state.hub.list_rooms(params.include_inactive))
}

async fn create_room(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<RoomSpec>,
) -> Result<(StatusCode, Json<Room>), ApiError> {
    let room = state.hub.create_room(spec).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

async fn update_room(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(update): Json<RoomUpdate>,
) -> ApiResult<Room> {
    Ok(Json(state.hub.update_room(&name, update).await?))
}

async fn room_members(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Vec<ConnectionInfo>> {
    Ok(Json(state.hub.room_members(&name)?))
}

async fn room_presence(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Vec<PresenceRecord>> {
    Ok(Json(state.hub.room_presence(&name)?))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
    before: Option<DateTime<Utc>>,
}

async fn room_history(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<Message>> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.hub.room_history(&name, limit, params.before).await?))
}

#[derive(Debug, Deserialize)]
struct SystemMessage {
    content: String,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

async fn send_system(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<SystemMessage>,
) -> ApiResult<Message> {
    Ok(Json(
        state
            .hub
            .send_as_system(&name, body.content, body.metadata)
            .await?,
    ))
}

async fn broadcast(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BroadcastRequest>,
) -> Json<BroadcastReport> {
    Json(state.hub.broadcast(request).await)
}

async fn publish_event(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
    Json(data): Json<serde_json::Value>,
) -> ApiResult<serde_json::Value> {
    let delivered = state.hub.publish_event(&topic, data).await?;
    Ok(Json(serde_json::json!({ "delivered": delivered })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use switchboard_core::Hub;

    async fn state() -> Arc<AppState> {
        let mut config = Config::default();
        config.hub.rooms.push(RoomSpec::public("general"));
        let hub = Hub::new(config.hub.clone()).await.unwrap();
        Arc::new(AppState { hub, config })
    }

    #[test]
    fn test_error_status() {
        let cases = [
            (CoreError::RoomNotFound("x".into()), StatusCode::NOT_FOUND),
            (CoreError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (CoreError::PermissionDenied("x".into()), StatusCode::FORBIDDEN),
            (CoreError::RoomFull("x".into()), StatusCode::CONFLICT),
            (
                CoreError::StoreUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn test_room_routes() {
        let state = state().await;

        let (status, Json(room)) = create_room(
            State(Arc::clone(&state)),
            Json(RoomSpec::public("ops")),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(room.name, "ops");

        let duplicate = create_room(State(Arc::clone(&state)), Json(RoomSpec::public("ops"))).await;
        assert!(duplicate.is_err());

        let Json(rooms) = list_rooms(State(Arc::clone(&state)), Query(RoomListParams::default())).await;
        assert_eq!(rooms.len(), 2);

        let missing = room_members(State(Arc::clone(&state)), Path("nope".into())).await;
        assert_eq!(
            missing.unwrap_err().into_response().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_system_message_and_history() {
        let state = state().await;
        send_system(
            State(Arc::clone(&state)),
            Path("general".into()),
            Json(SystemMessage {
                content: "deploy starting".into(),
                metadata: None,
            }),
        )
        .await
        .unwrap();

        let Json(history) = room_history(
            State(Arc::clone(&state)),
            Path("general".into()),
            Query(HistoryParams::default()),
        )
        .await
        .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "deploy starting");
    }

    #[tokio::test]
    async fn test_disconnect_unknown_connection() {
        let state = state().await;
        let result = disconnect(State(state), Path("conn_missing".into())).await;
        assert_eq!(
            result.unwrap_err().into_response().status(),
            StatusCode::NOT_FOUND
        );
    }
}
