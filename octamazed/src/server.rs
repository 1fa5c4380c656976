//! HTTP surface: status page, keep-alive check and the WebSocket join.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use octamaze::{IdValidator, OctapodRegistry, StatusBoard};
use serde::Deserialize;
use tracing::{info, warn};

use crate::transport::{attach_websocket, check_id};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<OctapodRegistry>,
    pub validator: Arc<dyn IdValidator>,
    pub board: StatusBoard,
}

#[derive(Debug, Deserialize)]
struct JoinParams {
    id: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ping", get(|| async { "." }))
        .route("/join", get(join))
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> String {
    format!("Octapod Maze\n\n{}\n", state.board.latest())
}

async fn join(
    State(state): State<AppState>,
    Query(params): Query<JoinParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let checked = check_id(state.validator.as_ref(), params.id.as_deref()).and_then(|id| {
        state.registry.check_available(&id)?;
        Ok(id)
    });
    match checked {
        Ok(id) => match ws {
            Ok(ws) => {
                info!(id = %id, "join accepted, upgrading");
                let registry = state.registry.clone();
                ws.on_upgrade(move |socket| attach_websocket(socket, registry, id))
            }
            Err(rejection) => rejection.into_response(),
        },
        Err(e) => {
            warn!(id = ?params.id, "join rejected: {}", e);
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}
