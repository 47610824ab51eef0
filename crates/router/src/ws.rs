//! Websocket transport (§4.1, §4.3): the axum upgrade handler and the
//! per-connection `select!` loop that drives an authenticated socket
//! until it closes. Owns no engine state of its own — everything here
//! either calls into [`SessionRouter`] or moves bytes.

use crate::auth::bearer_from_headers;
use crate::dispatch::SessionRouter;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use racetype_common::error::{CoreError, ErrorEnvelope, ErrorKind};
use racetype_common::now_ms;
use racetype_registry::{Connection, ConnectionStatus};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub type RouterState = Arc<SessionRouter>;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// §4.8: "extract the bearer credential (from session auth field or
    /// query)" — a browser websocket client can't set a custom header on
    /// the upgrade request, so a `?token=` fallback is required.
    token: Option<String>,
}

/// Route handler: `GET /ws`. Resolves the bearer credential, then hands
/// off to [`SessionRouter::connect`] for the rest of the handshake
/// before upgrading the connection.
#[instrument(skip(ws, router, headers))]
pub async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(router): State<RouterState>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
) -> impl IntoResponse {
    let bearer = bearer_from_headers(&headers).or(query.token);
    let now = now_ms();

    match router.connect(bearer, Some(addr), now).await {
        Ok(conn) => ws.on_upgrade(move |socket| async move {
            serve(router, conn, socket).await;
        }),
        Err(err) => {
            warn!(%addr, kind = err.kind.as_str(), "handshake rejected");
            rejection_response(err).into_response()
        }
    }
}

/// §4.8's handshake failures never reach the engine, so they're reported
/// as a plain HTTP response rather than a wire `error` event.
fn rejection_response(err: CoreError) -> Response {
    let status = match err.kind {
        ErrorKind::AuthRequired | ErrorKind::AuthInvalid => StatusCode::UNAUTHORIZED,
        ErrorKind::AuthForbidden => StatusCode::FORBIDDEN,
        ErrorKind::TooManyConnections | ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::BAD_REQUEST,
    };
    let envelope: ErrorEnvelope = err.into();
    (status, Json(envelope)).into_response()
}

/// The per-connection logical clock: reads inbound frames and drains the
/// connection's outbound queue concurrently, until the socket closes or
/// a slow-consumer/backpressure promotion closes it first.
async fn serve(router: RouterState, conn: Arc<Connection>, socket: WebSocket) {
    info!(connection = %conn.id.0, identity = %conn.identity.id, "connection established");
    let (mut sender, mut receiver) = socket.split();

    loop {
        if conn.status() == ConnectionStatus::Closing {
            break;
        }

        tokio::select! {
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        router.handle_text(&conn, &text, now_ms()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary/ping/pong frames carry no event payload in this protocol.
                    }
                    Some(Err(err)) => {
                        debug!(connection = %conn.id.0, %err, "websocket read error");
                        break;
                    }
                }
            }
            () = conn.outbound.wait_for_message() => {
                for msg in conn.outbound.drain() {
                    let Ok(text) = serde_json::to_string(&msg) else { continue };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        conn.mark_closing();
                        break;
                    }
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    router.disconnect(&conn, now_ms()).await;
    info!(connection = %conn.id.0, "connection closed");
}
