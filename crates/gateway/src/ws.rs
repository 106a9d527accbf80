//! Websocket endpoint: the single bidirectional message channel per client.
//!
//! The upgrade is gated by the per-host brute-force check. Each connection
//! runs one reader loop and one writer task; inbound transactions fan out as
//! tasks owned by the connection, so closing it cancels every in-flight
//! handler. Frames to the client flow exclusively through the writer task's
//! channel, which serialises writes without further locking.

use std::net::SocketAddr;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

use bp_domain::login::DeviceKind;

use crate::auth::session;
use crate::dispatch::{self, ConnSnapshot};
use crate::hub::{ClientConn, OutboundFrame};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/websocket", get(upgrade_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /websocket — upgrade to the client channel.
async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let address = peer.ip().to_string();

    // Blocked hosts are rejected before the channel ever opens.
    if state.bruteforce.check(&address) {
        return (
            axum::http::StatusCode::FORBIDDEN,
            "host blocked by brute-force protection",
        )
            .into_response();
    }

    let device = match headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
    {
        agent if agent.starts_with("baseplate-client") => DeviceKind::FatClient,
        _ => DeviceKind::Browser,
    };
    let pwa_module_id = pwa_module_from_host(
        &state,
        headers.get("host").and_then(|v| v.to_str().ok()).unwrap_or(""),
    );

    ws.on_upgrade(move |socket| accept(socket, state, address, device, pwa_module_id))
        .into_response()
}

/// A host like `orders.platform.example` selects the PWA module `orders`
/// when one of that name exists.
fn pwa_module_from_host(state: &AppState, host: &str) -> Option<Uuid> {
    let label = host.split(':').next()?.split('.').next()?;
    if label.is_empty() {
        return None;
    }
    state
        .schema
        .module_id_by_name(label)
}

async fn accept(
    socket: WebSocket,
    state: AppState,
    address: String,
    device: DeviceKind,
    pwa_module_id: Option<Uuid>,
) {
    let conn_id = Uuid::new_v4();
    let (frames_tx, frames_rx) = mpsc::channel::<OutboundFrame>(64);
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();

    let task = tokio::spawn(run_conn(
        socket,
        state.clone(),
        ConnSnapshot {
            conn_id,
            address: address.clone(),
            device,
            pwa_module_id,
        },
        frames_rx,
        ready_rx,
    ));

    state.hub.register(ClientConn {
        id: conn_id,
        address,
        admin: false,
        device,
        pwa_module_id,
        login_id: 0,
        no_auth: false,
        io_failed: false,
        sink: frames_tx,
        abort: task.abort_handle(),
    });
    let _ = ready_tx.send(());

    // The socket task owns the connection until disconnect or kick.
    let _ = task.await;
}

async fn run_conn(
    socket: WebSocket,
    state: AppState,
    conn: ConnSnapshot,
    mut frames_rx: mpsc::Receiver<OutboundFrame>,
    ready_rx: tokio::sync::oneshot::Receiver<()>,
) {
    // Wait for hub registration before touching the first frame.
    let _ = ready_rx.await;

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Writer task: the sole path of frames onto the wire.
    let writer_state = state.clone();
    let writer_conn_id = conn.conn_id;
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let result = match frame {
                OutboundFrame::Text(text) => ws_sink.send(Message::Text(text)).await,
                OutboundFrame::Close => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                writer_state.hub.mark_io_failed(&writer_conn_id);
                break;
            }
        }
    });

    // In-flight handlers for this connection; dropped (and aborted) with it.
    let mut handlers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            inbound = ws_stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let state = state.clone();
                        let conn = conn.clone();
                        handlers.spawn(async move {
                            let reply = dispatch::handle_message(&state, &conn, &text).await;
                            if let Some(sink) = state.hub.sink(&conn.conn_id) {
                                if sink.send(OutboundFrame::Text(reply)).await.is_err() {
                                    state.hub.mark_io_failed(&conn.conn_id);
                                }
                            }
                        });
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(conn_id = %conn.conn_id, %err, "read failed");
                        break;
                    }
                }
            }
            Some(_) = handlers.join_next() => {}
        }
    }

    // Cleanup: registry, session log, writer, in-flight handlers.
    handlers.abort_all();
    writer.abort();
    state.hub.remove(&conn.conn_id);
    if let Err(err) = session::remove(&state, conn.conn_id).await {
        tracing::warn!(conn_id = %conn.conn_id, %err, "session log removal failed");
    }
    tracing::info!(conn_id = %conn.conn_id, "connection closed");
}

/// Remover loop: consumes removal requests from the hub (kicks, write
/// failures), closes the transport and tears the connection down.
pub async fn run_remover(state: AppState) {
    let mut removal_rx = state.hub.take_removal_rx();
    while let Some(conn_id) = removal_rx.recv().await {
        if let Some(conn) = state.hub.remove(&conn_id) {
            let _ = conn.sink.try_send(OutboundFrame::Close);
            conn.abort.abort();
            if let Err(err) = session::remove(&state, conn_id).await {
                tracing::warn!(%conn_id, %err, "session log removal failed");
            }
            tracing::info!(%conn_id, "connection removed");
        }
    }
}
