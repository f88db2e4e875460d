//! HTTP front end: a single WebSocket endpoint bridged to the session.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{future, SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::session::{ClientConnection, ClientFrame, LoomSession, Outbound};

/// How long to wait for a close frame to go out.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(100);

/// Build the router: `/ws` speaks the client protocol.
pub fn router(session: LoomSession) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(session)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Serve `session` on all interfaces until `shutdown` resolves.
pub async fn serve(
    session: LoomSession,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Loom server listening on ws://{}:{}/ws", addr.ip(), addr.port());
    axum::serve(listener, router(session))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(session): State<LoomSession>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, session))
}

async fn handle_socket(socket: WebSocket, session: LoomSession) {
    let (mut sender, receiver) = socket.split();
    let (outgoing, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    let send_task = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Text(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let frame = Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    }));
                    match tokio::time::timeout(CLOSE_TIMEOUT, sender.send(frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => log::warn!("Could not close client socket: {}", e),
                        Err(_) => log::warn!("Timed out closing client socket"),
                    }
                    break;
                }
            }
        }
    });

    let incoming = receiver
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(ClientFrame::Text(text)),
                Ok(Message::Close(_)) => Some(ClientFrame::Close),
                Ok(_) => None,
                Err(e) => {
                    log::warn!("Client socket error: {}", e);
                    Some(ClientFrame::Close)
                }
            })
        })
        .boxed();

    let done = session
        .attach_client(ClientConnection { incoming, outgoing })
        .await;
    done.cancelled().await;
    // The session drops its sender when the client goes, ending the send task.
    if let Err(e) = send_task.await {
        log::error!("Client send task failed: {}", e);
    }
}
