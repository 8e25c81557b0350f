// Daycare role: the WebSocket endpoint that runs one sandboxed session per
// connection. The handshake authenticates the commit bundle before any
// container exists; after that a reader task, a writer task, and the nanny
// cooperate over bounded channels until the session reaches a terminal state.
pub mod nanny;
pub mod problem_types;
pub mod report;
pub mod sandbox;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use codegrinder_common::{ActionConfig, CommitBundle, EventMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::AppState;
use nanny::{Inbound, Nanny, Outbound, SessionError};
use sandbox::Sandbox;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route(
        "/v2/sockets/:problem_type/:action",
        get(socket_problem_type_action),
    )
}

/// GET /v2/sockets/{problem_type}/{action} - upgrade and run one session
async fn socket_problem_type_action(
    State(state): State<Arc<AppState>>,
    Path((problem_type, action)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        match run_session(socket, state, problem_type, action).await {
            Ok(()) => {}
            Err(SessionError::ClientDisconnect) => {
                debug!("client disconnected, session cancelled")
            }
            Err(err) => warn!(error = %err, "session ended with error"),
        }
    })
}

async fn run_session(
    mut socket: WebSocket,
    state: Arc<AppState>,
    problem_type: String,
    action: String,
) -> Result<(), SessionError> {
    // Handshake: the first frame must be a commit bundle whose problem
    // signature verifies. Nothing is allocated before these checks pass.
    let bundle = match read_bundle(&mut socket).await {
        Ok(bundle) => bundle,
        Err(reason) => {
            close(socket, close_code::POLICY, &reason).await;
            return Err(SessionError::BadRequest(reason));
        }
    };
    let (image, action_config) = match check_handshake(&state, &bundle, &problem_type, &action) {
        Ok(resolved) => resolved,
        Err(reason) => {
            close(socket, close_code::POLICY, &reason).await;
            return Err(SessionError::BadRequest(reason));
        }
    };
    info!(
        problem_type = %problem_type,
        action = %action,
        assignment_id = bundle.commit.assignment_id,
        problem_id = bundle.commit.problem_id,
        step = bundle.commit.step,
        "session accepted"
    );

    let Some(docker) = state.docker.as_ref() else {
        close(socket, close_code::ERROR, "daycare role is not enabled").await;
        return Err(SessionError::Internal(
            "daycare role is not enabled".to_string(),
        ));
    };
    let sandbox = match Sandbox::create(docker, &image, &action_config).await {
        Ok(sandbox) => sandbox,
        Err(err) => {
            let event = EventMessage::error(err.to_string());
            if let Ok(json) = serde_json::to_string(&event) {
                let _ = socket.send(Message::Text(json)).await;
            }
            close(socket, close_code::ERROR, "sandbox unavailable").await;
            return Err(err.into());
        }
    };

    let (sink, stream) = socket.split();
    // Capacity 1: the nanny blocks on the writer before reading the next
    // container chunk, which is what slows the container when the client
    // reads slowly.
    let (events_tx, events_rx) = mpsc::channel::<Outbound>(1);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(16);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let writer = tokio::spawn(write_frames(sink, events_rx));
    let reader = tokio::spawn(read_frames(stream, inbound_tx, cancel_tx));

    let nanny = Nanny::new(
        sandbox,
        bundle,
        action_config,
        events_tx.clone(),
        inbound_rx,
        cancel_rx,
    );
    let outcome = nanny.run(&state.secret).await;

    match &outcome {
        Ok(()) => {
            let _ = events_tx
                .send(Outbound::Shutdown {
                    close: close_code::NORMAL,
                })
                .await;
        }
        // The client is gone: no frames, just reap.
        Err(SessionError::ClientDisconnect) => {}
        // The deadline warning was already emitted inside the nanny.
        Err(SessionError::DeadlineExceeded) => {
            let _ = events_tx
                .send(Outbound::Shutdown {
                    close: close_code::NORMAL,
                })
                .await;
        }
        Err(err) => {
            let close = match err {
                SessionError::BadRequest(_) => close_code::POLICY,
                _ => close_code::ERROR,
            };
            let _ = events_tx
                .send(Outbound::Event(EventMessage::error(err.to_string())))
                .await;
            let _ = events_tx.send(Outbound::Shutdown { close }).await;
        }
    }
    drop(events_tx);
    let _ = writer.await;
    reader.abort();
    outcome
}

/// Read the handshake frame, skipping protocol-level ping/pong noise.
async fn read_bundle(socket: &mut WebSocket) -> Result<CommitBundle, String> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text)
                    .map_err(|err| format!("malformed commit bundle: {err}"));
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(_)) => return Err("expected a commit bundle as the first frame".to_string()),
            Some(Err(err)) => return Err(format!("websocket error during handshake: {err}")),
            None => return Err("connection closed during handshake".to_string()),
        }
    }
}

/// Validate the handshake against this daycare's configuration and the
/// shared secret. Returns the image and action config for the session.
fn check_handshake(
    state: &AppState,
    bundle: &CommitBundle,
    problem_type: &str,
    action: &str,
) -> Result<(String, ActionConfig), String> {
    if !state
        .config
        .problem_types
        .iter()
        .any(|served| served == problem_type)
    {
        return Err(format!(
            "this daycare does not serve problem type {problem_type}"
        ));
    }
    if bundle.problem_type != problem_type {
        return Err("bundle problem type does not match the socket path".to_string());
    }
    if bundle.commit.action != action {
        return Err("commit action does not match the socket path".to_string());
    }
    let (pt, config) = state
        .problem_types
        .action(problem_type, action)
        .map_err(|err| err.to_string())?;
    bundle
        .verify_problem_signature(&state.secret)
        .map_err(|err| err.to_string())?;
    Ok((pt.image.clone(), config.clone()))
}

/// The single writer task: everything the client sees flows through here in
/// order. `Shutdown` emits the final event frame and the close frame.
async fn write_frames(mut sink: SplitSink<WebSocket, Message>, mut events: mpsc::Receiver<Outbound>) {
    while let Some(frame) = events.recv().await {
        let sent = match frame {
            Outbound::Event(event) => send_json(&mut sink, &event).await,
            Outbound::Bundle(bundle) => send_json(&mut sink, bundle.as_ref()).await,
            Outbound::Shutdown { close } => {
                let _ = send_json(&mut sink, &EventMessage::shutdown()).await;
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: close,
                        reason: Cow::Borrowed(""),
                    })))
                    .await;
                break;
            }
        };
        if sent.is_err() {
            break;
        }
    }
}

async fn send_json<T: serde::Serialize>(
    sink: &mut SplitSink<WebSocket, Message>,
    value: &T,
) -> Result<(), axum::Error> {
    match serde_json::to_string(value) {
        Ok(json) => sink.send(Message::Text(json)).await,
        Err(err) => {
            warn!(error = %err, "failed to encode outbound frame");
            Ok(())
        }
    }
}

/// The reader task: client frames become nanny input; a close or transport
/// error trips the session cancel signal.
async fn read_frames(
    mut stream: SplitStream<WebSocket>,
    inbound: mpsc::Sender<Inbound>,
    cancel: watch::Sender<bool>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let forwarded = match serde_json::from_str::<EventMessage>(&text) {
                    Ok(EventMessage::Stdin { streamdata, .. }) => {
                        inbound.send(Inbound::Stdin(streamdata)).await
                    }
                    Ok(EventMessage::Stdinclosed { .. }) => {
                        inbound.send(Inbound::StdinClosed).await
                    }
                    Ok(other) => {
                        inbound
                            .send(Inbound::Violation(format!(
                                "unexpected {} frame from client",
                                other.tag()
                            )))
                            .await
                    }
                    Err(err) => {
                        inbound
                            .send(Inbound::Violation(format!("malformed frame: {err}")))
                            .await
                    }
                };
                if forwarded.is_err() {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                if inbound
                    .send(Inbound::Violation(
                        "binary frames are not supported".to_string(),
                    ))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) | Err(_) => break,
        }
    }
    let _ = cancel.send(true);
}

async fn close(mut socket: WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Owned(reason.to_string()),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
