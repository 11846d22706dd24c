use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session_cookie;
use crate::api::response::ApiError;
use crate::auth::hash_password;
use crate::mutation::MutationError;
use crate::paths;
use crate::storage::DatabaseError;
use crate::sync::messages::{ClientMessage, Settings, UserUpdate};
use crate::sync::{ConnectionId, Dispatch, ServerMessage};
use crate::AppState;

/// Outbound frames not written within this window are dropped.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Sent by the client when the user logs out
const CLOSE_LOGOUT: u16 = 4001;

#[derive(Debug, Error)]
enum UserUpdateError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("Password hashing failed")]
    Hashing,
}

/// GET /!/socket
pub async fn socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    jar: CookieJar,
) -> Response {
    let cookie = session_cookie(&jar);
    if !state.is_authorized(cookie.as_deref()) {
        info!(%addr, "Unauthorized WebSocket connection rejected");
        return ApiError::unauthorized().into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(state, socket, addr, cookie))
}

async fn handle_socket(
    state: Arc<AppState>,
    socket: WebSocket,
    id: ConnectionId,
    cookie: Option<String>,
) {
    info!(%id, "WebSocket connected");
    let (sink, mut stream) = socket.split();
    let outbound = state.hub.accept(id, cookie.clone());

    let (close_tx, close_rx) = oneshot::channel::<u16>();
    let done = CancellationToken::new();
    let writer = tokio::spawn(write_loop(
        Arc::clone(&state),
        id,
        sink,
        outbound,
        close_rx,
        done.clone(),
    ));

    let shutdown = state.hub.shutdown_token();
    let mut close_tx = Some(close_tx);
    let mut close_code = None;
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match screen_frame(&state, id, &text) {
                Inbound::Message(view_id, message) => {
                    handle_message(&state, id, cookie.as_deref(), view_id, message).await;
                }
                Inbound::Ignored => {}
                Inbound::Rejected => {
                    if let Some(tx) = close_tx.take() {
                        let _ = tx.send(CLOSE_INTERNAL_ERROR);
                    }
                    close_code = Some(CLOSE_INTERNAL_ERROR);
                    break;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                close_code = frame.map(|f| f.code);
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(%id, error = %e, "WebSocket receive failed");
                break;
            }
            None => break,
        }
    }

    let reason = close_connection(&state, id, cookie.as_deref(), close_code);
    done.cancel();
    let _ = writer.await;
    info!(%id, code = ?close_code, reason, "WebSocket disconnected");
}

/// What to do with one inbound text frame
#[derive(Debug, PartialEq)]
enum Inbound {
    Message(u32, ClientMessage),
    /// Not a frame this server understands
    Ignored,
    /// Missing or unknown CSRF token, the socket gets closed
    Rejected,
}

fn screen_frame(state: &AppState, id: ConnectionId, text: &str) -> Inbound {
    let (envelope, message) = match ClientMessage::parse(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(%id, error = %e, "Ignoring malformed frame");
            return Inbound::Ignored;
        }
    };
    if !state.csrf.validate(envelope.token.as_deref()) {
        info!(%id, "Invalid CSRF token, closing socket");
        return Inbound::Rejected;
    }
    Inbound::Message(envelope.view_id, message)
}

/// Release everything a closed socket held. A logout close also ends the session.
fn close_connection(
    state: &AppState,
    id: ConnectionId,
    cookie: Option<&str>,
    close_code: Option<u16>,
) -> &'static str {
    if close_code == Some(CLOSE_LOGOUT) {
        if let Some(cookie) = cookie {
            if let Err(e) = state.db.delete_session(cookie) {
                warn!(%id, error = %e, "Failed to delete session on logout");
            }
        }
    }
    state.hub.drop_connection(id);

    match close_code {
        Some(CLOSE_LOGOUT) => "logged out",
        Some(CLOSE_GOING_AWAY) => "going away",
        Some(CLOSE_INTERNAL_ERROR) => "CSRF prevented or server restarted",
        _ => "closed",
    }
}

async fn write_loop(
    state: Arc<AppState>,
    id: ConnectionId,
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Dispatch>,
    mut close_rx: oneshot::Receiver<u16>,
    done: CancellationToken,
) {
    let shutdown = state.hub.shutdown_token();
    let keep_alive = state.config.server.keep_alive;
    let mut ping = (!keep_alive.is_zero()).then(|| {
        tokio::time::interval_at(tokio::time::Instant::now() + keep_alive, keep_alive)
    });

    loop {
        tokio::select! {
            biased;
            code = &mut close_rx => {
                if let Ok(code) = code {
                    let _ = sink.send(close_frame(code)).await;
                }
                break;
            }
            _ = shutdown.cancelled() => {
                let _ = sink.send(close_frame(CLOSE_GOING_AWAY)).await;
                break;
            }
            _ = done.cancelled() => break,
            dispatch = outbound.recv() => {
                let Some(dispatch) = dispatch else { break };
                let Some(message) = state.hub.render(id, dispatch).await else {
                    continue;
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(%id, error = %e, "Failed to encode message");
                        continue;
                    }
                };
                match tokio::time::timeout(SEND_TIMEOUT, sink.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(%id, error = %e, "WebSocket send failed");
                        break;
                    }
                    Err(_) => debug!(%id, "WebSocket send timed out, message dropped"),
                }
            }
            _ = async {
                match ping.as_mut() {
                    Some(ping) => {
                        ping.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn close_frame(code: u16) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: "".into(),
    }))
}

async fn handle_message(
    state: &Arc<AppState>,
    id: ConnectionId,
    cookie: Option<&str>,
    view_id: u32,
    message: ClientMessage,
) {
    let hub = &state.hub;
    let mutations = &state.mutations;

    match message {
        ClientMessage::RequestSettings => {
            let settings = settings(state, cookie);
            hub.send(id, ServerMessage::Settings { view_id, settings });
        }
        ClientMessage::RequestUpdate(path) => {
            if !paths::is_path_sane(&path) {
                info!(%id, %path, "Invalid update request");
                return;
            }
            if let Err(e) = hub.bind_view(id, view_id, &path).await {
                warn!(%id, error = %e, "Failed to bind view");
            }
        }
        ClientMessage::DestroyView => hub.destroy_view(id, view_id),
        ClientMessage::RequestSharelink(request) => {
            if !paths::is_path_sane(&request.location) {
                info!(%id, location = %request.location, "Invalid share link request");
                return;
            }
            match state.links.issue(&request.location, request.attachment) {
                Ok(link) => {
                    hub.send(
                        id,
                        ServerMessage::Sharelink {
                            view_id,
                            link,
                            attachment: request.attachment,
                        },
                    );
                }
                Err(e) => {
                    warn!(%id, error = %e, "Failed to issue share link");
                    hub.send(id, ServerMessage::error(view_id, "Failed to create share link"));
                }
            }
        }
        ClientMessage::DeleteFile(path) => {
            info!(%id, %path, "Deleting");
            report(state, id, view_id, mutations.delete(&path).await);
        }
        ClientMessage::SaveFile(request) => {
            info!(%id, to = %request.to, "Saving");
            match mutations.save(&request.to, &request.value).await {
                Ok(()) => {
                    hub.send(id, ServerMessage::SaveStatus { view_id, status: 0 });
                }
                Err(e) => report(state, id, view_id, Err(e)),
            }
        }
        ClientMessage::Clipboard(request) => {
            info!(%id, kind = ?request.kind, src = %request.src, dst = %request.dst, "Clipboard");
            let result = mutations
                .clipboard(&request.src, &request.dst, request.kind)
                .await
                .map(|dst| debug!(%id, %dst, "Clipboard target"));
            report(state, id, view_id, result);
        }
        ClientMessage::CreateFolder(path) => {
            report(state, id, view_id, mutations.mkdir(&path).await);
        }
        ClientMessage::CreateFile(path) => {
            report(state, id, view_id, mutations.create_file(&path).await);
        }
        ClientMessage::Rename(request) => {
            info!(%id, src = %request.src, dst = %request.dst, "Renaming");
            report(state, id, view_id, mutations.rename(&request.src, &request.dst).await);
        }
        ClientMessage::GetUsers => {
            if state.is_privileged(cookie) && !state.config.public {
                send_users(state, id);
            }
        }
        ClientMessage::UpdateUser(update) => {
            if !state.is_privileged(cookie) {
                return;
            }
            if let Err(e) = update_user(state, id, update).await {
                warn!(%id, error = %e, "User update failed");
                return;
            }
            send_users(state, id);
        }
        ClientMessage::CreateFiles(request) => {
            report(state, id, view_id, mutations.create_files(&request.files).await);
        }
        ClientMessage::CreateFolders(request) => {
            report(state, id, view_id, mutations.create_folders(&request.folders).await);
        }
    }
}

/// Tell the originating view about a failed mutation. Rejected paths are only logged.
fn report(state: &AppState, id: ConnectionId, view_id: u32, result: Result<(), MutationError>) {
    let Err(e) = result else { return };
    match e.client_text() {
        Some(text) => {
            debug!(%id, error = %e, "Mutation failed");
            state.hub.send(id, ServerMessage::error(view_id, text));
        }
        None => info!(%id, error = %e, "Mutation rejected"),
    }
}

fn settings(state: &AppState, cookie: Option<&str>) -> Settings {
    Settings {
        version: env!("CARGO_PKG_VERSION").to_string(),
        debug: state.config.dev,
        public: state.config.public,
        read_only: state.config.read_only,
        privileged: state.is_privileged(cookie),
        engine: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        case_sensitive: cfg!(not(any(windows, target_os = "macos"))),
    }
}

fn send_users(state: &AppState, id: ConnectionId) {
    match state.db.list_users() {
        Ok(users) => {
            state.hub.send(id, ServerMessage::UserList { users });
        }
        Err(e) => warn!(%id, error = %e, "Failed to list users"),
    }
}

/// An empty password deletes the user, anything else adds or updates it.
async fn update_user(
    state: &Arc<AppState>,
    id: ConnectionId,
    update: UserUpdate,
) -> Result<(), UserUpdateError> {
    if update.pass.is_empty() {
        if state.db.delete_user(&update.name)? {
            info!(%id, user = %update.name, "Deleted user");
        }
        if !state.db.has_users()? {
            state.set_first_run(true);
            state.db.clear_sessions()?;
            info!("Last user deleted, entering first-run mode");
        }
        return Ok(());
    }

    let is_new = state.db.get_user(&update.name)?.is_none();
    let rng = state.rng.clone();
    let UserUpdate {
        name,
        pass,
        privileged,
    } = update;
    let record = tokio::task::spawn_blocking(move || hash_password(&rng, &pass, privileged))
        .await
        .map_err(|_| UserUpdateError::Hashing)?
        .map_err(|_| UserUpdateError::Hashing)?;
    state.db.put_user(&name, &record)?;
    info!(%id, user = %name, "{}", if is_new { "Added user" } else { "Updated user" });
    Ok(())
}
