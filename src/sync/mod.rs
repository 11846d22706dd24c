//! Connection registry, directory subscriptions and change fan-out.
//!
//! Each WebSocket connection owns a set of numbered views. A view either shows
//! a directory, in which case it is subscribed to that directory's changes, or
//! a single file. Changes to a directory are delivered to its subscribers and
//! to the subscribers of every ancestor, each through its own throttle.

pub mod messages;
pub mod throttle;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::filetree::{Change, ChangeReceiver, FileSystem};
use crate::paths;
pub use messages::{ClientMessage, Dispatch, ServerMessage};
pub use throttle::{Throttle, ThrottleState};

/// Connections are keyed by their remote address
pub type ConnectionId = SocketAddr;

const SESSION_SEND_STEP: Duration = Duration::from_millis(50);
const SESSION_SEND_LIMIT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

#[derive(Debug, Clone)]
struct View {
    directory: String,
    file: Option<String>,
}

struct Connection {
    cookie: Option<String>,
    views: HashMap<u32, View>,
    outbound: mpsc::UnboundedSender<Dispatch>,
    cancel: CancellationToken,
}

struct Subscriber {
    connection: ConnectionId,
    view: u32,
    throttle: Throttle,
}

pub struct Hub {
    fs: Arc<dyn FileSystem>,
    update_interval: Duration,
    connections: DashMap<ConnectionId, Connection>,
    subscriptions: DashMap<String, Vec<Subscriber>>,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(fs: Arc<dyn FileSystem>, update_interval: Duration) -> Self {
        Self {
            fs,
            update_interval,
            connections: DashMap::new(),
            subscriptions: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a new connection and return the queue its writer drains.
    pub fn accept(
        &self,
        id: ConnectionId,
        cookie: Option<String>,
    ) -> mpsc::UnboundedReceiver<Dispatch> {
        // A reused address means the previous socket is gone
        if self.connections.contains_key(&id) {
            self.drop_connection(id);
        }

        let (outbound, receiver) = mpsc::unbounded_channel();
        self.connections.insert(
            id,
            Connection {
                cookie,
                views: HashMap::new(),
                outbound,
                cancel: self.shutdown.child_token(),
            },
        );
        debug!(%id, "Connection registered");
        receiver
    }

    /// Point view `view_id` at `path`.
    ///
    /// A file gets `UPDATE_BE_FILE` and no subscription. A directory, or a path
    /// that does not exist (which falls back to `/`), gets subscribed and an
    /// immediate listing.
    pub async fn bind_view(
        &self,
        id: ConnectionId,
        view_id: u32,
        path: &str,
    ) -> Result<(), HubError> {
        let path = paths::normalize(path);
        let directory = match self.fs.stat(&path).await {
            Ok(info) if !info.is_dir() => None,
            Ok(_) => Some(path.clone()),
            Err(e) => {
                debug!(%id, %path, error = %e, "Requested path unavailable, showing root");
                Some("/".to_string())
            }
        };

        self.unsubscribe_view(id, view_id);

        match directory {
            None => {
                let folder = paths::parent(&path);
                let file = paths::file_name(&path);
                let mut conn = self
                    .connections
                    .get_mut(&id)
                    .ok_or(HubError::UnknownConnection(id))?;
                conn.views.insert(
                    view_id,
                    View {
                        directory: folder.clone(),
                        file: Some(file.clone()),
                    },
                );
                let _ = conn.outbound.send(Dispatch::Message(ServerMessage::UpdateBeFile {
                    view_id,
                    folder,
                    file,
                    is_file: true,
                }));
            }
            Some(directory) => {
                let (outbound, cancel) = {
                    let mut conn = self
                        .connections
                        .get_mut(&id)
                        .ok_or(HubError::UnknownConnection(id))?;
                    conn.views.insert(
                        view_id,
                        View {
                            directory: directory.clone(),
                            file: None,
                        },
                    );
                    (conn.outbound.clone(), conn.cancel.child_token())
                };

                let fire = outbound.clone();
                let throttle = Throttle::new(self.update_interval, cancel, move || {
                    let _ = fire.send(Dispatch::Directory(view_id));
                });
                self.subscriptions
                    .entry(directory)
                    .or_default()
                    .push(Subscriber {
                        connection: id,
                        view: view_id,
                        throttle,
                    });
                let _ = outbound.send(Dispatch::Directory(view_id));
            }
        }
        Ok(())
    }

    /// Forget a view and its subscription.
    pub fn destroy_view(&self, id: ConnectionId, view_id: u32) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            conn.views.remove(&view_id);
        }
        self.unsubscribe_view(id, view_id);
    }

    fn unsubscribe_view(&self, id: ConnectionId, view_id: u32) {
        self.subscriptions.retain(|_, subscribers| {
            subscribers.retain(|s| !(s.connection == id && s.view == view_id));
            !subscribers.is_empty()
        });
    }

    /// Remove a connection and every subscription it held.
    ///
    /// Returns the connection's session cookie if it was registered.
    pub fn drop_connection(&self, id: ConnectionId) -> Option<Option<String>> {
        let (_, conn) = self.connections.remove(&id)?;
        conn.cancel.cancel();
        self.subscriptions.retain(|_, subscribers| {
            subscribers.retain(|s| s.connection != id);
            !subscribers.is_empty()
        });
        debug!(%id, "Connection dropped");
        Some(conn.cookie)
    }

    /// Notify subscribers of `dir` and of all its ancestors.
    pub fn dir_changed(&self, dir: &str) {
        let mut dir = paths::normalize(dir);
        loop {
            if let Some(subscribers) = self.subscriptions.get(&dir) {
                for subscriber in subscribers.iter() {
                    subscriber.throttle.trigger();
                }
            }
            if dir == "/" {
                break;
            }
            dir = paths::parent(&dir);
        }
    }

    /// Notify every subscriber.
    pub fn update_all(&self) {
        for entry in self.subscriptions.iter() {
            for subscriber in entry.value() {
                subscriber.throttle.trigger();
            }
        }
    }

    /// Queue a message for one connection. Returns false if it is gone.
    pub fn send(&self, id: ConnectionId, message: ServerMessage) -> bool {
        self.connections
            .get(&id)
            .map(|conn| conn.outbound.send(Dispatch::Message(message)).is_ok())
            .unwrap_or(false)
    }

    /// Queue a message for every connection.
    pub fn broadcast(&self, message: ServerMessage) {
        for conn in self.connections.iter() {
            let _ = conn.outbound.send(Dispatch::Message(message.clone()));
        }
    }

    /// First connection opened by the given session.
    pub fn connection_for_session(&self, cookie: &str) -> Option<ConnectionId> {
        self.connections
            .iter()
            .find(|conn| conn.cookie.as_deref() == Some(cookie))
            .map(|conn| *conn.key())
    }

    /// Deliver a message to a connection of the given session.
    ///
    /// The socket of a session may still be connecting when an HTTP request of
    /// the same session wants to report something, so this retries briefly.
    pub async fn send_to_session(&self, cookie: &str, message: ServerMessage) -> bool {
        let deadline = Instant::now() + SESSION_SEND_LIMIT;
        loop {
            if let Some(id) = self.connection_for_session(cookie) {
                if self.send(id, message.clone()) {
                    return true;
                }
            }
            if Instant::now() + SESSION_SEND_STEP > deadline {
                debug!("No socket for session, dropping message");
                return false;
            }
            tokio::time::sleep(SESSION_SEND_STEP).await;
        }
    }

    /// Cancellation token of a session's first connection.
    pub fn session_token(&self, cookie: &str) -> Option<CancellationToken> {
        self.connections
            .iter()
            .find(|conn| conn.cookie.as_deref() == Some(cookie))
            .map(|conn| conn.cancel.clone())
    }

    /// Turn queued work into the message to put on the wire.
    ///
    /// Directory listings are read at send time so a slow client never sees a
    /// stale snapshot. Returns `None` when there is nothing to send.
    pub async fn render(&self, id: ConnectionId, dispatch: Dispatch) -> Option<ServerMessage> {
        match dispatch {
            Dispatch::Message(message) => Some(message),
            Dispatch::Directory(view_id) => {
                let folder = self.view_directory(id, view_id)?;
                match self.fs.list_dir(&folder).await {
                    Ok(data) => Some(ServerMessage::UpdateDirectory {
                        view_id,
                        folder,
                        data,
                    }),
                    Err(e) => {
                        debug!(%id, %folder, error = %e, "Listing failed");
                        None
                    }
                }
            }
        }
    }

    /// Directory shown by a directory view.
    pub fn view_directory(&self, id: ConnectionId, view_id: u32) -> Option<String> {
        let conn = self.connections.get(&id)?;
        let view = conn.views.get(&view_id)?;
        match view.file {
            Some(_) => None,
            None => Some(view.directory.clone()),
        }
    }

    /// Apply change notifications until the channel closes or shutdown.
    pub async fn listen(self: Arc<Self>, mut changes: ChangeReceiver) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                change = changes.recv() => match change {
                    Some(Change::Dir(dir)) => self.dir_changed(&dir),
                    Some(Change::All) => self.update_all(),
                    None => break,
                },
            }
        }
        debug!("Change listener stopped");
    }

    /// Cancelled when the server shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        info!(
            connections = self.connections.len(),
            "Closing client connections"
        );
        self.shutdown.cancel();
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscriber_count(&self, dir: &str) -> usize {
        self.subscriptions
            .get(&paths::normalize(dir))
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn subscribed_dirs(&self) -> Vec<String> {
        let mut dirs: Vec<String> = self
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        dirs.sort();
        dirs
    }
}
