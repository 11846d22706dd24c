use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_files::{
    api,
    auth::SESSION_RETENTION_DAYS,
    config::Config,
    filetree::{watch, watch_tree},
    sync::ServerMessage,
    AppState,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "live-files starting");

    // Load configuration
    let config = Config::load()?;
    let state = AppState::build(config)?;
    info!(
        files = %state.config.paths.files_dir.display(),
        data = %state.config.paths.data_dir.display(),
        public = state.config.public,
        read_only = state.config.read_only,
        "Serving files"
    );

    // Watchers stop when dropped, keep them for the lifetime of the server
    let _tree_watcher = if state.config.watch {
        let watcher = watch_tree(state.config.paths.files_dir.clone(), state.changes.clone())?;
        info!("Watching files directory for external changes");
        Some(watcher)
    } else {
        None
    };
    let _client_watcher = if state.config.dev && state.resources.dir().is_dir() {
        Some(watch_client_dir(Arc::clone(&state))?)
    } else {
        None
    };

    tokio::spawn(sweep_loop(Arc::clone(&state)));

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&state.config.server.bind_address).await?;
    info!("Listening on: {}", state.config.server.bind_address);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
    .await?;

    info!("Shutdown complete");
    Ok(())
}

/// Reload client resources and tell every client to reload when they change.
fn watch_client_dir(state: Arc<AppState>) -> notify::Result<notify::RecommendedWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let watcher = watch(state.resources.dir(), move |_| {
        let _ = tx.send(());
    })?;
    info!(dir = %state.resources.dir().display(), "Watching client resources");

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // Editors write in bursts, coalesce them into one reload
            tokio::time::sleep(Duration::from_millis(100)).await;
            while rx.try_recv().is_ok() {}

            let reload_state = Arc::clone(&state);
            match tokio::task::spawn_blocking(move || reload_state.resources.reload()).await {
                Ok(Ok(count)) => {
                    info!(count, "Client resources reloaded");
                    state.hub.broadcast(ServerMessage::Reload);
                }
                Ok(Err(e)) => warn!(error = %e, "Failed to reload client resources"),
                Err(e) => warn!(error = %e, "Resource reload task failed"),
            }
        }
    });

    Ok(watcher)
}

/// Sweep stale sessions and dead share links at startup and every hour.
async fn sweep_loop(state: Arc<AppState>) {
    let shutdown = state.hub.shutdown_token();
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let sweep_state = Arc::clone(&state);
        let result = tokio::task::spawn_blocking(move || {
            let cutoff = Utc::now() - chrono::Duration::days(SESSION_RETENTION_DAYS);
            let sessions = sweep_state.db.sweep_sessions(cutoff);
            let links = sweep_state.links.sweep(&sweep_state.config.paths.files_dir);
            (sessions, links)
        })
        .await;

        match result {
            Ok((sessions, links)) => {
                match sessions {
                    Ok(removed) if removed > 0 => info!(removed, "Swept stale sessions"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Session sweep failed"),
                }
                if let Err(e) = links {
                    warn!(error = %e, "Share link sweep failed");
                }
            }
            Err(e) => warn!(error = %e, "Sweep task failed"),
        }
    }
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
    // Sockets never finish on their own, close them so the server can drain
    state.hub.shutdown();
}
