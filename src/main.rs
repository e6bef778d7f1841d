use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

use borealis_server::auth::AuthService;
use borealis_server::bridge::{BridgeOutcome, FileBridge};
use borealis_server::config::AppConfig;
use borealis_server::file::FileService;
use borealis_server::friend::FriendService;
use borealis_server::message::MessageService;
use borealis_server::offline::{self, OfflineDispatcher};
use borealis_server::presence::{PresenceCleaner, PresenceService};
use borealis_server::registry::ConnectionRegistry;
use borealis_server::room::RoomService;
use borealis_server::router::Router;
use borealis_server::server::{DisconnectHook, SocketServer};
use borealis_server::store;
use borealis_server::voice::VoiceService;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_lowercase()));
    fmt().with_env_filter(filter).init();

    tracing::info!("Starting Borealis server v{}", env!("CARGO_PKG_VERSION"));

    // Initialize the embedded store
    let pool = store::init_pool(&config.db_path).await?;
    tracing::info!("Store opened at {}", config.db_path);

    store::run_migrations(&pool).await?;
    tracing::info!("Migrations complete");

    let registry = Arc::new(ConnectionRegistry::new());

    // Offline dispatcher wakeups and bridge outcome plumbing
    let (online_tx, online_rx) = offline::wakeup_channel();
    let (outcome_tx, mut outcome_rx) = mpsc::channel::<BridgeOutcome>(64);
    let file_bridge = FileBridge::new(outcome_tx);

    // Services
    let auth = Arc::new(AuthService::new(
        pool.clone(),
        Arc::clone(&registry),
        online_tx,
    ));
    let presence = Arc::new(PresenceService::new(pool.clone(), Arc::clone(&registry)));
    let messages = Arc::new(MessageService::new(pool.clone(), Arc::clone(&registry)));
    let rooms = Arc::new(RoomService::new(pool.clone()));
    let friends = Arc::new(FriendService::new(pool.clone(), Arc::clone(&registry)));
    let files = Arc::new(FileService::new(
        pool.clone(),
        Arc::clone(&registry),
        Arc::clone(&file_bridge),
        config.host.clone(),
        config.file_port,
    ));
    let voice = Arc::new(VoiceService::new(pool.clone(), Arc::clone(&registry)));

    let router = Arc::new(Router {
        auth,
        presence,
        messages,
        rooms,
        friends,
        files,
        voice: Arc::clone(&voice),
    });

    // Background workers
    let dispatcher = OfflineDispatcher::new(pool.clone(), Arc::clone(&registry), online_rx);
    let dispatcher_handle = tokio::spawn(dispatcher.run());

    let cleaner = PresenceCleaner::new(
        pool.clone(),
        Arc::clone(&registry),
        config.session_timeout,
        config.presence_scan_interval,
    );
    let cleaner_handle = tokio::spawn(cleaner.run());

    // File data plane
    let bridge_listener = TcpListener::bind((config.host.as_str(), config.file_port)).await?;
    tracing::info!(
        "File transfer server listening on {}:{}",
        config.host,
        config.file_port
    );
    let bridge_handle = tokio::spawn(Arc::clone(&file_bridge).serve(bridge_listener));

    // Bridge outcomes feed back into file signaling
    let files_for_outcomes = Arc::clone(&router.files);
    let outcome_handle = tokio::spawn(async move {
        while let Some(outcome) = outcome_rx.recv().await {
            match outcome {
                BridgeOutcome::Completed { session_id } => {
                    files_for_outcomes.notify_complete(&session_id).await;
                }
                BridgeOutcome::Failed { session_id, error } => {
                    files_for_outcomes.notify_error(&session_id, &error).await;
                }
            }
        }
    });

    // Control plane, with voice cleanup on disconnect
    let voice_for_disconnect = Arc::clone(&voice);
    let on_disconnect: DisconnectHook = Arc::new(move |user_id: String| {
        let voice = Arc::clone(&voice_for_disconnect);
        Box::pin(async move {
            voice.user_disconnected(&user_id).await;
        })
    });

    let socket_server = Arc::new(
        SocketServer::bind(
            &config.host,
            config.port,
            Arc::clone(&router),
            Arc::clone(&registry),
            pool.clone(),
            Some(on_disconnect),
        )
        .await?,
    );
    tracing::info!("Server listening on {}:{}", config.host, config.port);

    tokio::select! {
        _ = Arc::clone(&socket_server).run() => {},
        _ = shutdown_signal() => {},
    }

    // Stop background work, then drop the listeners.
    cleaner_handle.abort();
    dispatcher_handle.abort();
    file_bridge.shutdown();
    bridge_handle.abort();
    outcome_handle.abort();

    tracing::info!("Borealis server stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install CTRL+C handler: {e}");
    } else {
        tracing::info!("Shutdown signal received");
    }
}
