/// ChatSync headless daemon - keeps the conversation list in sync and logs
/// every change
use chatsync_core::api::HttpMessageApi;
use chatsync_core::messenger_types::SyncEvent;
use chatsync_core::unread::LogBadge;
use chatsync_core::{Config, Synchronizer};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let (config, rest) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if !rest.is_empty() {
        warn!("Ignoring unknown arguments: {:?}", rest);
    }
    if config.token.is_none() {
        warn!("No token configured (--token or CHATSYNC_TOKEN); requests will be anonymous");
    }

    let api = HttpMessageApi::new(&config)
        .map_err(|e| anyhow::anyhow!("HTTP client error: {}", e))?;

    info!("🚀 Starting ChatSync");
    info!("   API: {}", config.base_url);
    info!(
        "   Polling: thread {:?}, list {:?}, unread {:?}",
        config.thread_poll_interval, config.list_poll_interval, config.unread_poll_interval
    );

    let placeholder = config.display_name_placeholder.clone();
    let handle = Synchronizer::create(config, Arc::new(api), Arc::new(LogBadge))
        .map_err(|e| anyhow::anyhow!("Synchronizer error: {}", e))?;
    let mut events = handle.subscribe();

    let log_events = async {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event, &placeholder),
                Err(RecvError::Lagged(n)) => warn!("Dropped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    };

    tokio::select! {
        _ = log_events => {},
        _ = wait_for_shutdown() => {},
    }

    info!("Shutdown signal received, stopping synchronizer...");
    handle
        .dispose()
        .await
        .map_err(|e| anyhow::anyhow!("Shutdown error: {}", e))?;
    Ok(())
}

fn log_event(event: &SyncEvent, placeholder: &str) {
    match event {
        SyncEvent::ConversationsUpdated { conversations } => {
            info!("📋 {} conversation(s)", conversations.len());
            for conversation in conversations {
                info!(
                    "   {} ({}): {} unread",
                    chatsync_core::display::display_name(conversation, placeholder),
                    conversation.counterpart_user_id,
                    conversation.unread_count
                );
            }
        }
        SyncEvent::ThreadLoaded { counterpart, messages } => {
            info!("💬 Thread {} loaded ({} messages)", counterpart, messages.len());
        }
        SyncEvent::NewMessages { counterpart, messages } => {
            info!("📨 {} new message(s) in thread {}", messages.len(), counterpart);
        }
        SyncEvent::UnreadChanged { total } => info!("🔔 Unread total: {}", total),
        SyncEvent::Notice { class, message } => warn!("⚠️  {:?}: {}", class, message),
        SyncEvent::SessionExpired { message } => warn!("🔒 Session expired: {}", message),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
