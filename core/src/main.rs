/// ChatSync client - Main entry point
use chatsync_core::channel::tcp;
use chatsync_core::time::group_by_day;
use chatsync_core::{
    ChatClient, ClientUpdate, Config, ConversationFilter, ConversationSort, HttpHistoryClient,
    SocketSyncChannel,
};
use std::env;
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
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let session = config.session();
    let channel = SocketSyncChannel::new(session.clone(), config.event_capacity);
    let history = HttpHistoryClient::new(&config.api_base_url, config.connect_timeout);
    let client = ChatClient::new(config.clone(), session, channel, history);

    info!("🚀 Starting ChatSync client");
    info!("   User: {}", config.user_id);
    info!("   Gateway: {}", config.gateway_addr);
    info!("   History: {}", config.api_base_url);

    let link = tcp::connect(config.gateway_addr, config.connect_timeout)
        .await
        .map_err(|e| anyhow::anyhow!("Gateway error: {}", e))?;
    client
        .start(link)
        .map_err(|e| anyhow::anyhow!("Channel error: {}", e))?;

    match client.sync_conversations().await {
        Ok(_) => {
            for c in client
                .conversations(ConversationFilter::All, ConversationSort::Recent)
                .await
            {
                let status = if c.online { " (online)" } else { "" };
                info!("   {}{}: {} unread", c.display_name, status, c.unread_count);
            }
        }
        Err(e) => warn!("Conversation sync failed: {}", e),
    }

    let mut updates = client.updates();
    let offset = *chrono::Local::now().offset();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received");
                break;
            }
            update = updates.recv() => match update {
                Ok(ClientUpdate::ThreadUpdated { conversation_id }) => {
                    let thread = client.thread(&conversation_id).await;
                    let today = chrono::Local::now().date_naive();
                    for day in group_by_day(&thread, offset, today) {
                        info!("{} [{}]: {} messages", conversation_id, day.label, day.messages.len());
                    }
                }
                Ok(update) => info!("{:?}", update),
                Err(RecvError::Lagged(n)) => warn!("Skipped {} updates", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    client.shutdown();
    Ok(())
}
