pub mod agent;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod server;
pub mod store;
pub mod websocket;

use agent::{ AgentSettings, ChatAgent };
use auth::Authenticator;
use cli::Args;
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;
use websocket::Broadcaster;

const FEED_CAPACITY: usize = 256;

fn log_configuration(args: &Args) {
    info!("--- Core Configuration ---");
    info!("HTTP Address: {}", args.http_addr());
    info!("Feed Address: {} (enabled: {})", args.server_addr, args.enable_ws);
    info!("Store Type: {}", args.store_type);
    info!("Default Room: {}", args.default_room);
    info!("LLM Base URL: {}", args.llm_api_base);
    info!("LLM Model: {}", args.llm_model);
    info!("LLM API Key Set: {}", !args.llm_api_key.trim().is_empty());
    info!("LLM Timeout: {}s", args.llm_timeout_secs);
    info!("Bot Name: {}", args.bot_name);
    info!("History Window: {}", args.history_window);
    info!("Prompts Path: {}", args.prompts_path.as_deref().unwrap_or("built-in"));
    info!("Static Dir: {}", args.static_dir.as_deref().unwrap_or("none"));
    info!("Require Auth: {}", args.require_auth);
    info!("TLS Enabled: {}", args.tls_enabled());
    info!("-------------------------");
}

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    log_configuration(&args);

    let stores = store::initialize_store(&args)?;
    let chat_client = llm::chat::new_client(&args.llm_config())?;
    let broadcaster = Broadcaster::new(FEED_CAPACITY);

    let agent = ChatAgent::new(
        stores.messages.clone(),
        chat_client,
        AgentSettings::from_args(&args)
    )?.with_broadcaster(broadcaster.clone());
    let auth = Authenticator::from_args(stores.users.clone(), &args);

    let server = Server::new(Arc::new(agent), Arc::new(auth), broadcaster, args);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received, stopping."),
    }

    Ok(())
}
