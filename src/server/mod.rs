pub mod api;
pub mod websocket;

use crate::agent::ChatAgent;
use crate::auth::Authenticator;
use crate::cli::Args;
use crate::websocket::Broadcaster;
use std::error::Error;
use std::sync::Arc;

pub struct Server {
    agent: Arc<ChatAgent>,
    auth: Arc<Authenticator>,
    broadcaster: Broadcaster,
    args: Args,
}

impl Server {
    pub fn new(
        agent: Arc<ChatAgent>,
        auth: Arc<Authenticator>,
        broadcaster: Broadcaster,
        args: Args
    ) -> Self {
        Self {
            agent,
            auth,
            broadcaster,
            args,
        }
    }

    /// Serves the HTTP API and, when enabled, the WebSocket feed until either fails.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let http = self.start_http_server();
        if !self.args.enable_ws {
            return http.await;
        }

        tokio::try_join!(http, self.start_ws_server())?;
        Ok(())
    }

    async fn start_http_server(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let state = api::AppState {
            agent: Arc::clone(&self.agent),
            auth: Arc::clone(&self.auth),
            admin_api_key: self.args.admin_api_key.clone(),
        };
        api::start_http_server(&self.args.http_addr(), state, self.args.clone()).await
    }

    async fn start_ws_server(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let context = websocket::FeedContext {
            agent: Arc::clone(&self.agent),
            auth: Arc::clone(&self.auth),
            broadcaster: self.broadcaster.clone(),
        };
        websocket::start_ws_server(&self.args.server_addr, context, self.args.clone()).await
    }
}
