// Declare the modules
pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod render;
pub mod repl;
pub mod session;
pub mod storage;

use crate::api::{ChatApiProvider, OpenAICompatibleProvider};
use crate::auth::{IdentityProvider, TokenIdentity};
use crate::config::BackendConfig;
use crate::session::ChatSession;
use crate::storage::ConversationStore;
use anyhow::Result;
use std::sync::Arc;

pub async fn run() -> Result<()> {
    // Initialize logging
    env_logger::init();

    // Identity gate first: without a signed-in user there is no chat view.
    let identity = TokenIdentity::from_env();
    if !identity.is_signed_in() {
        eprintln!(
            "Not signed in. Set STREAMCHAT_SESSION_TOKEN (or store a session token in the OS keyring) and restart."
        );
        return Ok(());
    }

    let backend = BackendConfig::from_env();
    log::info!("Using backend '{}' at {}", backend.name, backend.api_url);

    // Open the store and read the persisted history once at startup.
    let db_path = ConversationStore::default_path()?;
    let store = ConversationStore::open(&db_path).await?;
    let conversations = store.load().await?;

    let provider: Arc<dyn ChatApiProvider> = Arc::new(OpenAICompatibleProvider::new());
    let session = ChatSession::new(conversations);

    if let Some(label) = identity.user_label() {
        println!("streamchat — signed in as {}", label);
    }

    repl::run_loop(session, provider.as_ref(), &backend, &store).await
}
