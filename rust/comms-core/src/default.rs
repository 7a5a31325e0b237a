// rust/comms-core/src/default.rs

//! Per-client default contexts.
//!
//! [`DefaultComms`] hands every coordinating client one shared, initialized
//! context and keeps returning it until it is destroyed. It is an ordinary
//! value owned by the coordinator rather than process-global state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::cluster::Cluster;
use crate::config::SessionConfig;
use crate::context::{CommsContext, ContextState};
use crate::error::{CommsError, Result};
use crate::session::ClientId;

/// Context shared between the registry and its callers.
pub type SharedContext = Arc<Mutex<CommsContext>>;

#[derive(Default)]
pub struct DefaultComms {
    config: SessionConfig,
    contexts: HashMap<ClientId, SharedContext>,
}

impl DefaultComms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose new contexts use `config`.
    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            config,
            contexts: HashMap::new(),
        }
    }

    /// Return the default context for `cluster`'s client, creating and
    /// initializing one if needed.
    ///
    /// A cached context that failed (a cancelled `init` included) or was
    /// destroyed is replaced. One inserted but not yet initialized is
    /// initialized in place.
    ///
    /// # Errors
    ///
    /// Propagates the `init` error. Nothing is cached in that case, not even
    /// a previously inserted context.
    pub async fn get_or_init(&mut self, cluster: Arc<dyn Cluster>) -> Result<SharedContext> {
        let client = cluster.client_id();

        if let Some(existing) = self.contexts.get(&client).cloned() {
            let mut context = existing.lock().await;
            match context.state() {
                ContextState::Ready => {
                    drop(context);
                    return Ok(existing);
                }
                ContextState::Created => {
                    if let Err(e) = context.init().await {
                        drop(context);
                        self.contexts.remove(&client);
                        return Err(e);
                    }
                    drop(context);
                    return Ok(existing);
                }
                // `init` holds the lock until it leaves `Initializing`.
                ContextState::Initializing | ContextState::Failed | ContextState::Destroyed => {}
            }
            tracing::debug!(
                "Replacing default context {} for client {}",
                context.session_id(),
                client
            );
        }

        let mut context = CommsContext::with_config(cluster, self.config.clone());
        context.init().await?;

        tracing::info!(
            "Session {} is now the default for client {}",
            context.session_id(),
            client
        );

        let shared = Arc::new(Mutex::new(context));
        self.contexts.insert(client, shared.clone());
        Ok(shared)
    }

    /// Initialize `context` if needed and make it the default of its
    /// cluster's client, replacing any previous one without destroying it.
    ///
    /// This is how a context built by hand becomes the one later
    /// [`get_or_init`](Self::get_or_init) calls return.
    ///
    /// # Errors
    ///
    /// Propagates the `init` error; nothing is registered in that case.
    pub async fn register(&mut self, mut context: CommsContext) -> Result<SharedContext> {
        context.init().await?;
        let client = context.cluster().client_id();
        tracing::info!(
            "Session {} registered as the default for client {}",
            context.session_id(),
            client
        );

        let shared = Arc::new(Mutex::new(context));
        self.contexts.insert(client, shared.clone());
        Ok(shared)
    }

    /// Register `context` as `client`'s default without initializing it,
    /// returning the one it replaces. The next
    /// [`get_or_init`](Self::get_or_init) initializes it.
    pub fn insert(&mut self, client: ClientId, context: CommsContext) -> Option<SharedContext> {
        self.contexts.insert(client, Arc::new(Mutex::new(context)))
    }

    pub fn get(&self, client: ClientId) -> Option<SharedContext> {
        self.contexts.get(&client).cloned()
    }

    /// Forget `client`'s default without destroying it.
    pub fn invalidate(&mut self, client: ClientId) -> Option<SharedContext> {
        self.contexts.remove(&client)
    }

    /// Destroy and forget `client`'s default.
    ///
    /// Returns `false` if the client had none.
    pub async fn destroy(&mut self, client: ClientId) -> Result<bool> {
        match self.contexts.remove(&client) {
            Some(shared) => {
                shared.lock().await.destroy().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Destroy every cached context. Returns the first error after trying
    /// all of them.
    pub async fn destroy_all(&mut self) -> Result<()> {
        let mut first_error: Option<CommsError> = None;
        for (client, shared) in self.contexts.drain() {
            if let Err(e) = shared.lock().await.destroy().await {
                tracing::warn!("Destroying default context of client {} failed: {}", client, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
