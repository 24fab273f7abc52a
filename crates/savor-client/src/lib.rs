pub mod chat;
pub mod comments;
pub mod config;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod http;
pub mod notifications;
pub mod realtime;
pub mod reconciler;
pub mod social;
pub mod upload;
pub mod ws;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use savor_realtime::ChangeSource;
use savor_types::api::{Credentials, Session};

pub use crate::config::ClientConfig;
pub use crate::error::BackendError;
pub use crate::gateway::{Backend, Gateway};
pub use crate::realtime::{Reloader, SubscriptionListener};
pub use crate::reconciler::{MutationOutcome, OptimisticStore, ToggleState};

use crate::chat::{ConversationStore, Inbox};
use crate::comments::CommentThread;
use crate::feed::FeedStore;
use crate::http::HttpBackend;
use crate::notifications::DeviceRegistry;
use crate::social::PostInteractions;
use crate::upload::Uploader;
use crate::ws::WsChangeSource;

/// Everything a signed-in client needs, built once and passed down.
///
/// Stores are created per screen from here. Listeners created through
/// [`Savor::listener`] are all torn down by [`Savor::shutdown`].
pub struct Savor<B, S> {
    user_id: Uuid,
    gateway: Gateway<B>,
    changes: Arc<S>,
    interactions: Arc<PostInteractions<B>>,
    inbox: Arc<Inbox<B>>,
    devices: Arc<DeviceRegistry<B>>,
    shutdown: CancellationToken,
}

impl<B: Backend, S: ChangeSource> Savor<B, S> {
    pub fn new(backend: B, changes: S, user_id: Uuid) -> Self {
        let gateway = Gateway::new(backend);
        Self {
            user_id,
            interactions: Arc::new(PostInteractions::new(gateway.clone())),
            inbox: Arc::new(Inbox::new(gateway.clone(), user_id)),
            devices: Arc::new(DeviceRegistry::new(gateway.clone())),
            gateway,
            changes: Arc::new(changes),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn gateway(&self) -> &Gateway<B> {
        &self.gateway
    }

    pub fn changes(&self) -> &Arc<S> {
        &self.changes
    }

    /// Like, share and follow state shared by every screen.
    pub fn interactions(&self) -> &Arc<PostInteractions<B>> {
        &self.interactions
    }

    pub fn inbox(&self) -> &Arc<Inbox<B>> {
        &self.inbox
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry<B>> {
        &self.devices
    }

    pub fn feed(&self) -> Arc<FeedStore<B>> {
        Arc::new(FeedStore::new(self.gateway.clone(), Arc::clone(&self.interactions)))
    }

    pub fn comment_thread(&self, post_id: Uuid) -> Arc<CommentThread<B>> {
        Arc::new(CommentThread::new(self.gateway.clone(), post_id))
    }

    pub fn conversation(&self, conversation_id: Uuid) -> Arc<ConversationStore<B>> {
        Arc::new(ConversationStore::new(self.gateway.clone(), self.user_id, conversation_id))
    }

    pub fn uploader(&self) -> Uploader<B> {
        Uploader::new(self.gateway.clone())
    }

    /// A listener on this client's change source, cancelled on shutdown.
    pub fn listener(&self) -> SubscriptionListener<S> {
        SubscriptionListener::with_parent(Arc::clone(&self.changes), self.shutdown.child_token())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Unmounts every listener made by [`Savor::listener`]. Pending reloads
    /// finish without committing.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down client for {}", self.user_id);
            self.shutdown.cancel();
        }
    }
}

impl Savor<HttpBackend, WsChangeSource> {
    /// Connects with the token in `config`, resolving the user through the
    /// given session.
    pub fn with_session(config: &ClientConfig, session: &Session) -> Result<Self, BackendError> {
        let backend = HttpBackend::new(&config.clone().with_token(session.token.clone()))?;
        let changes = WsChangeSource::new(config.realtime_url.clone(), session.token.clone());
        info!("Client ready for {}", session.username);
        Ok(Self::new(backend, changes, session.user_id))
    }

    /// Signs in over HTTP, then builds the client for that session.
    pub async fn sign_in(config: &ClientConfig, credentials: &Credentials) -> Result<Self, BackendError> {
        let session = HttpBackend::new(config)?.login(credentials).await?;
        Self::with_session(config, &session)
    }

    /// [`shutdown`](Self::shutdown), also closing the realtime socket.
    pub async fn close(&self) {
        self.shutdown();
        self.changes.close().await;
    }
}
