use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use savor_types::events::{ChangeFilter, tables};
use savor_types::models::{Conversation, Message};

use crate::gateway::{Backend, Gateway};
use crate::realtime::Reloader;
use crate::reconciler::{MutationOutcome, OptimisticStore};

pub const MAX_MESSAGE_LEN: usize = 4000;
pub const HISTORY_LIMIT: u32 = 50;

/// The user's conversations, most recently active first, with unread
/// counters that clear optimistically when a conversation is read.
pub struct Inbox<B> {
    gateway: Gateway<B>,
    user_id: Uuid,
    conversations: Mutex<Vec<Conversation>>,
    unread: OptimisticStore<Uuid, u32>,
}

impl<B: Backend> Inbox<B> {
    pub fn new(gateway: Gateway<B>, user_id: Uuid) -> Self {
        Self {
            gateway,
            user_id,
            conversations: Mutex::new(Vec::new()),
            unread: OptimisticStore::new(),
        }
    }

    fn list(&self) -> MutexGuard<'_, Vec<Conversation>> {
        self.conversations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Conversations this user takes part in.
    pub fn filter(&self) -> ChangeFilter {
        ChangeFilter::eq(tables::CONVERSATIONS, "participant_ids", self.user_id)
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.list()
            .iter()
            .map(|c| {
                let mut c = c.clone();
                let unread = self.unread.get(&c.id);
                if let Some(me) = c.participants.iter_mut().find(|p| p.user_id == self.user_id) {
                    me.unread_count = unread;
                }
                c
            })
            .collect()
    }

    pub fn unread(&self, conversation_id: Uuid) -> u32 {
        self.unread.get(&conversation_id)
    }

    pub fn total_unread(&self) -> u32 {
        self.list().iter().map(|c| self.unread.get(&c.id)).sum()
    }

    pub async fn load(&self) -> Result<(), String> {
        let conversations = self.fetch().await?;
        self.commit(conversations);
        Ok(())
    }

    /// Finds or starts the direct conversation with `user_id`.
    pub async fn open_with(&self, user_id: Uuid) -> Result<Conversation, String> {
        if user_id == self.user_id {
            return Err("You can't message yourself".to_string());
        }
        let conversation = self
            .gateway
            .open_conversation(user_id)
            .await
            .into_result()?
            .ok_or_else(|| "Conversation unavailable".to_string())?;

        self.unread
            .seed(conversation.id, conversation.unread_for(self.user_id));
        let mut list = self.list();
        if !list.iter().any(|c| c.id == conversation.id) {
            list.insert(0, conversation.clone());
        }
        Ok(conversation)
    }

    /// Zeroes the unread counter now and tells the backend. The counter comes
    /// back if the backend refuses.
    pub async fn mark_read(&self, conversation_id: Uuid) -> MutationOutcome<u32> {
        let gateway = self.gateway.clone();
        self.unread
            .mutate(
                conversation_id,
                |n| (*n > 0).then_some(0),
                || async move { gateway.mark_read(conversation_id).await.map(|_| 0) },
            )
            .await
    }
}

impl<B: Backend> Reloader for Inbox<B> {
    type State = Vec<Conversation>;

    async fn fetch(&self) -> Result<Vec<Conversation>, String> {
        Ok(self
            .gateway
            .list_conversations()
            .await
            .into_result()?
            .unwrap_or_default())
    }

    fn commit(&self, conversations: Vec<Conversation>) {
        for c in &conversations {
            self.unread.seed(c.id, c.unread_for(self.user_id));
        }
        *self.list() = conversations;
    }
}

#[derive(Default)]
struct Thread {
    messages: Vec<Message>,
    /// Provisional ids of messages still being sent.
    pending: HashSet<Uuid>,
}

/// Messages of one conversation, oldest first.
///
/// Sent messages show up at once under a provisional id, and are swapped for
/// the stored message when the backend answers or dropped if it refuses.
pub struct ConversationStore<B> {
    gateway: Gateway<B>,
    user_id: Uuid,
    conversation_id: Uuid,
    thread: Mutex<Thread>,
    last_error: Mutex<Option<String>>,
}

impl<B: Backend> ConversationStore<B> {
    pub fn new(gateway: Gateway<B>, user_id: Uuid, conversation_id: Uuid) -> Self {
        Self {
            gateway,
            user_id,
            conversation_id,
            thread: Mutex::new(Thread::default()),
            last_error: Mutex::new(None),
        }
    }

    fn thread(&self) -> MutexGuard<'_, Thread> {
        self.thread.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn filter(&self) -> ChangeFilter {
        ChangeFilter::eq(tables::MESSAGES, "conversation_id", self.conversation_id)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.thread().messages.clone()
    }

    pub fn is_pending(&self, message_id: Uuid) -> bool {
        self.thread().pending.contains(&message_id)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    pub async fn load(&self) -> Result<(), String> {
        let messages = self.fetch().await?;
        self.commit(messages);
        Ok(())
    }

    pub async fn send(&self, body: &str) -> Result<Message, String> {
        let body = body.trim().to_string();
        if body.is_empty() {
            let e = "Message cannot be empty".to_string();
            self.set_error(Some(e.clone()));
            return Err(e);
        }
        if body.chars().count() > MAX_MESSAGE_LEN {
            let e = format!("Message cannot exceed {MAX_MESSAGE_LEN} characters");
            self.set_error(Some(e.clone()));
            return Err(e);
        }

        let provisional = Message {
            id: Uuid::new_v4(),
            conversation_id: self.conversation_id,
            sender_id: self.user_id,
            body: body.clone(),
            created_at: Utc::now(),
            delivered_at: None,
            read_at: None,
        };
        let provisional_id = provisional.id;
        {
            let mut thread = self.thread();
            thread.pending.insert(provisional_id);
            thread.messages.push(provisional);
        }

        let result = self
            .gateway
            .send_message(self.conversation_id, body)
            .await
            .into_result();

        let mut thread = self.thread();
        thread.pending.remove(&provisional_id);
        let slot = thread.messages.iter().position(|m| m.id == provisional_id);
        match result {
            Ok(Some(stored)) => {
                let already_loaded = thread.messages.iter().any(|m| m.id == stored.id);
                match slot {
                    Some(i) if !already_loaded => thread.messages[i] = stored.clone(),
                    Some(i) => {
                        thread.messages.remove(i);
                    }
                    None if !already_loaded => thread.messages.push(stored.clone()),
                    None => {}
                }
                drop(thread);
                self.set_error(None);
                debug!("Message {} sent", stored.id);
                Ok(stored)
            }
            Ok(None) => {
                if let Some(i) = slot {
                    thread.messages.remove(i);
                }
                drop(thread);
                let e = "Message was not sent".to_string();
                self.set_error(Some(e.clone()));
                Err(e)
            }
            Err(e) => {
                if let Some(i) = slot {
                    thread.messages.remove(i);
                }
                drop(thread);
                warn!("Message to {} not sent: {}", self.conversation_id, e);
                self.set_error(Some(e.clone()));
                Err(e)
            }
        }
    }
}

impl<B: Backend> Reloader for ConversationStore<B> {
    type State = Vec<Message>;

    async fn fetch(&self) -> Result<Vec<Message>, String> {
        Ok(self
            .gateway
            .list_messages(self.conversation_id, HISTORY_LIMIT)
            .await
            .into_result()?
            .unwrap_or_default())
    }

    /// Replaces the history, keeping messages that are still being sent at
    /// the end.
    fn commit(&self, mut messages: Vec<Message>) {
        let mut thread = self.thread();
        let pending: Vec<Message> = thread
            .messages
            .iter()
            .filter(|m| thread.pending.contains(&m.id))
            .cloned()
            .collect();
        messages.extend(pending);
        thread.messages = messages;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::BackendError;
    use crate::testing::FakeBackend;

    async fn setup() -> (Arc<FakeBackend>, Inbox<FakeBackend>, Conversation, Uuid) {
        let backend = Arc::new(FakeBackend::new());
        let gateway = Gateway::from_shared(Arc::clone(&backend));
        let inbox = Inbox::new(gateway, backend.viewer());
        let friend = Uuid::new_v4();
        let conversation = inbox.open_with(friend).await.unwrap();
        (backend, inbox, conversation, friend)
    }

    #[tokio::test]
    async fn test_open_twice_reuses_conversation() {
        let (_, inbox, conversation, friend) = setup().await;
        let again = inbox.open_with(friend).await.unwrap();
        assert_eq!(again.id, conversation.id);
        assert_eq!(inbox.conversations().len(), 1);
        assert!(inbox.open_with(inbox.user_id).await.is_err());
    }

    #[tokio::test]
    async fn test_unread_clears_and_restores() {
        let (backend, inbox, conversation, friend) = setup().await;
        backend.deliver(conversation.id, friend, "Dinner at 8?");
        backend.deliver(conversation.id, friend, "My place");
        inbox.load().await.unwrap();
        assert_eq!(inbox.total_unread(), 2);

        backend.fail_next(BackendError::Transport("offline".into()));
        let outcome = inbox.mark_read(conversation.id).await;
        assert!(matches!(outcome, MutationOutcome::RolledBack { .. }));
        assert_eq!(inbox.unread(conversation.id), 2);

        assert_eq!(inbox.mark_read(conversation.id).await, MutationOutcome::Confirmed(0));
        assert_eq!(inbox.conversations()[0].unread_for(backend.viewer()), 0);
        assert_eq!(inbox.mark_read(conversation.id).await, MutationOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_send_replaces_provisional_message() {
        let (backend, inbox, conversation, _) = setup().await;
        let store = ConversationStore::new(inbox.gateway.clone(), backend.viewer(), conversation.id);

        let sent = store.send("  On my way  ").await.unwrap();
        let messages = store.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, sent.id);
        assert_eq!(messages[0].body, "On my way");
        assert!(!store.is_pending(sent.id));
    }

    #[tokio::test]
    async fn test_failed_send_is_withdrawn() {
        let (backend, inbox, conversation, _) = setup().await;
        let store = ConversationStore::new(inbox.gateway.clone(), backend.viewer(), conversation.id);

        backend.fail_next(BackendError::Transport("offline".into()));
        assert!(store.send("Hello?").await.is_err());
        assert!(store.messages().is_empty());
        assert_eq!(
            store.last_error().as_deref(),
            Some("Something went wrong. Please try again.")
        );
        assert_eq!(store.send("   ").await, Err("Message cannot be empty".to_string()));
        assert_eq!(store.last_error().as_deref(), Some("Message cannot be empty"));
    }

    #[tokio::test]
    async fn test_reload_keeps_message_in_flight() {
        let (backend, inbox, conversation, friend) = setup().await;
        let store = Arc::new(ConversationStore::new(inbox.gateway.clone(), backend.viewer(), conversation.id));
        backend.deliver(conversation.id, friend, "Bring wine");

        let held = backend.hold().await;
        let sending = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.send("Red or white?").await })
        };
        while backend.calls() < 2 {
            tokio::task::yield_now().await;
        }
        // A reload lands while the send is blocked
        let history = vec![backend.deliver(conversation.id, friend, "Either")];
        store.commit(history);
        let bodies: Vec<_> = store.messages().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec!["Either", "Red or white?"]);

        drop(held);
        sending.await.unwrap().unwrap();
        assert_eq!(store.messages().len(), 2);
        assert!(store.messages().iter().all(|m| !store.is_pending(m.id)));
    }
}
