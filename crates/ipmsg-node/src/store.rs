//! Contact store -- the persistence collaborator the node writes peers into.
//!
//! Users are keyed by (hostname, address); each user has at most one 1:1
//! conversation. Both lookups are find-or-create and idempotent.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::discovery::ReceivedMessage;

pub type UserId = u64;
pub type ConversationId = u64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("lock poisoned")]
    LockPoisoned,
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub id: UserId,
    pub hostname: String,
    pub nickname: String,
    pub address: String,
    pub port: u16,
    pub group: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub conversation_id: ConversationId,
    pub sender_name: String,
    pub content: String,
    pub sequence_no: i64,
    pub received_at: DateTime<Utc>,
    pub attachment_count: usize,
}

/// Persistence seam for users, conversations and messages.
pub trait ContactStore: Send + Sync {
    /// Return the user for (hostname, address), creating it if needed.
    /// Nickname, port and group are refreshed on every call.
    fn find_or_create_user(
        &self,
        hostname: &str,
        nickname: &str,
        address: &str,
        port: u16,
        group: Option<&str>,
    ) -> Result<UserId>;

    fn find_or_create_conversation(
        &self,
        hostname: &str,
        nickname: &str,
        address: &str,
        port: u16,
        group: Option<&str>,
    ) -> Result<(ConversationId, UserId)>;

    fn append_message(&self, conversation_id: ConversationId, message: &ReceivedMessage) -> Result<()>;

    fn user(&self, id: UserId) -> Result<Option<UserRow>>;

    fn messages(&self, conversation_id: ConversationId) -> Result<Vec<MessageRow>>;
}

#[derive(Default)]
struct MemoryInner {
    next_id: u64,
    users: HashMap<UserId, UserRow>,
    users_by_key: HashMap<(String, String), UserId>,
    conversations: HashMap<UserId, ConversationId>,
    messages: HashMap<ConversationId, Vec<MessageRow>>,
}

impl MemoryInner {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn upsert_user(
        &mut self,
        hostname: &str,
        nickname: &str,
        address: &str,
        port: u16,
        group: Option<&str>,
    ) -> UserId {
        let key = (hostname.to_string(), address.to_string());
        if let Some(&id) = self.users_by_key.get(&key) {
            if let Some(row) = self.users.get_mut(&id) {
                row.nickname = nickname.to_string();
                row.port = port;
                row.group = group.map(str::to_string);
                row.updated_at = Utc::now();
            }
            return id;
        }

        let id = self.allocate();
        self.users.insert(
            id,
            UserRow {
                id,
                hostname: hostname.to_string(),
                nickname: nickname.to_string(),
                address: address.to_string(),
                port,
                group: group.map(str::to_string),
                updated_at: Utc::now(),
            },
        );
        self.users_by_key.insert(key, id);
        tracing::debug!(user = id, hostname, address, "store: user created");
        id
    }
}

/// In-memory `ContactStore`. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn db(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }

    pub fn user_count(&self) -> Result<usize> {
        Ok(self.db()?.users.len())
    }

    pub fn conversation_count(&self) -> Result<usize> {
        Ok(self.db()?.conversations.len())
    }
}

impl ContactStore for MemoryStore {
    fn find_or_create_user(
        &self,
        hostname: &str,
        nickname: &str,
        address: &str,
        port: u16,
        group: Option<&str>,
    ) -> Result<UserId> {
        Ok(self.db()?.upsert_user(hostname, nickname, address, port, group))
    }

    fn find_or_create_conversation(
        &self,
        hostname: &str,
        nickname: &str,
        address: &str,
        port: u16,
        group: Option<&str>,
    ) -> Result<(ConversationId, UserId)> {
        let mut db = self.db()?;
        let user_id = db.upsert_user(hostname, nickname, address, port, group);
        if let Some(&conv) = db.conversations.get(&user_id) {
            return Ok((conv, user_id));
        }
        let conv = db.allocate();
        db.conversations.insert(user_id, conv);
        tracing::debug!(user = user_id, conversation = conv, "store: conversation created");
        Ok((conv, user_id))
    }

    fn append_message(&self, conversation_id: ConversationId, message: &ReceivedMessage) -> Result<()> {
        let mut db = self.db()?;
        if !db.conversations.values().any(|&c| c == conversation_id) {
            return Err(StoreError::UnknownConversation(conversation_id));
        }
        db.messages.entry(conversation_id).or_default().push(MessageRow {
            conversation_id,
            sender_name: message.sender_name.clone(),
            content: message.content.clone(),
            sequence_no: message.sequence_no,
            received_at: message.received_at,
            attachment_count: message.attachments.len(),
        });
        Ok(())
    }

    fn user(&self, id: UserId) -> Result<Option<UserRow>> {
        Ok(self.db()?.users.get(&id).cloned())
    }

    fn messages(&self, conversation_id: ConversationId) -> Result<Vec<MessageRow>> {
        Ok(self
            .db()?
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str) -> ReceivedMessage {
        ReceivedMessage {
            content: content.into(),
            sender_name: "bob".into(),
            hostname: "bob-host".into(),
            from_address: "10.0.0.2".into(),
            sequence_no: 3,
            received_at: Utc::now(),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn test_find_or_create_user_is_idempotent() {
        let store = MemoryStore::new();
        let a = store
            .find_or_create_user("bob-host", "bob", "10.0.0.2", 2425, None)
            .unwrap();
        let b = store
            .find_or_create_user("bob-host", "bobby", "10.0.0.2", 2426, Some("eng"))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(store.user_count().unwrap(), 1);

        let row = store.user(a).unwrap().unwrap();
        assert_eq!(row.nickname, "bobby");
        assert_eq!(row.port, 2426);
        assert_eq!(row.group.as_deref(), Some("eng"));
    }

    #[test]
    fn test_users_keyed_by_host_and_address() {
        let store = MemoryStore::new();
        let a = store.find_or_create_user("h", "n", "10.0.0.2", 2425, None).unwrap();
        let b = store.find_or_create_user("h", "n", "10.0.0.3", 2425, None).unwrap();
        let c = store.find_or_create_user("other", "n", "10.0.0.2", 2425, None).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(store.user_count().unwrap(), 3);
    }

    #[test]
    fn test_find_or_create_conversation_is_idempotent() {
        let store = MemoryStore::new();
        let (c1, u1) = store
            .find_or_create_conversation("bob-host", "bob", "10.0.0.2", 2425, None)
            .unwrap();
        let (c2, u2) = store
            .find_or_create_conversation("bob-host", "bob", "10.0.0.2", 2425, None)
            .unwrap();
        assert_eq!((c1, u1), (c2, u2));
        assert_eq!(store.conversation_count().unwrap(), 1);

        // A user created first gets its conversation later
        let u3 = store.find_or_create_user("carol-host", "carol", "10.0.0.4", 2425, None).unwrap();
        let (_, u4) = store
            .find_or_create_conversation("carol-host", "carol", "10.0.0.4", 2425, None)
            .unwrap();
        assert_eq!(u3, u4);
    }

    #[test]
    fn test_append_message() {
        let store = MemoryStore::new();
        let (conv, _) = store
            .find_or_create_conversation("bob-host", "bob", "10.0.0.2", 2425, None)
            .unwrap();
        store.append_message(conv, &message("hi")).unwrap();
        store.append_message(conv, &message("again")).unwrap();

        let rows = store.messages(conv).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].content, "hi");
        assert_eq!(rows[1].content, "again");

        assert!(matches!(
            store.append_message(999, &message("x")),
            Err(StoreError::UnknownConversation(999))
        ));
    }
}
