use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use wirechat_core::{
    ChatListEntry, DELIVERED_PREVIEW_PREFIX, GroupId, Message, MessageId, MessageStatus,
    PeerProfile, UserId,
};

/// Message thread plus metadata for one peer (user or group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub peer: PeerProfile,
    pub list_id: u64,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub last_msg: String,
    #[serde(default)]
    pub last_msg_at_ms: u64,
    #[serde(default)]
    pub unread: u32,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    fn from_entry(entry: ChatListEntry) -> Self {
        Self {
            peer: entry.peer,
            list_id: entry.list_id,
            is_group: entry.is_group,
            group_id: entry.group_id,
            last_msg: entry.last_msg,
            last_msg_at_ms: entry.last_msg_at_ms,
            unread: entry.unread,
            pinned: entry.pinned,
            muted: entry.muted,
            messages: Vec::new(),
        }
    }

    fn from_peer(peer: PeerProfile) -> Self {
        Self {
            peer,
            list_id: 0,
            is_group: false,
            group_id: None,
            last_msg: String::new(),
            last_msg_at_ms: 0,
            unread: 0,
            pinned: false,
            muted: false,
            messages: Vec::new(),
        }
    }

    /// Inserts keeping the list sorted by creation time. Late-arriving
    /// older messages land before newer ones instead of at the tail.
    fn insert_ordered(&mut self, message: Message) {
        let at = self
            .messages
            .partition_point(|existing| existing.created_at_ms <= message.created_at_ms);
        self.messages.insert(at, message);
    }

    fn set_preview(&mut self, text: String, at_ms: u64) {
        self.last_msg = text;
        self.last_msg_at_ms = at_ms;
    }

    fn is_last_message(&self, message_id: MessageId) -> bool {
        self.messages
            .last()
            .is_some_and(|message| message.id == message_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundOutcome {
    pub key: String,
    pub was_active: bool,
}

/// The single shared mutable surface of the session: every conversation,
/// which one is focused, and the backward-pagination state of the focused
/// thread.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: HashMap<String, Conversation>,
    active: Option<String>,
    history_page: u32,
    history_exhausted: bool,
}

impl ConversationStore {
    pub fn from_saved(conversations: Vec<Conversation>) -> Self {
        let conversations = conversations
            .into_iter()
            .map(|conversation| (conversation.peer.username.clone(), conversation))
            .collect();
        Self {
            conversations,
            active: None,
            history_page: 1,
            history_exhausted: false,
        }
    }

    /// Roster ordered for display and persistence: pinned first, then most
    /// recent activity.
    pub fn to_saved(&self) -> Vec<Conversation> {
        let mut roster: Vec<Conversation> = self.conversations.values().cloned().collect();
        roster.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then(b.last_msg_at_ms.cmp(&a.last_msg_at_ms))
                .then(a.peer.username.cmp(&b.peer.username))
        });
        roster
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Conversation> {
        self.conversations.get(key)
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active
            .as_deref()
            .and_then(|key| self.conversations.get(key))
    }

    fn active_conversation_mut(&mut self) -> Option<&mut Conversation> {
        let key = self.active.clone()?;
        self.conversations.get_mut(&key)
    }

    pub fn history_page(&self) -> u32 {
        self.history_page
    }

    pub fn history_exhausted(&self) -> bool {
        self.history_exhausted
    }

    /// Destructive refresh from the authoritative roster. Entries whose
    /// peer id equals the current user are dropped.
    pub fn rebuild(&mut self, entries: Vec<ChatListEntry>, self_id: UserId) {
        self.conversations.clear();
        for entry in entries {
            if !entry.is_group && entry.peer.id == self_id {
                continue;
            }
            self.conversations
                .insert(entry.peer.username.clone(), Conversation::from_entry(entry));
        }
        if let Some(active) = self.active.clone()
            && !self.conversations.contains_key(&active)
        {
            self.active = None;
        }
    }

    /// Applies a pushed private message. The sender's conversation is
    /// created on demand for previously-unknown peers.
    pub fn apply_inbound(&mut self, sender: &PeerProfile, message: Message) -> InboundOutcome {
        let key = sender.username.clone();
        let was_active = self.active.as_deref() == Some(key.as_str());
        let conversation = self
            .conversations
            .entry(key.clone())
            .or_insert_with(|| Conversation::from_peer(sender.clone()));

        let preview = message.content.clone();
        let at_ms = message.created_at_ms;
        conversation.insert_ordered(message);
        conversation.set_preview(preview, at_ms);

        if was_active {
            conversation.unread = 0;
        } else {
            let len = conversation.messages.len() as u32;
            conversation.unread = (conversation.unread + 1).min(len);
        }

        InboundOutcome { key, was_active }
    }

    /// Appends the server-acknowledged canonical copy of a sent message to
    /// the focused conversation.
    pub fn append_sent(&mut self, message: Message) -> Option<String> {
        let key = self.active.clone()?;
        let conversation = self.conversations.get_mut(&key)?;
        let preview = format!("{DELIVERED_PREVIEW_PREFIX}{}", message.content);
        let at_ms = message.created_at_ms;
        conversation.insert_ordered(message);
        conversation.set_preview(preview, at_ms);
        Some(key)
    }

    /// Sets the status of one message in the focused conversation,
    /// honoring the forward-only rule.
    pub fn apply_read(&mut self, message_id: MessageId, status: MessageStatus) -> bool {
        let Some(conversation) = self.active_conversation_mut() else {
            return false;
        };
        for message in &mut conversation.messages {
            if message.id == message_id && message.status.can_become(status) {
                message.status = status;
                return true;
            }
        }
        false
    }

    /// Marks every message of the focused conversation read.
    pub fn mark_all_read(&mut self) -> usize {
        let Some(conversation) = self.active_conversation_mut() else {
            return 0;
        };
        let mut changed = 0;
        for message in &mut conversation.messages {
            if message.status != MessageStatus::Read
                && message.status.can_become(MessageStatus::Read)
            {
                message.status = MessageStatus::Read;
                changed += 1;
            }
        }
        changed
    }

    /// Marks messages from one sender in the focused conversation read.
    pub fn mark_all_read_from(&mut self, from_user_id: UserId) -> usize {
        let Some(conversation) = self.active_conversation_mut() else {
            return 0;
        };
        let mut changed = 0;
        for message in &mut conversation.messages {
            if message.sender_id == from_user_id
                && message.status != MessageStatus::Read
                && message.status.can_become(MessageStatus::Read)
            {
                message.status = MessageStatus::Read;
                changed += 1;
            }
        }
        changed
    }

    /// Replaces a message with a recall placeholder, searching the focused
    /// conversation first and then every other one. Returns the key of the
    /// mutated conversation, or `None` when the message is unknown or
    /// already recalled (idempotent).
    pub fn apply_recall(
        &mut self,
        message_id: MessageId,
        placeholder: &str,
        recalled_at_ms: u64,
    ) -> Option<String> {
        let mut keys: Vec<String> = Vec::with_capacity(self.conversations.len());
        if let Some(active) = self.active.clone() {
            keys.push(active);
        }
        for key in self.conversations.keys() {
            if self.active.as_deref() != Some(key.as_str()) {
                keys.push(key.clone());
            }
        }

        for key in keys {
            let Some(conversation) = self.conversations.get_mut(&key) else {
                continue;
            };
            let Some(message) = conversation
                .messages
                .iter_mut()
                .find(|message| message.id == message_id)
            else {
                continue;
            };
            if message.apply_recall(placeholder).is_err() {
                return None;
            }
            if conversation.is_last_message(message_id) {
                conversation.set_preview(placeholder.to_owned(), recalled_at_ms);
            }
            return Some(key);
        }
        None
    }

    /// Focuses a conversation and resets backward pagination.
    pub fn select(&mut self, key: &str) -> bool {
        if !self.conversations.contains_key(key) {
            return false;
        }
        self.active = Some(key.to_owned());
        self.history_page = 1;
        self.history_exhausted = false;
        true
    }

    pub fn reset_unread_active(&mut self) {
        if let Some(conversation) = self.active_conversation_mut() {
            conversation.unread = 0;
        }
    }

    /// Applies one fetched history page to the focused conversation. Page 1
    /// replaces the list; later pages prepend older messages ahead of the
    /// newer ones. An empty page marks history exhausted (and on page 1
    /// also clears the list and unread count). Returns whether any
    /// messages were applied.
    pub fn apply_history_page(&mut self, page: u32, mut messages: Vec<Message>) -> bool {
        if self.active.is_none() {
            return false;
        }
        if messages.is_empty() {
            self.history_exhausted = true;
            if page == 1
                && let Some(conversation) = self.active_conversation_mut()
            {
                conversation.messages.clear();
                conversation.unread = 0;
            }
            return false;
        }

        messages.sort_by_key(|message| message.created_at_ms);
        let Some(conversation) = self.active_conversation_mut() else {
            return false;
        };
        if page == 1 {
            conversation.messages = messages;
        } else {
            messages.append(&mut conversation.messages);
            conversation.messages = messages;
        }
        self.history_page = page;
        true
    }
}
