use serde::{Deserialize, Serialize};
use wirechat_core::{SystemEventKind, UserId};

/// Out-of-band event record (friend request traffic), distinct from chat
/// messages. Ids are locally monotonic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemNotice {
    pub id: u64,
    pub read: bool,
    pub kind: SystemEventKind,
    pub from_user_id: UserId,
    pub from_username: String,
    pub received_at_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct NoticeBook {
    notices: Vec<SystemNotice>,
}

impl NoticeBook {
    pub fn from_saved(notices: Vec<SystemNotice>) -> Self {
        Self { notices }
    }

    pub fn to_saved(&self) -> Vec<SystemNotice> {
        self.notices.clone()
    }

    pub fn notices(&self) -> &[SystemNotice] {
        &self.notices
    }

    /// The unread total is derived from the list rather than kept as a
    /// separate counter, so repeated refreshes cannot drift.
    pub fn unread_count(&self) -> u32 {
        self.notices.iter().filter(|notice| !notice.read).count() as u32
    }

    fn next_id(&self) -> u64 {
        self.notices
            .iter()
            .map(|notice| notice.id)
            .max()
            .map_or(1, |max| max + 1)
    }

    pub fn record(
        &mut self,
        kind: SystemEventKind,
        from_user_id: UserId,
        from_username: String,
        received_at_ms: u64,
    ) -> &SystemNotice {
        let notice = SystemNotice {
            id: self.next_id(),
            read: false,
            kind,
            from_user_id,
            from_username,
            received_at_ms,
        };
        self.notices.push(notice);
        self.notices.last().expect("notice just pushed")
    }

    pub fn mark_read(&mut self, id: u64) -> bool {
        match self.notices.iter_mut().find(|notice| notice.id == id) {
            Some(notice) if !notice.read => {
                notice.read = true;
                true
            }
            _ => false,
        }
    }

    pub fn mark_all_read(&mut self) {
        for notice in &mut self.notices {
            notice.read = true;
        }
    }

    pub fn clear(&mut self) {
        self.notices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(book: &mut NoticeBook, kind: SystemEventKind) -> u64 {
        book.record(kind, 5, "bob".to_owned(), 1_000).id
    }

    #[test]
    fn ids_start_at_one_and_increase_by_one() {
        let mut book = NoticeBook::default();
        assert_eq!(record(&mut book, SystemEventKind::FriendRequest), 1);
        assert_eq!(record(&mut book, SystemEventKind::FriendAccepted), 2);
        assert_eq!(record(&mut book, SystemEventKind::FriendRejected), 3);

        book.clear();
        assert_eq!(record(&mut book, SystemEventKind::FriendRequest), 1);
    }

    #[test]
    fn unread_count_is_derived() {
        let mut book = NoticeBook::default();
        let first = record(&mut book, SystemEventKind::FriendRequest);
        record(&mut book, SystemEventKind::FriendAccepted);
        assert_eq!(book.unread_count(), 2);

        assert!(book.mark_read(first));
        assert_eq!(book.unread_count(), 1);

        // Marking the same notice twice does not decrement further.
        assert!(!book.mark_read(first));
        assert_eq!(book.unread_count(), 1);

        book.mark_all_read();
        assert_eq!(book.unread_count(), 0);
    }

    #[test]
    fn saved_roundtrip_preserves_next_id() {
        let mut book = NoticeBook::default();
        record(&mut book, SystemEventKind::FriendRequest);
        record(&mut book, SystemEventKind::FriendAccepted);

        let mut restored = NoticeBook::from_saved(book.to_saved());
        assert_eq!(record(&mut restored, SystemEventKind::FriendRejected), 3);
    }
}
