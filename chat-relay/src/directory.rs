use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::wire::Member;

/// A copy of the directory, keyed by screen name.
pub type Roster = HashMap<String, Member>;

/// The server's authoritative set of current members.
///
/// Each operation holds the lock only for its own map operation and returns
/// owned data, so no caller ever performs network I/O while holding it.
#[derive(Default)]
pub struct Directory {
    members: Mutex<Roster>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Roster {
        self.members.lock().await.clone()
    }

    /// Inserts `member` unless its name is already present. The presence
    /// check and the insert happen under one lock acquisition.
    pub async fn try_add(&self, member: Member) -> bool {
        let mut members = self.members.lock().await;
        if members.contains_key(&member.name) {
            return false;
        }
        members.insert(member.name.clone(), member);
        true
    }

    pub async fn remove(&self, name: &str) -> Option<Member> {
        self.members.lock().await.remove(name)
    }

    pub async fn count(&self) -> usize {
        self.members.lock().await.len()
    }
}
