//! Per-user command queue.
//!
//! A concurrent map from username to an independently lockable pending
//! list: the outer RwLock is held only long enough to find or create a
//! user's shard, so one user's polling never serializes another's
//! dispatching. Entries are removed on completion, never transitioned,
//! and nothing expires them: an executor that never polls leaves its
//! queue growing without bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;

use crate::QueuedCommand;

static COMMAND_SEQ: AtomicU64 = AtomicU64::new(0);

/// Opaque, time-ordered command id: a microsecond UTC timestamp plus a
/// short sequence suffix so bursts within one tick stay unique.
pub(crate) fn next_command_id() -> String {
    let seq = COMMAND_SEQ.fetch_add(1, Ordering::Relaxed) % 10_000;
    format!("{}{seq:04}", Utc::now().format("%Y%m%d%H%M%S%6f"))
}

#[derive(Default)]
pub(crate) struct CommandQueue {
    shards: RwLock<HashMap<String, Arc<Mutex<Vec<QueuedCommand>>>>>,
}

impl CommandQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn shard(&self, username: &str) -> Arc<Mutex<Vec<QueuedCommand>>> {
        {
            let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
            if let Some(shard) = shards.get(username) {
                return Arc::clone(shard);
            }
        }
        let mut shards = self.shards.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(shards.entry(username.to_string()).or_default())
    }

    /// Append to the user's pending list. Insertion order is preserved;
    /// there is no dedup and no size cap.
    pub(crate) fn enqueue(&self, username: &str, command: QueuedCommand) {
        let shard = self.shard(username);
        let mut pending = shard.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(command);
    }

    /// Snapshot of the user's pending list; pure read.
    pub(crate) fn pending(&self, username: &str) -> Vec<QueuedCommand> {
        let shard = self.shard(username);
        let pending = shard.lock().unwrap_or_else(|e| e.into_inner());
        pending.clone()
    }

    /// Remove the entry with the given id. Removing an absent id is a
    /// no-op so a retrying executor can complete twice safely.
    pub(crate) fn complete(&self, username: &str, command_id: &str) {
        let shard = self.shard(username);
        let mut pending = shard.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|entry| entry.id != command_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> QueuedCommand {
        QueuedCommand {
            id: id.to_string(),
            kind: Some("command".to_string()),
            command: Some(format!("cmd|tool|{id}|{id}.exe|launch")),
            tool_id: None,
            created: Utc::now().to_rfc3339(),
            status: "pending".to_string(),
        }
    }

    #[test]
    fn queues_are_isolated_per_user() {
        let queue = CommandQueue::new();
        queue.enqueue("alice", entry("a1"));
        queue.enqueue("bob", entry("b1"));

        let alice = queue.pending("alice");
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].id, "a1");
        assert!(queue.pending("bob").iter().all(|e| e.id != "a1"));
        assert!(queue.pending("carol").is_empty());
    }

    #[test]
    fn enqueue_preserves_insertion_order() {
        let queue = CommandQueue::new();
        for id in ["1", "2", "3"] {
            queue.enqueue("alice", entry(id));
        }
        let ids: Vec<String> = queue.pending("alice").into_iter().map(|e| e.id).collect();
        assert_eq!(ids, ["1", "2", "3"]);
    }

    #[test]
    fn complete_is_idempotent() {
        let queue = CommandQueue::new();
        queue.enqueue("alice", entry("a1"));
        queue.enqueue("alice", entry("a2"));

        queue.complete("alice", "a1");
        assert!(queue.pending("alice").iter().all(|e| e.id != "a1"));

        // Completing again, or completing ids that never existed, is fine.
        queue.complete("alice", "a1");
        queue.complete("alice", "ghost");
        queue.complete("carol", "anything");
        assert_eq!(queue.pending("alice").len(), 1);
    }

    #[test]
    fn peek_does_not_drain() {
        let queue = CommandQueue::new();
        queue.enqueue("alice", entry("a1"));
        assert_eq!(queue.pending("alice").len(), 1);
        assert_eq!(queue.pending("alice").len(), 1);
    }

    #[test]
    fn command_ids_are_unique_and_ordered_enough() {
        let ids: Vec<String> = (0..64).map(|_| next_command_id()).collect();
        let mut deduped = ids.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), ids.len());
        // Fixed-width digits: lexicographic order tracks creation order.
        assert!(ids.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(ids.iter().all(|id| id.chars().all(|c| c.is_ascii_digit())));
    }
}
