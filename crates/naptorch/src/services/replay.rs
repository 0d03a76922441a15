//! Packet replay contract and in-memory implementation.

use super::journal::{Journal, JournalEntry};
use super::{FailureBudget, ServiceError};
use async_trait::async_trait;
use napt_types::NodeId;
use std::sync::Mutex;

/// Re-injects a punted packet once flow state exists for it.
#[async_trait]
pub trait PacketReplayer: Send + Sync {
    async fn replay(&self, node: NodeId, packet: &[u8]) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
pub struct MemoryPacketReplayer {
    replayed: Mutex<Vec<(NodeId, Vec<u8>)>>,
    journal: Journal,
    failures: FailureBudget,
}

impl MemoryPacketReplayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn replayed(&self) -> Vec<(NodeId, Vec<u8>)> {
        self.replayed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn fail_next_replays(&self, count: u32) {
        self.failures.arm(count);
    }
}

#[async_trait]
impl PacketReplayer for MemoryPacketReplayer {
    async fn replay(&self, node: NodeId, packet: &[u8]) -> Result<(), ServiceError> {
        self.failures.check("replay")?;
        self.journal.record(JournalEntry::Replay {
            node,
            len: packet.len(),
        });
        self.replayed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((node, packet.to_vec()));
        Ok(())
    }
}
