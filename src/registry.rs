// In-memory registry of clients seen via inbound heartbeats since process start

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::client::ClientRecord;

/// Identifier -> record map written by connection handlers and read by the reconciler.
///
/// Entries are never evicted. Readers take a cloned snapshot, so a heartbeat that
/// lands while a reconciliation cycle is running shows up in the next cycle.
#[derive(Debug, Default)]
pub struct Registry {
    clients: RwLock<HashMap<u32, ClientRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the record for `record.identifier`. Returns true if it was new.
    pub async fn upsert(&self, record: ClientRecord) -> bool {
        let identifier = record.identifier;
        let previous = self.clients.write().await.insert(identifier, record);
        debug!(identifier, new = previous.is_none(), "registry upsert");
        previous.is_none()
    }

    pub async fn get(&self, identifier: u32) -> Option<ClientRecord> {
        self.clients.read().await.get(&identifier).cloned()
    }

    /// All records ordered by identifier
    pub async fn snapshot(&self) -> Vec<ClientRecord> {
        let mut records: Vec<ClientRecord> = self.clients.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.identifier);
        records
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}
