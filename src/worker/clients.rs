//! Open page clients and which worker instance controls each of them.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

/// Identifier of one open page client.
pub type ClientId = Uuid;

/// Tracks open clients and their controlling worker instance.
#[derive(Debug, Default, Clone)]
pub struct ClientTable {
    clients: BTreeMap<ClientId, Option<Uuid>>,
}

/// Serializable view of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub controller: Option<Uuid>,
}

impl ClientTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a client, controlled by `controller` when one is active.
    pub fn attach(&mut self, controller: Option<Uuid>) -> ClientId {
        let id = Uuid::new_v4();
        self.clients.insert(id, controller);
        id
    }

    /// Closes a client. Returns whether it was open.
    pub fn detach(&mut self, id: ClientId) -> bool {
        self.clients.remove(&id).is_some()
    }

    /// Puts every open client under `worker`. Returns how many changed hands.
    pub fn claim(&mut self, worker: Uuid) -> usize {
        let mut changed = 0;
        for controller in self.clients.values_mut() {
            if *controller != Some(worker) {
                *controller = Some(worker);
                changed += 1;
            }
        }
        changed
    }

    #[must_use]
    pub fn controller_of(&self, id: ClientId) -> Option<Uuid> {
        self.clients.get(&id).copied().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ClientInfo> {
        self.clients
            .iter()
            .map(|(id, controller)| ClientInfo {
                id: *id,
                controller: *controller,
            })
            .collect()
    }
}
