//! Server-side replica of the per-client presence map.
//!
//! Each client announces an opaque JSON state under its CRDT client id,
//! together with a clock it bumps on every change. The register accepts an
//! entry only if it is newer than what it already holds, so replayed or
//! reordered updates cannot resurrect stale presence. Removed clients stay
//! behind as clocked tombstones; re-broadcasting a removal needs the clock.

use std::collections::HashMap;

use note_protocol::AwarenessEntry;

#[derive(Debug, Clone)]
struct ClientPresence {
    clock: u64,
    state: Option<String>,
}

/// Client-id lists produced by applying one awareness update.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    /// Union of all three lists, the set a broadcast must cover.
    pub fn touched(&self) -> Vec<u64> {
        let mut ids = Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        ids.extend_from_slice(&self.added);
        ids.extend_from_slice(&self.updated);
        ids.extend_from_slice(&self.removed);
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct AwarenessRegister {
    clients: HashMap<u64, ClientPresence>,
}

impl AwarenessRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one decoded awareness update and report which ids changed.
    pub fn apply(&mut self, entries: Vec<AwarenessEntry>) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for entry in entries {
            match self.clients.get_mut(&entry.client_id) {
                None => {
                    let announced = entry.state.is_some();
                    self.clients.insert(
                        entry.client_id,
                        ClientPresence { clock: entry.clock, state: entry.state },
                    );
                    if announced {
                        change.added.push(entry.client_id);
                    }
                }
                Some(present) => {
                    // Ties only win for removals, so a disconnect observed
                    // through two paths converges on "gone".
                    let newer = entry.clock > present.clock
                        || (entry.clock == present.clock
                            && entry.state.is_none()
                            && present.state.is_some());
                    if !newer {
                        continue;
                    }
                    let was_present = present.state.is_some();
                    present.clock = entry.clock;
                    let is_present = entry.state.is_some();
                    present.state = entry.state;
                    match (was_present, is_present) {
                        (true, true) => change.updated.push(entry.client_id),
                        (false, true) => change.added.push(entry.client_id),
                        (true, false) => change.removed.push(entry.client_id),
                        (false, false) => {}
                    }
                }
            }
        }
        change
    }

    /// Entries for the given ids, tombstones included. Unknown ids are
    /// silently skipped.
    pub fn entries_for(&self, ids: &[u64]) -> Vec<AwarenessEntry> {
        ids.iter()
            .filter_map(|id| {
                self.clients.get(id).map(|p| AwarenessEntry {
                    client_id: *id,
                    clock: p.clock,
                    state: p.state.clone(),
                })
            })
            .collect()
    }

    /// Every client with a live (non-null) state, for the snapshot a new
    /// connection receives.
    pub fn snapshot(&self) -> Vec<AwarenessEntry> {
        self.clients
            .iter()
            .filter(|(_, p)| p.state.is_some())
            .map(|(id, p)| AwarenessEntry {
                client_id: *id,
                clock: p.clock,
                state: p.state.clone(),
            })
            .collect()
    }

    /// Force-remove the given clients (their connection went away) and
    /// return the removal entries to broadcast. Clients already gone yield
    /// nothing.
    pub fn remove_clients(&mut self, ids: &[u64]) -> Vec<AwarenessEntry> {
        let mut removals = Vec::new();
        for id in ids {
            if let Some(present) = self.clients.get_mut(id) {
                if present.state.is_some() {
                    present.clock += 1;
                    present.state = None;
                    removals.push(AwarenessEntry {
                        client_id: *id,
                        clock: present.clock,
                        state: None,
                    });
                }
            }
        }
        removals
    }
}
