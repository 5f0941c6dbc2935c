//! Process-wide map from note id to its live hub.
//!
//! Creation is single-flight: concurrent callers for the same note coalesce
//! onto one shared creation future, so the initial-content loader runs
//! exactly once per hub lifetime. The loader executes outside the map lock;
//! waiters block on the shared future, not on the mutex. A failed creation
//! resolves every waiter with the same error and leaves the map clean.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::doc::NoteDoc;
use crate::hub::NoteHub;

/// Future produced by a content loader.
pub type ContentFuture = BoxFuture<'static, Result<String, String>>;

/// Supplier of the note's latest saved text, invoked at most once.
pub type ContentLoader = Box<dyn FnOnce() -> ContentFuture + Send>;

type CreationFuture = Shared<BoxFuture<'static, Result<Arc<NoteHub>, String>>>;

enum HubSlot {
    Live(Arc<NoteHub>),
    Creating(CreationFuture),
}

type HubMap = Arc<Mutex<HashMap<String, HubSlot>>>;

fn lock(map: &Mutex<HashMap<String, HubSlot>>) -> MutexGuard<'_, HashMap<String, HubSlot>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct HubRegistry {
    hubs: HubMap,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self { hubs: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Return the live hub for `note_id`, creating it if necessary. The
    /// loader is only invoked when this call actually constructs the hub.
    pub async fn get_or_create(
        &self,
        note_id: &str,
        load_content: ContentLoader,
    ) -> Result<Arc<NoteHub>, String> {
        let creation = {
            let mut hubs = lock(&self.hubs);
            match hubs.get(note_id) {
                Some(HubSlot::Live(hub)) if !hub.is_closing() => return Ok(hub.clone()),
                Some(HubSlot::Creating(creation)) => creation.clone(),
                // Absent, or a hub caught mid-teardown: start a new one.
                _ => {
                    let creation =
                        create_hub(self.hubs.clone(), note_id.to_string(), load_content)
                            .boxed()
                            .shared();
                    hubs.insert(note_id.to_string(), HubSlot::Creating(creation.clone()));
                    creation
                }
            }
        };
        creation.await
    }

    /// Non-creating lookup.
    pub fn get(&self, note_id: &str) -> Option<Arc<NoteHub>> {
        match lock(&self.hubs).get(note_id) {
            Some(HubSlot::Live(hub)) => Some(hub.clone()),
            _ => None,
        }
    }

    /// Number of registered notes, in-flight creations included.
    pub fn len(&self) -> usize {
        lock(&self.hubs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HubRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn create_hub(
    hubs: HubMap,
    note_id: String,
    load_content: ContentLoader,
) -> Result<Arc<NoteHub>, String> {
    let content = match load_content().await {
        Ok(content) => content,
        Err(e) => {
            lock(&hubs).remove(&note_id);
            return Err(format!("loading note content failed: {e}"));
        }
    };
    let doc = match NoteDoc::new(&content) {
        Ok(doc) => doc,
        Err(e) => {
            lock(&hubs).remove(&note_id);
            return Err(e);
        }
    };

    let hub = Arc::new_cyclic(|weak: &Weak<NoteHub>| {
        let on_destroy = deregister_on_destroy(hubs.clone(), note_id.clone(), weak.clone());
        NoteHub::new(note_id.clone(), doc, on_destroy)
    });
    debug!(note = %note_id, "hub created");
    lock(&hubs).insert(note_id, HubSlot::Live(hub.clone()));
    Ok(hub)
}

/// Remove the hub from the map when it destroys itself. Guarded by identity:
/// if a successor hub already took the slot, leave it alone.
fn deregister_on_destroy(
    hubs: HubMap,
    note_id: String,
    hub: Weak<NoteHub>,
) -> Box<dyn FnOnce() + Send> {
    Box::new(move || {
        let Some(me) = hub.upgrade() else {
            return;
        };
        let mut hubs = lock(&hubs);
        let owned = matches!(hubs.get(&note_id), Some(HubSlot::Live(live)) if Arc::ptr_eq(live, &me));
        if owned {
            hubs.remove(&note_id);
            debug!(note = %note_id, "hub deregistered");
        }
    })
}
