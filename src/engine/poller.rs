// src/engine/poller.rs
//
// Poller (spec.md §4.4): one background task per tcp/rtu device, reading
// every declared tag in order on a fixed interval and republishing each
// result into the Tag Store. Grounded on the teacher's polling tasks in
// io/modbus_tcp (a `tokio::time::interval` loop spawned per device,
// logging failures through `tlog!` rather than propagating them), with
// the single-value-at-a-time flow generalised to walk a tag list instead
// of one fixed register block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::tlog;

use super::bridge::AddressSpaceFacade;
use super::client_pool::ClientPool;
use super::model::Tag;
use super::tag_store::TagStore;

/// Handle to a running per-device poll loop. Dropping this does not stop
/// the task; call `stop()` (spec.md §4.4 "Stopping a poller").
pub struct PollerHandle {
    device_id: String,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Signal the loop to exit after its current tick and wait for it to finish.
    pub async fn stop(self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Err(e) = self.task.await {
            tlog!("[Poller:{}] task join error: {}", self.device_id, e);
        }
    }
}

/// Spawn the poll loop for one device. `tags` is the device's declared tag
/// list in order; the loop re-reads it from the tag store's perspective
/// via `tag_order`/`get` so admin edits to the device (not yet supported
/// mid-flight, spec.md §4.7) would be reflected, but the tag shape itself
/// (address/type) is captured at spawn time since it cannot change without
/// a remove+re-add.
pub fn spawn(
    device_id: String,
    tags: Vec<Tag>,
    interval: Duration,
    pool: Arc<ClientPool>,
    store: Arc<TagStore>,
    bridge: Arc<dyn AddressSpaceFacade>,
) -> PollerHandle {
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_for_task = cancel.clone();
    let device_id_for_task = device_id.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if cancel_for_task.load(Ordering::Relaxed) {
                break;
            }
            poll_once(&device_id_for_task, &tags, &pool, &store, bridge.as_ref()).await;
        }
    });

    PollerHandle {
        device_id,
        cancel,
        task,
    }
}

async fn poll_once(
    device_id: &str,
    tags: &[Tag],
    pool: &ClientPool,
    store: &TagStore,
    bridge: &dyn AddressSpaceFacade,
) {
    if let Err(e) = pool.ensure_connected(device_id).await {
        tlog!("[Poller:{}] connect failed: {}", device_id, e);
        return;
    }

    for tag in tags {
        match pool.read_tag(device_id, tag).await {
            Ok(value) => {
                if let Err(e) = store.set_from_wire(device_id, &tag.name, value) {
                    tlog!("[Poller:{}] store update for '{}' failed: {}", device_id, tag.name, e);
                } else {
                    // spec.md §4.4 step 2 / §4.6: every successful poll republishes
                    // into the Address-Space Bridge, not just admin-initiated writes.
                    bridge.republish(device_id, &tag.name, value);
                }
            }
            Err(e) => {
                tlog!("[Poller:{}] read '{}' failed: {}", device_id, tag.name, e);
                // spec.md §4.3 failure policy already dropped the connection;
                // stop this tick's walk rather than hammering a dead transport.
                if e.recycles_transport() {
                    break;
                }
            }
        }
    }
}
