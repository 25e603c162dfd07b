//! # Host Hooks
//!
//! Strategy injection points for the host application. Recovery policy
//! is not a decision this crate makes: when validation fails on load,
//! the registered handler chooses between discarding the store and a
//! best-effort recovery (the default).
//!
//! Change notifications are informational. They fire after a successful
//! cross-process reload, and only while the host has switched them on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// What to do when a store fails validation on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Truncate logical state to zero length.
    Discard,
    /// Load as much intact data as possible and rewrite the file.
    Recover,
}

/// Callbacks a host can register process-wide. All methods have
/// defaults, so implementors override only what they care about.
pub trait StoreEventHandler: Send + Sync {
    /// CRC validation failed for `store_id`.
    fn on_crc_check_fail(&self, _store_id: &str) -> RecoveryStrategy {
        RecoveryStrategy::Recover
    }

    /// The recorded length of `store_id` is out of range.
    fn on_file_length_error(&self, _store_id: &str) -> RecoveryStrategy {
        RecoveryStrategy::Recover
    }

    /// Another process rewrote `store_id`; the local view was reloaded.
    fn on_content_changed_by_outer_process(&self, _store_id: &str) {}
}

static HANDLER: OnceLock<RwLock<Option<Arc<dyn StoreEventHandler>>>> = OnceLock::new();
static NOTIFY_CONTENT_CHANGE: AtomicBool = AtomicBool::new(false);

fn handler_slot() -> &'static RwLock<Option<Arc<dyn StoreEventHandler>>> {
    HANDLER.get_or_init(|| RwLock::new(None))
}

/// Install the process-wide event handler.
pub fn register_event_handler(handler: Arc<dyn StoreEventHandler>) {
    if let Ok(mut slot) = handler_slot().write() {
        *slot = Some(handler);
    }
}

/// Remove the process-wide event handler, restoring default policies.
pub fn unregister_event_handler() {
    if let Ok(mut slot) = handler_slot().write() {
        *slot = None;
    }
}

/// Switch cross-process change notifications on or off.
pub fn set_content_change_notification(enabled: bool) {
    NOTIFY_CONTENT_CHANGE.store(enabled, Ordering::Relaxed);
}

pub(crate) fn crc_check_fail_strategy(store_id: &str) -> RecoveryStrategy {
    match handler_slot().read() {
        Ok(slot) => slot
            .as_ref()
            .map_or(RecoveryStrategy::Recover, |h| h.on_crc_check_fail(store_id)),
        Err(_) => RecoveryStrategy::Recover,
    }
}

pub(crate) fn file_length_error_strategy(store_id: &str) -> RecoveryStrategy {
    match handler_slot().read() {
        Ok(slot) => slot
            .as_ref()
            .map_or(RecoveryStrategy::Recover, |h| h.on_file_length_error(store_id)),
        Err(_) => RecoveryStrategy::Recover,
    }
}

pub(crate) fn notify_content_changed(store_id: &str) {
    if !NOTIFY_CONTENT_CHANGE.load(Ordering::Relaxed) {
        return;
    }
    if let Ok(slot) = handler_slot().read() {
        if let Some(handler) = slot.as_ref() {
            handler.on_content_changed_by_outer_process(store_id);
        }
    }
}
