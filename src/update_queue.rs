//! Queue of pending value updates, shared between host threads and the
//! engine's idle drain.
//!
//! Entries are `(object_path, interface_name)` pairs. Pushes insert at the
//! front and pops remove from the back, so the oldest pending update is
//! always processed first. Every operation takes the mutex, which makes the
//! queue the one safe meeting point between the host and the main loop.

use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

/// Interface name pushed by [`UpdateQueue::notify_updated_characteristic`].
pub const CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";

/// Interface name pushed by [`UpdateQueue::notify_updated_descriptor`].
pub const DESCRIPTOR_INTERFACE: &str = "org.bluez.GattDescriptor1";

/// Result of a buffer-oriented pop, mirrored by the C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopStatus {
    /// An entry was written into the buffer (length in bytes, no terminator).
    Ok(usize),
    /// The queue was empty; nothing was written.
    Empty,
    /// The entry would not fit; the queue is unchanged.
    BufferTooSmall,
}

#[derive(Debug, Default)]
pub struct UpdateQueue {
    entries: Mutex<VecDeque<(String, String)>>,
}

impl UpdateQueue {
    pub fn new() -> UpdateQueue {
        UpdateQueue::default()
    }

    /// Insert an update at the front of the queue. Always succeeds.
    pub fn push(&self, object_path: &str, interface_name: &str) {
        let mut entries = self.lock();
        entries.push_front((object_path.to_string(), interface_name.to_string()));
    }

    /// Take (or with `peek`, copy) the oldest entry, formatted as
    /// `"<path>|<interface>"`.
    pub fn pop(&self, peek: bool) -> Option<String> {
        let mut entries = self.lock();
        let (path, interface) = entries.back()?;
        let formatted = format!("{}|{}", path, interface);
        if !peek {
            entries.pop_back();
        }
        Some(formatted)
    }

    /// Buffer-oriented pop used by the C API. The formatted entry plus a NUL
    /// terminator must fit in `buffer`, otherwise the queue is left alone.
    pub fn pop_into(&self, buffer: &mut [u8], peek: bool) -> PopStatus {
        let mut entries = self.lock();
        let Some((path, interface)) = entries.back() else {
            return PopStatus::Empty;
        };

        let formatted = format!("{}|{}", path, interface);
        if formatted.len() + 1 > buffer.len() {
            return PopStatus::BufferTooSmall;
        }

        buffer[..formatted.len()].copy_from_slice(formatted.as_bytes());
        buffer[formatted.len()] = 0;
        if !peek {
            entries.pop_back();
        }
        PopStatus::Ok(formatted.len())
    }

    /// Queue an update for the characteristic at `object_path`.
    pub fn notify_updated_characteristic(&self, object_path: &str) {
        self.push(object_path, CHARACTERISTIC_INTERFACE);
    }

    /// Queue an update for the descriptor at `object_path`.
    pub fn notify_updated_descriptor(&self, object_path: &str) {
        self.push(object_path, DESCRIPTOR_INTERFACE);
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<(String, String)>> {
        // A poisoned queue mutex only means a panic mid-push; the data is
        // still a valid deque.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The process-wide queue used by the running server and the C API.
pub fn update_queue() -> &'static UpdateQueue {
    static QUEUE: OnceLock<UpdateQueue> = OnceLock::new();
    QUEUE.get_or_init(UpdateQueue::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_round_trip() {
        let queue = UpdateQueue::new();
        queue.push("/com/demo/x", "X1");

        assert_eq!(queue.pop(false).as_deref(), Some("/com/demo/x|X1"));
        assert_eq!(queue.pop(false), None);
    }

    #[test]
    fn test_fifo_order() {
        let queue = UpdateQueue::new();
        queue.push("/com/demo/x", "X1");
        queue.push("/com/demo/y", "Y1");

        assert_eq!(queue.pop(false).as_deref(), Some("/com/demo/x|X1"));
        assert_eq!(queue.pop(false).as_deref(), Some("/com/demo/y|Y1"));
    }

    #[test]
    fn test_peek_leaves_entry_in_place() {
        let queue = UpdateQueue::new();
        queue.push("/com/demo/x", "X1");
        queue.push("/com/demo/y", "Y1");

        assert_eq!(queue.pop(true).as_deref(), Some("/com/demo/x|X1"));
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.pop(false).as_deref(), Some("/com/demo/x|X1"));
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.pop(false).as_deref(), Some("/com/demo/y|Y1"));
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_pop_into_buffer_too_small() {
        let queue = UpdateQueue::new();
        queue.push("/com/demo/x", "X1");

        let mut small = [0u8; 4];
        assert_eq!(queue.pop_into(&mut small, false), PopStatus::BufferTooSmall);
        assert_eq!(queue.size(), 1);

        let mut big = [0u8; 64];
        match queue.pop_into(&mut big, false) {
            PopStatus::Ok(len) => {
                assert_eq!(&big[..len], b"/com/demo/x|X1");
                assert_eq!(big[len], 0);
            }
            other => panic!("unexpected pop status: {:?}", other),
        }
        assert_eq!(queue.pop_into(&mut big, false), PopStatus::Empty);
    }

    #[test]
    fn test_clear_empties_queue() {
        let queue = UpdateQueue::new();
        queue.notify_updated_characteristic("/com/demo/battery/level");
        queue.notify_updated_descriptor("/com/demo/text/string/description");
        assert_eq!(queue.size(), 2);

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_convenience_wrappers_use_bluez_interfaces() {
        let queue = UpdateQueue::new();
        queue.notify_updated_characteristic("/com/demo/a");
        assert_eq!(
            queue.pop(false).as_deref(),
            Some("/com/demo/a|org.bluez.GattCharacteristic1")
        );

        queue.notify_updated_descriptor("/com/demo/b");
        assert_eq!(
            queue.pop(false).as_deref(),
            Some("/com/demo/b|org.bluez.GattDescriptor1")
        );
    }
}
