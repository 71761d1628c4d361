//! Published printer state: the copy renderers read, and the change
//! notifications that go with it.

use crate::errors::{PrinterError, Result};
use crate::notify::{Notification, NotificationSink};
use crate::status::{MinimalState, PrinterData, SharedText};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// What a reconcile pass changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reconciled {
    pub state_changed: bool,
    pub popup_changed: bool,
}

/// One published `PrinterData` per printer slot plus the roster.
///
/// Each slot sits behind its own std mutex. Holders never await while locked,
/// so readers only ever see a complete copy.
pub struct StatePublisher {
    slots: Vec<Mutex<PrinterData>>,
    roster: Mutex<Vec<MinimalState>>,
    sink: Arc<dyn NotificationSink>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking reader can't leave PrinterData half-written
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keep the published allocation when the text is unchanged, so pointer
/// identity means "same text".
fn carry_over(published: &SharedText, next: SharedText) -> SharedText {
    let next = next.normalized();
    if !next.ptr_eq(published) && next == *published {
        published.clone()
    } else {
        next
    }
}

impl StatePublisher {
    pub fn new(slot_count: usize, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            slots: (0..slot_count).map(|_| Mutex::new(PrinterData::default())).collect(),
            roster: Mutex::new(vec![MinimalState::default(); slot_count]),
            sink,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> Result<&Mutex<PrinterData>> {
        self.slots
            .get(index)
            .ok_or_else(|| PrinterError::PrinterNotFound(format!("slot {}", index)))
    }

    /// Copy a backend's staging state into slot `index` and notify.
    ///
    /// Text that was replaced is dropped here; its memory goes away once the
    /// last reader's clone does. The empty sentinel is never released.
    pub fn reconcile(&self, index: usize, staging: &PrinterData) -> Result<Reconciled> {
        let changes = {
            let mut published = lock(self.slot(index)?);

            let mut next = staging.clone();
            next.state_message = carry_over(&published.state_message, next.state_message);
            next.popup_message = carry_over(&published.popup_message, next.popup_message);
            next.print_filename = carry_over(&published.print_filename, next.print_filename);

            let changes = Reconciled {
                state_changed: published.state != next.state,
                popup_changed: !published.popup_message.ptr_eq(&next.popup_message),
            };

            *published = next;
            changes
        };

        if changes.state_changed {
            debug!("Slot {} changed state", index);
            self.sink.emit(Notification::StateChanged(index));
        }
        self.sink.emit(Notification::DataChanged(index));
        if changes.popup_changed {
            self.sink.emit(Notification::PopupChanged(index));
        }

        Ok(changes)
    }

    /// Read slot `index` under the render lock. `f` must not block.
    pub fn with_state<R>(&self, index: usize, f: impl FnOnce(&PrinterData) -> R) -> Option<R> {
        let slot = self.slots.get(index)?;
        let data = lock(slot);
        Some(f(&data))
    }

    pub fn snapshot(&self, index: usize) -> Option<PrinterData> {
        self.with_state(index, PrinterData::clone)
    }

    pub fn update_minimal(&self, index: usize, state: MinimalState) -> Result<()> {
        {
            let mut roster = lock(&self.roster);
            let entry = roster
                .get_mut(index)
                .ok_or_else(|| PrinterError::PrinterNotFound(format!("slot {}", index)))?;
            *entry = state;
        }

        self.sink.emit(Notification::MinimalDataChanged(index));
        Ok(())
    }

    pub fn minimal(&self, index: usize) -> Option<MinimalState> {
        lock(&self.roster).get(index).copied()
    }

    pub fn roster(&self) -> Vec<MinimalState> {
        lock(&self.roster).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::PrinterState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<Notification>>);

    impl RecordingSink {
        fn take(&self) -> Vec<Notification> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl NotificationSink for RecordingSink {
        fn emit(&self, notification: Notification) {
            self.0.lock().unwrap().push(notification);
        }
    }

    fn publisher(slots: usize) -> (StatePublisher, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (StatePublisher::new(slots, sink.clone()), sink)
    }

    #[test]
    fn test_notifications_follow_changes() {
        let (publisher, sink) = publisher(1);
        let mut staging = PrinterData {
            state: PrinterState::Idle,
            ..Default::default()
        };

        publisher.reconcile(0, &staging).unwrap();
        assert_eq!(sink.take(), vec![Notification::StateChanged(0), Notification::DataChanged(0)]);

        publisher.reconcile(0, &staging).unwrap();
        assert_eq!(sink.take(), vec![Notification::DataChanged(0)]);

        staging.popup_message.replace_if_changed("Heating bed");
        publisher.reconcile(0, &staging).unwrap();
        assert_eq!(sink.take(), vec![Notification::DataChanged(0), Notification::PopupChanged(0)]);

        // Same content from a fresh allocation is not a popup change
        staging.popup_message = SharedText::new("Heating bed");
        let changes = publisher.reconcile(0, &staging).unwrap();
        assert!(!changes.popup_changed);
    }

    #[test]
    fn test_empty_text_is_published_as_sentinel() {
        let (publisher, _) = publisher(1);
        let mut staging = PrinterData::default();
        staging.state_message.replace_if_changed("Printer is ready");
        publisher.reconcile(0, &staging).unwrap();

        staging.state_message.replace_if_changed("");
        publisher.reconcile(0, &staging).unwrap();

        assert!(publisher.with_state(0, |d| d.state_message.is_sentinel()).unwrap());
        assert!(publisher.with_state(0, |d| d.popup_message.is_sentinel()).unwrap());
    }

    #[test]
    fn test_replaced_text_outlives_reader_clone_only() {
        let (publisher, _) = publisher(1);
        let mut staging = PrinterData::default();
        staging.print_filename.replace_if_changed("first.gcode");
        publisher.reconcile(0, &staging).unwrap();

        let reader = publisher.with_state(0, |d| d.print_filename.clone()).unwrap();
        let weak = reader.downgrade();
        // staging still holds its handle too
        staging.print_filename.replace_if_changed("second.gcode");
        publisher.reconcile(0, &staging).unwrap();

        assert_eq!(reader.as_str(), "first.gcode");
        assert!(weak.upgrade().is_some());
        drop(reader);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_concurrent_readers_never_see_freed_text() {
        let (publisher, _) = publisher(2);
        let publisher = Arc::new(publisher);
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let publisher = publisher.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut reads = 0u64;
                    while !done.load(Ordering::Relaxed) {
                        let text = publisher.with_state(0, |d| d.state_message.clone()).unwrap();
                        assert!(text.is_empty() || text.starts_with("message "));
                        reads += 1;
                    }
                    reads
                })
            })
            .collect();

        let mut staging = PrinterData::default();
        for i in 0..1000 {
            let message = if i % 10 == 0 { String::new() } else { format!("message {}", i) };
            staging.state_message.replace_if_changed(&message);
            staging.state = if i % 2 == 0 { PrinterState::Idle } else { PrinterState::Printing };
            publisher.reconcile(0, &staging).unwrap();
        }

        done.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(publisher.snapshot(0).unwrap().state_message.as_str(), "message 999");
        assert!(publisher.snapshot(1).unwrap().state_message.is_sentinel());
    }

    #[test]
    fn test_unknown_slot() {
        let (publisher, sink) = publisher(1);
        assert!(matches!(
            publisher.reconcile(3, &PrinterData::default()),
            Err(PrinterError::PrinterNotFound(_))
        ));
        assert!(publisher.update_minimal(3, MinimalState::default()).is_err());
        assert!(sink.take().is_empty());
        assert!(publisher.snapshot(3).is_none());
    }

    #[test]
    fn test_roster_updates() {
        let (publisher, sink) = publisher(3);
        let entry = MinimalState {
            state: PrinterState::Printing,
            print_progress: 0.4,
            power_devices: 2,
            success: true,
        };

        publisher.update_minimal(1, entry).unwrap();
        assert_eq!(publisher.minimal(1), Some(entry));
        assert_eq!(publisher.roster()[0], MinimalState::default());
        assert_eq!(sink.take(), vec![Notification::MinimalDataChanged(1)]);
    }
}
