//! Pending-request table: serial → (waiter, timer).
//!
//! One table per session, touched only on the context worker, so no
//! locking. An entry owns the request's timer; removing the entry drops
//! the timer, which aborts the scheduled timeout in the same step.

use std::collections::HashMap;

use crate::message::MsgRef;
use crate::protocol::MsgSerial;
use crate::timer::MessageTimer;

/// One outstanding request.
pub(crate) struct PendingEntry {
    /// The waiting message reference.
    pub msg: MsgRef,
    /// Armed timeout, if the submit requested one.
    pub timer: Option<MessageTimer>,
}

/// Map of outstanding requests keyed by serial number alone.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: HashMap<MsgSerial, PendingEntry>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding request. A duplicate serial replaces the
    /// old entry (and thereby cancels its timer).
    pub(crate) fn insert(&mut self, serial: MsgSerial, msg: MsgRef, timer: Option<MessageTimer>) {
        self.entries.insert(serial, PendingEntry { msg, timer });
    }

    /// Remove an entry. Dropping the returned entry destroys its timer.
    pub(crate) fn remove(&mut self, serial: MsgSerial) -> Option<PendingEntry> {
        self.entries.remove(&serial)
    }

    /// Drain every entry, for session teardown.
    pub(crate) fn drain(&mut self) -> Vec<(MsgSerial, PendingEntry)> {
        self.entries.drain().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, serial: MsgSerial) -> bool {
        self.entries.contains_key(&serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MsgHandle};
    use crate::protocol::MessageType;

    fn dummy_ref() -> MsgRef {
        MsgHandle::new(Message::new(MessageType::Request, 1))
    }

    #[test]
    fn test_insert_remove() {
        let mut table = PendingTable::new();
        table.insert(10, dummy_ref(), None);

        assert_eq!(table.len(), 1);
        assert!(table.contains(10));

        let entry = table.remove(10).unwrap();
        assert!(entry.timer.is_none());
        assert_eq!(table.len(), 0);
        assert!(table.remove(10).is_none());
    }

    #[test]
    fn test_duplicate_serial_replaces_entry() {
        let mut table = PendingTable::new();
        let first = dummy_ref();
        let second = dummy_ref();

        table.insert(7, first.clone(), None);
        table.insert(7, second.clone(), None);

        assert_eq!(table.len(), 1);
        let entry = table.remove(7).unwrap();
        assert!(std::sync::Arc::ptr_eq(&entry.msg, &second));
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = PendingTable::new();
        table.insert(1, dummy_ref(), None);
        table.insert(2, dummy_ref(), None);

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(table.len(), 0);
    }
}
