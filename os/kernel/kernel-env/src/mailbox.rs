//! Bounded message queue for inter-environment IPC.

use crate::Handle;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;
use kernel_sync::SpinLock;

/// Byte budget of one mailbox.
pub const MAILBOX_BYTES: usize = 64 * 1024;

/// Receiver id that matches any receiver.
pub const ANY_RECEIVER: u32 = 0;

/// Per-message header: handle count, byte count, receiver and sender ids.
const HEADER_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
    #[error("mailbox full: {needed} bytes needed, {free} free")]
    Full { needed: usize, free: usize },
    #[error("message of {0} bytes can never fit")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tx_id: u32,
    /// [`ANY_RECEIVER`] for whoever asks first.
    pub rx_id: u32,
    pub handles: Vec<Handle>,
    pub data: Vec<u8>,
}

impl Message {
    /// Bytes the message occupies in the budget (8-byte granules).
    #[must_use]
    pub fn footprint(&self) -> usize {
        (HEADER_BYTES + self.handles.len() * size_of::<Handle>() + self.data.len()).next_multiple_of(8)
    }

    fn fits_header(&self) -> bool {
        self.handles.len() <= u16::MAX as usize && self.data.len() <= u16::MAX as usize
    }
}

#[derive(Default)]
struct Inbox {
    queue: VecDeque<Message>,
    used: usize,
}

#[derive(Default)]
pub struct Mailbox {
    inbox: SpinLock<Inbox>,
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("locked", &self.inbox.is_locked())
            .finish_non_exhaustive()
    }
}

impl Mailbox {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inbox: SpinLock::new(Inbox {
                queue: VecDeque::new(),
                used: 0,
            }),
        }
    }

    /// Queue `msg` behind everything already sent.
    ///
    /// # Errors
    /// * [`MailboxError::TooLarge`] if the message exceeds the whole budget
    ///   or its header counters.
    /// * [`MailboxError::Full`] if it does not fit right now.
    pub fn send(&self, msg: Message) -> Result<(), MailboxError> {
        let needed = msg.footprint();
        if needed > MAILBOX_BYTES || !msg.fits_header() {
            return Err(MailboxError::TooLarge(needed));
        }
        let mut inbox = self.inbox.lock();
        let free = MAILBOX_BYTES - inbox.used;
        if needed > free {
            return Err(MailboxError::Full { needed, free });
        }
        inbox.used += needed;
        inbox.queue.push_back(msg);
        Ok(())
    }

    /// Oldest message addressed to `rx_id` or to [`ANY_RECEIVER`].
    pub fn recv(&self, rx_id: u32) -> Option<Message> {
        let mut inbox = self.inbox.lock();
        let at = inbox
            .queue
            .iter()
            .position(|m| m.rx_id == rx_id || m.rx_id == ANY_RECEIVER)?;
        let msg = inbox.queue.remove(at)?;
        inbox.used -= msg.footprint();
        Some(msg)
    }

    /// Budget bytes in use.
    #[must_use]
    pub fn used(&self) -> usize {
        self.inbox.lock().used
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inbox.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inbox.lock().queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(tx_id: u32, rx_id: u32, len: usize) -> Message {
        Message {
            tx_id,
            rx_id,
            handles: Vec::new(),
            data: vec![0xAB; len],
        }
    }

    #[test]
    fn footprint_is_header_plus_payload_in_granules() {
        assert_eq!(msg(1, 2, 0).footprint(), 16);
        assert_eq!(msg(1, 2, 1).footprint(), 24);
        let with_handles = Message {
            handles: vec![Handle::from_raw(5), Handle::from_raw(6)],
            ..msg(1, 2, 8)
        };
        assert_eq!(with_handles.footprint(), 32);
    }

    #[test]
    fn recv_matches_receiver_or_any() {
        let mb = Mailbox::new();
        mb.send(msg(1, 7, 4)).unwrap();
        mb.send(msg(2, ANY_RECEIVER, 4)).unwrap();
        mb.send(msg(3, 9, 4)).unwrap();

        assert_eq!(mb.recv(9).map(|m| m.tx_id), Some(2));
        assert_eq!(mb.recv(9).map(|m| m.tx_id), Some(3));
        assert!(mb.recv(9).is_none());
        assert_eq!(mb.recv(7).map(|m| m.tx_id), Some(1));
        assert!(mb.is_empty());
        assert_eq!(mb.used(), 0);
    }

    #[test]
    fn budget_is_enforced() {
        let mb = Mailbox::new();
        // 16 + 16368 = 16 KiB per message
        for _ in 0..4 {
            mb.send(msg(1, 0, 16 * 1024 - 16)).unwrap();
        }
        assert_eq!(mb.used(), MAILBOX_BYTES);
        assert_eq!(
            mb.send(msg(1, 0, 0)),
            Err(MailboxError::Full { needed: 16, free: 0 })
        );
        mb.recv(0).unwrap();
        mb.send(msg(1, 0, 100)).unwrap();
        assert_eq!(mb.len(), 4);
    }

    #[test]
    fn oversized_messages_are_rejected() {
        let mb = Mailbox::new();
        assert!(matches!(
            mb.send(msg(1, 0, MAILBOX_BYTES)),
            Err(MailboxError::TooLarge(_))
        ));
        assert!(mb.is_empty());
    }
}
