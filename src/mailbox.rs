//! Flare-backed channels for subscribers and status feeds.
//!
//! A mailbox pairs a bounded crossbeam channel with a [`Flare`] so blocking
//! consumers can wait on a file descriptor for readiness.

use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::flare::Flare;

/// Creates a connected sender/mailbox pair with the given capacity.
pub fn channel<T>(capacity: usize) -> std::io::Result<(MailboxSender<T>, Mailbox<T>)> {
    let (tx, rx) = channel::bounded(capacity);
    let flare = Arc::new(Flare::new()?);
    let sender = MailboxSender {
        tx,
        flare: Arc::clone(&flare),
    };
    let mailbox = Mailbox { rx, flare };
    Ok((sender, mailbox))
}

/// Outcome of a non-blocking mailbox send.
pub enum SendOutcome<T> {
    Delivered,
    /// The mailbox is at capacity; the item is handed back.
    Full(T),
    /// The consumer is gone.
    Closed,
}

pub struct MailboxSender<T> {
    tx: Sender<T>,
    flare: Arc<Flare>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            flare: Arc::clone(&self.flare),
        }
    }
}

impl<T> MailboxSender<T> {
    /// Never blocks the caller.
    pub fn try_send(&self, item: T) -> SendOutcome<T> {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.flare.fire();
                SendOutcome::Delivered
            }
            Err(TrySendError::Full(item)) => SendOutcome::Full(item),
            Err(TrySendError::Disconnected(_)) => SendOutcome::Closed,
        }
    }
}

/// The consuming end. Each successful receive extinguishes one flare byte,
/// so the descriptor stays level with the queue.
pub struct Mailbox<T> {
    rx: Receiver<T>,
    flare: Arc<Flare>,
}

impl<T> Mailbox<T> {
    pub fn try_recv(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => {
                self.flare.extinguish_one();
                Some(item)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let item = self.rx.recv_timeout(timeout)?;
        self.flare.extinguish_one();
        Ok(item)
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Readable whenever the mailbox holds at least one item.
    pub fn ready_fd(&self) -> BorrowedFd<'_> {
        self.flare.fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_fires_the_flare() {
        let (tx, rx) = channel::<u32>(4).unwrap();
        assert!(matches!(tx.try_send(7), SendOutcome::Delivered));
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.try_recv(), Some(7));
        assert!(rx.is_empty());
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn full_mailbox_hands_the_item_back() {
        let (tx, _rx) = channel::<u32>(1).unwrap();
        assert!(matches!(tx.try_send(1), SendOutcome::Delivered));
        match tx.try_send(2) {
            SendOutcome::Full(item) => assert_eq!(item, 2),
            _ => panic!("expected full mailbox"),
        }
    }

    #[test]
    fn closed_mailbox_reports_closed() {
        let (tx, rx) = channel::<u32>(1).unwrap();
        drop(rx);
        assert!(matches!(tx.try_send(1), SendOutcome::Closed));
    }

    #[test]
    fn recv_timeout_observes_delivery() {
        let (tx, rx) = channel::<u32>(1).unwrap();
        tx.try_send(9);
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)).unwrap(), 9);
        assert!(rx
            .recv_timeout(Duration::from_millis(10))
            .is_err());
    }
}
