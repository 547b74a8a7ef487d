//! Bounded per-connection outbound queue.
//!
//! Overflow policy is drop-and-disconnect: a push never waits, and a full
//! queue is reported to the caller, which evicts the connection. Dropping the
//! [`Outbox`] closes the queue; the writer drains what is left and then sees
//! the end of the stream.

use tokio::sync::mpsc::{self, error::TrySendError};
use warp::ws::Message;

use crate::error::PushError;

pub fn channel(capacity: usize) -> (Outbox, Inbox) {
    let (tx, rx) = mpsc::channel(capacity);
    (Outbox { tx }, Inbox { rx })
}

/// Producer half. Owned by the registry entry of its connection.
#[derive(Debug)]
pub struct Outbox {
    tx: mpsc::Sender<Message>,
}

impl Outbox {
    pub fn push(&self, message: Message) -> Result<(), PushError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => PushError::Full,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }

    pub fn close(self) {}
}

/// Consumer half, drained by the connection's writer task.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Message>,
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// True once every queued message is drained and the producer is gone.
    #[cfg(test)]
    pub fn is_closed(&mut self) -> bool {
        matches!(
            self.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        )
    }
}
