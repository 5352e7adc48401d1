// SPDX-License-Identifier: Apache-2.0

use flume::{Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::time::Duration;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

impl std::error::Error for SendError {}

/// Why a blocking receive returned without an item.
#[derive(Debug, PartialEq, Eq)]
pub enum TimeoutError {
    Timeout,
    Disconnected,
}

impl<T> BoundedSender<T> {
    /// Blocking send - blocks until there is capacity in the channel.
    /// Use this from non-async contexts (e.g., dedicated OS threads).
    pub fn send_blocking(&self, item: T) -> Result<(), SendError> {
        match self.tx.send(item) {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected), // receiver closed
        }
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// Blocking receive with timeout. Distinguishes an idle channel from one
    /// whose senders are all gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, TimeoutError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => TimeoutError::Timeout,
            RecvTimeoutError::Disconnected => TimeoutError::Disconnected,
        })
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);

    let sender = BoundedSender { tx };
    let receiver = BoundedReceiver { rx };

    (sender, receiver)
}

#[cfg(test)]
mod tests {
    use super::{SendError, TimeoutError, bounded};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn basics() {
        let (tx, rx) = bounded(3);

        tx.send_blocking(10).unwrap();
        tx.send_blocking(11).unwrap();

        assert_eq!(Ok(10), rx.recv_timeout(Duration::from_millis(10)));
        assert_eq!(Ok(11), rx.recv_timeout(Duration::from_millis(10)));
        // Drained
        assert_eq!(
            Err(TimeoutError::Timeout),
            rx.recv_timeout(Duration::from_millis(10))
        );
    }

    #[test]
    fn sender_blocks_until_capacity() {
        let (tx, rx) = bounded(1);
        tx.send_blocking(1).unwrap();

        let sender = {
            let tx = tx.clone();
            thread::spawn(move || tx.send_blocking(2))
        };

        assert_eq!(Ok(1), rx.recv_timeout(Duration::from_secs(5)));
        assert_eq!(Ok(2), rx.recv_timeout(Duration::from_secs(5)));
        assert_eq!(Ok(()), sender.join().unwrap());
    }

    #[test]
    fn sender_fails_on_rx_close() {
        let (tx, rx) = bounded(1);

        drop(rx);
        assert_eq!(Err(SendError::Disconnected), tx.send_blocking(10));
    }

    #[test]
    fn receive_timeouts() {
        let (tx, rx) = bounded::<u32>(1);

        assert_eq!(
            Err(TimeoutError::Timeout),
            rx.recv_timeout(Duration::from_millis(10))
        );

        tx.send_blocking(1).unwrap();
        drop(tx);
        // Buffered items are still delivered after the senders are gone
        assert_eq!(Ok(1), rx.recv_timeout(Duration::from_millis(10)));
        assert_eq!(
            Err(TimeoutError::Disconnected),
            rx.recv_timeout(Duration::from_millis(10))
        );
    }
}
