//! Bounded single-producer/single-consumer queue of chunks.
//!
//! The queue is the only channel between the reader and writer stages of a
//! run. It bounds the chunks *in flight*: a chunk takes a [`Permit`] before
//! it is read and gives it back only once the writer has written it, so at
//! most `capacity × chunk_size` bytes are ever read but not yet written.
//! The blocking operations also watch the run's [`CancelToken`], so neither
//! stage can be left waiting on a peer that has stopped.

use crate::cancel::CancelToken;
use crossbeam_channel::{Receiver, Sender, select};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

enum Message {
    Chunk(Vec<u8>),
    End,
}

/// Why a queue operation could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueClosed {
    /// The run's cancel token was set.
    Cancelled,
    /// The other side was dropped without finishing the stream.
    Disconnected,
}

/// Room for one more chunk in flight, obtained from [`ChunkSender::reserve`].
#[must_use = "a permit is only given back once its chunk has been written"]
#[derive(Debug)]
pub struct Permit {
    _private: (),
}

/// Creates a queue allowing at most `capacity` chunks in flight.
///
/// `capacity` must be at least 1; a zero-capacity queue would be a rendezvous
/// channel rather than a buffer.
pub fn bounded(capacity: usize, cancel: &CancelToken) -> (ChunkSender, ChunkReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let (release, permits) = crossbeam_channel::bounded(capacity);
    for _ in 0..capacity {
        let _ = release.try_send(());
    }
    let peak = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));
    (
        ChunkSender {
            tx,
            permits,
            cancel: cancel.watch(),
            peak: Arc::clone(&peak),
            closed: Arc::clone(&closed),
            finished: false,
        },
        ChunkReceiver {
            rx,
            release,
            cancel: cancel.watch(),
            peak,
            closed,
        },
    )
}

pub struct ChunkSender {
    tx: Sender<Message>,
    permits: Receiver<()>,
    cancel: Receiver<()>,
    peak: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    finished: bool,
}

impl ChunkSender {
    /// Waits until fewer than `capacity` chunks are in flight.
    ///
    /// Call this before reading the chunk, so the read itself is held back.
    pub fn reserve(&self) -> Result<Permit, QueueClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueClosed::Disconnected);
        }
        select! {
            recv(self.permits) -> res => res
                .map(|()| Permit { _private: () })
                .map_err(|_| QueueClosed::Disconnected),
            recv(self.cancel) -> _ => Err(QueueClosed::Cancelled),
        }
    }

    /// Enqueues a chunk read under `permit`.
    pub fn push(&self, permit: Permit, chunk: Vec<u8>) -> Result<(), QueueClosed> {
        let Permit { _private: () } = permit;
        self.send(Message::Chunk(chunk))?;
        self.peak.fetch_max(self.tx.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Marks the end of the stream. The receiver sees `None` after draining.
    pub fn finish(mut self) -> Result<(), QueueClosed> {
        self.send(Message::End)?;
        self.finished = true;
        Ok(())
    }

    fn send(&self, msg: Message) -> Result<(), QueueClosed> {
        select! {
            send(self.tx, msg) -> res => res.map_err(|_| QueueClosed::Disconnected),
            recv(self.cancel) -> _ => Err(QueueClosed::Cancelled),
        }
    }
}

impl Drop for ChunkSender {
    /// A sender that goes away mid-stream stops the receiver at its next
    /// `pop`, before it writes any chunk still queued.
    fn drop(&mut self) {
        if !self.finished {
            self.closed.store(true, Ordering::Release);
        }
    }
}

pub struct ChunkReceiver {
    rx: Receiver<Message>,
    release: Sender<()>,
    cancel: Receiver<()>,
    peak: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl ChunkReceiver {
    /// Dequeues the next chunk, blocking while the queue is empty.
    ///
    /// Returns `Ok(None)` once the end-of-stream marker is reached.
    pub fn pop(&self) -> Result<Option<Vec<u8>>, QueueClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueClosed::Disconnected);
        }
        select! {
            recv(self.rx) -> msg => match msg {
                Ok(Message::Chunk(chunk)) => Ok(Some(chunk)),
                Ok(Message::End) => Ok(None),
                Err(_) => Err(QueueClosed::Disconnected),
            },
            recv(self.cancel) -> _ => Err(QueueClosed::Cancelled),
        }
    }

    /// Gives back the permit of a popped chunk once it has been written.
    pub fn release(&self) {
        let _ = self.release.try_send(());
    }

    /// Chunks currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Highest number of chunks observed in the queue after a push.
    pub fn peak_len(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

impl Drop for ChunkReceiver {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;
    use std::time::Duration;

    fn push(tx: &ChunkSender, chunk: Vec<u8>) -> Result<(), QueueClosed> {
        let permit = tx.reserve()?;
        tx.push(permit, chunk)
    }

    #[test]
    fn preserves_fifo_order_and_end_marker() {
        let cancel = CancelToken::new();
        let (tx, rx) = bounded(4, &cancel);
        push(&tx, vec![1]).unwrap();
        push(&tx, vec![2, 2]).unwrap();
        tx.finish().unwrap();

        assert_eq!(rx.pop().unwrap(), Some(vec![1]));
        assert_eq!(rx.pop().unwrap(), Some(vec![2, 2]));
        assert_eq!(rx.pop().unwrap(), None);
        assert_eq!(rx.peak_len(), 2);
    }

    #[test]
    fn reserve_waits_until_a_chunk_is_written() {
        let cancel = CancelToken::new();
        let (tx, rx) = bounded(2, &cancel);
        push(&tx, vec![0]).unwrap();
        push(&tx, vec![1]).unwrap();

        let reserved = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&reserved);
        let producer = thread::spawn(move || {
            push(&tx, vec![2]).unwrap();
            flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!reserved.load(Ordering::SeqCst));
        assert_eq!(rx.len(), 2);

        // Popped but not yet written: still in flight.
        assert_eq!(rx.pop().unwrap(), Some(vec![0]));
        thread::sleep(Duration::from_millis(50));
        assert!(!reserved.load(Ordering::SeqCst));

        rx.release();
        producer.join().unwrap();
        assert!(reserved.load(Ordering::SeqCst));
        assert!(rx.peak_len() <= 2);
    }

    #[test]
    fn cancel_unblocks_reserve() {
        let cancel = CancelToken::new();
        let (tx, _rx) = bounded(1, &cancel);
        push(&tx, vec![0]).unwrap();

        let producer = thread::spawn(move || tx.reserve().map(drop));
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert_eq!(producer.join().unwrap(), Err(QueueClosed::Cancelled));
    }

    #[test]
    fn cancel_unblocks_empty_pop() {
        let cancel = CancelToken::new();
        let (_tx, rx) = bounded(1, &cancel);

        let consumer = thread::spawn(move || rx.pop());
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert_eq!(consumer.join().unwrap(), Err(QueueClosed::Cancelled));
    }

    #[test]
    fn dropped_sender_is_reported_as_disconnect() {
        let cancel = CancelToken::new();
        let (tx, rx) = bounded(1, &cancel);
        drop(tx);
        assert_eq!(rx.pop(), Err(QueueClosed::Disconnected));
    }

    #[test]
    fn abandoned_stream_is_not_drained() {
        let cancel = CancelToken::new();
        let (tx, rx) = bounded(4, &cancel);
        push(&tx, vec![1]).unwrap();
        push(&tx, vec![2]).unwrap();
        drop(tx);

        assert_eq!(rx.len(), 2);
        assert_eq!(rx.pop(), Err(QueueClosed::Disconnected));
    }

    #[test]
    fn finished_stream_is_drained_after_sender_drops() {
        let cancel = CancelToken::new();
        let (tx, rx) = bounded(2, &cancel);
        push(&tx, vec![1]).unwrap();
        tx.finish().unwrap();

        assert_eq!(rx.pop().unwrap(), Some(vec![1]));
        assert_eq!(rx.pop().unwrap(), None);
    }

    #[test]
    fn dropped_receiver_fails_reserve() {
        let cancel = CancelToken::new();
        let (tx, rx) = bounded(1, &cancel);
        drop(rx);
        assert_eq!(tx.reserve().map(drop), Err(QueueClosed::Disconnected));
    }

    proptest! {
        #[test]
        fn concurrent_transfer_keeps_order_within_capacity(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..64), 0..40),
            capacity in 1usize..6,
        ) {
            let cancel = CancelToken::new();
            let (tx, rx) = bounded(capacity, &cancel);
            let expected = chunks.clone();
            let in_flight = Arc::new(AtomicUsize::new(0));
            let max_in_flight = Arc::new(AtomicUsize::new(0));

            let producer = {
                let in_flight = Arc::clone(&in_flight);
                let max_in_flight = Arc::clone(&max_in_flight);
                thread::spawn(move || {
                    for chunk in chunks {
                        let permit = tx.reserve().unwrap();
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(now, Ordering::SeqCst);
                        tx.push(permit, chunk).unwrap();
                    }
                    tx.finish().unwrap();
                })
            };

            let mut received = Vec::new();
            while let Some(chunk) = rx.pop().unwrap() {
                received.push(chunk);
                in_flight.fetch_sub(1, Ordering::SeqCst);
                rx.release();
            }
            producer.join().unwrap();

            prop_assert_eq!(received, expected);
            prop_assert!(rx.peak_len() <= capacity);
            prop_assert!(max_in_flight.load(Ordering::SeqCst) <= capacity);
        }
    }
}
