//! Channel ID allocation and reply queue recycling.

use crate::channel::VppReply;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::mpsc;

/// Issues unique IDs in `1..=max` and recycles released ones.
///
/// Fresh IDs are handed out before released ones.
pub(crate) struct IdPool {
    state: Mutex<IdPoolState>,
}

struct IdPoolState {
    max: u16,
    next: u32,
    free: VecDeque<u16>,
    in_use: HashSet<u16>,
}

impl IdPool {
    pub fn new(max: u16) -> Self {
        Self {
            state: Mutex::new(IdPoolState {
                max,
                next: 1,
                free: VecDeque::new(),
                in_use: HashSet::new(),
            }),
        }
    }

    /// Returns an unused ID, or `None` when all are taken.
    pub fn allocate(&self) -> Option<u16> {
        let mut state = self.state.lock();
        let id = if state.next <= u32::from(state.max) {
            let id = state.next as u16;
            state.next += 1;
            id
        } else {
            state.free.pop_front()?
        };
        state.in_use.insert(id);
        Some(id)
    }

    /// Returns an ID to the pool. Unknown IDs are ignored.
    pub fn release(&self, id: u16) -> bool {
        let mut state = self.state.lock();
        if !state.in_use.remove(&id) {
            return false;
        }
        state.free.push_back(id);
        true
    }

    #[cfg(test)]
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use.len()
    }
}

/// Both ends of a channel's reply queue.
pub(crate) struct ReplyQueue {
    pub tx: mpsc::Sender<VppReply>,
    pub rx: mpsc::Receiver<VppReply>,
    capacity: usize,
}

impl ReplyQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self { tx, rx, capacity }
    }

    /// Discards every queued reply. Returns how many were dropped.
    pub fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Free list of reply queues keyed by the channel ID that last used them.
#[derive(Default)]
pub(crate) struct ChannelPool {
    free: Mutex<HashMap<u16, ReplyQueue>>,
}

impl ChannelPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the recycled queue for `channel_id` if its capacity matches,
    /// otherwise allocates a new one. Recycled queues are drained first.
    pub fn acquire(&self, channel_id: u16, capacity: usize) -> ReplyQueue {
        let recycled = self.free.lock().remove(&channel_id);
        match recycled {
            Some(mut queue) if queue.capacity == capacity => {
                let dropped = queue.drain();
                if dropped > 0 {
                    tracing::debug!(
                        "discarded {} stale replies while reusing channel {}",
                        dropped,
                        channel_id
                    );
                }
                queue
            }
            _ => ReplyQueue::new(capacity),
        }
    }

    pub fn release(&self, channel_id: u16, queue: ReplyQueue) {
        self.free.lock().insert(channel_id, queue);
    }

    pub fn clear(&self) {
        self.free.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use vppapi_protocol::MAX_CHANNEL_ID;

    fn reply(seq_num: u16) -> VppReply {
        VppReply {
            msg_id: 1,
            seq_num,
            data: Bytes::new(),
            last_received: false,
            err: None,
        }
    }

    #[test]
    fn test_ids_start_at_one() {
        let pool = IdPool::new(MAX_CHANNEL_ID);
        assert_eq!(pool.allocate(), Some(1));
        assert_eq!(pool.allocate(), Some(2));
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let pool = IdPool::new(3);
        assert_eq!(pool.allocate(), Some(1));
        assert_eq!(pool.allocate(), Some(2));
        assert_eq!(pool.allocate(), Some(3));
        assert_eq!(pool.allocate(), None);

        assert!(pool.release(2));
        assert!(!pool.release(2));
        assert!(!pool.release(9));
        assert_eq!(pool.allocate(), Some(2));
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn test_fresh_ids_before_recycled() {
        let pool = IdPool::new(10);
        let first = pool.allocate().unwrap();
        pool.release(first);
        assert_eq!(pool.allocate(), Some(2));
    }

    #[test]
    fn test_full_range() {
        let pool = IdPool::new(MAX_CHANNEL_ID);
        for expected in 1..=MAX_CHANNEL_ID {
            assert_eq!(pool.allocate(), Some(expected));
        }
        assert_eq!(pool.allocate(), None);
    }

    #[tokio::test]
    async fn test_recycled_queue_is_drained() {
        let pool = ChannelPool::new();
        let queue = pool.acquire(4, 8);
        queue.tx.send(reply(1)).await.unwrap();
        queue.tx.send(reply(2)).await.unwrap();
        pool.release(4, queue);
        assert_eq!(pool.len(), 1);

        let mut queue = pool.acquire(4, 8);
        assert_eq!(pool.len(), 0);
        assert!(queue.rx.try_recv().is_err());

        // the recycled sender still feeds the recycled receiver
        queue.tx.send(reply(3)).await.unwrap();
        assert_eq!(queue.rx.recv().await.unwrap().seq_num, 3);
    }

    #[test]
    fn test_capacity_mismatch_allocates_new_queue() {
        let pool = ChannelPool::new();
        let queue = pool.acquire(1, 8);
        pool.release(1, queue);

        let queue = pool.acquire(1, 16);
        assert_eq!(queue.capacity, 16);
        assert_eq!(pool.len(), 0);
    }
}
