use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::fill_segment;
use crate::core::message::{ConnectionId, EventKind, Message};
use crate::utils::buffer_pool::BufferPool;

struct InboxState {
    queue: VecDeque<Message>,
    pool: BufferPool,
    // pending events per connection, entries removed at zero
    pending: HashMap<ConnectionId, usize>,
}

/// Receive queue shared by every connection of a server
///
/// Unlike [`super::ReceivePipe`], connection edges are queued as events so
/// each one keeps its connection id and its position relative to that
/// connection's data. Events of different connections interleave freely.
pub struct Inbox {
    state: Mutex<InboxState>,
}

impl Inbox {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            state: Mutex::new(InboxState {
                queue: VecDeque::new(),
                pool: BufferPool::new(max_message_size),
                pending: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an event; `bytes` is copied into a pooled buffer for `Data`
    pub fn enqueue(&self, connection_id: ConnectionId, kind: EventKind, bytes: Option<&[u8]>) {
        let mut state = self.lock();
        let message = match (kind, bytes) {
            (EventKind::Data, payload) => {
                let segment = fill_segment(&mut state.pool, payload.unwrap_or(&[]));
                Message::data(connection_id, segment)
            }
            (EventKind::Connected, _) => Message::connected(connection_id),
            (EventKind::Disconnected, _) => Message::disconnected(connection_id),
        };
        state.queue.push_back(message);
        *state.pending.entry(connection_id).or_insert(0) += 1;
    }

    /// Total number of queued events
    pub fn count(&self) -> usize {
        self.lock().queue.len()
    }

    /// Number of queued events belonging to one connection
    pub fn count_for(&self, connection_id: ConnectionId) -> usize {
        self.lock()
            .pending
            .get(&connection_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn pool_count(&self) -> usize {
        self.lock().pool.available()
    }

    /// Oldest event, left in the queue
    pub fn try_peek(&self) -> Option<Message> {
        self.lock().queue.front().cloned()
    }

    /// Remove the oldest event and retire its payload buffer
    pub fn try_dequeue(&self) -> bool {
        let mut state = self.lock();
        let Some(message) = state.queue.pop_front() else {
            return false;
        };

        if let Some(count) = state.pending.get_mut(&message.connection_id) {
            *count -= 1;
            if *count == 0 {
                state.pending.remove(&message.connection_id);
            }
        }
        if let Some(payload) = message.payload {
            state.pool.retire(payload.into_inner());
        }
        true
    }

    /// Dequeue everything, keeping the pool
    pub fn clear(&self) {
        let mut state = self.lock();
        let state = &mut *state;
        for message in state.queue.drain(..) {
            if let Some(payload) = message.payload {
                state.pool.retire(payload.into_inner());
            }
        }
        state.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_keep_connection_and_order() {
        let inbox = Inbox::new(16);
        inbox.enqueue(1, EventKind::Connected, None);
        inbox.enqueue(2, EventKind::Connected, None);
        inbox.enqueue(1, EventKind::Data, Some(b"hi"));
        inbox.enqueue(1, EventKind::Disconnected, None);

        assert_eq!(inbox.count(), 4);
        assert_eq!(inbox.count_for(1), 3);
        assert_eq!(inbox.count_for(2), 1);

        let kinds: Vec<(ConnectionId, EventKind)> = std::iter::from_fn(|| {
            let m = inbox.try_peek()?;
            inbox.try_dequeue();
            Some((m.connection_id, m.kind))
        })
        .collect();

        assert_eq!(
            kinds,
            vec![
                (1, EventKind::Connected),
                (2, EventKind::Connected),
                (1, EventKind::Data),
                (1, EventKind::Disconnected),
            ]
        );
        assert_eq!(inbox.count_for(1), 0);
        assert_eq!(inbox.pool_count(), 1);
    }

    #[test]
    fn test_edge_events_have_no_payload() {
        let inbox = Inbox::new(16);
        inbox.enqueue(7, EventKind::Connected, Some(b"ignored"));
        let m = inbox.try_peek().unwrap();
        assert!(m.payload.is_none());
        assert!(m.bytes().is_empty());
    }

    #[test]
    fn test_clear_resets_counts() {
        let inbox = Inbox::new(16);
        inbox.enqueue(3, EventKind::Data, Some(b"a"));
        inbox.enqueue(3, EventKind::Data, Some(b"b"));
        inbox.clear();
        assert_eq!(inbox.count(), 0);
        assert_eq!(inbox.count_for(3), 0);
        assert_eq!(inbox.pool_count(), 2);
    }
}
