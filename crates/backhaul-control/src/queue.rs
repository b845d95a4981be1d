//! Per-alias FIFO queues of clients waiting for a data connection

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

/// Process-unique identifier of a waiting client
pub type ClientId = u64;

/// A client connection waiting to be paired.
///
/// `handle` is whatever the owner of the client socket needs to receive its
/// data connection through; the registry never looks inside it.
#[derive(Debug)]
pub struct PendingClient<T> {
    pub id: ClientId,
    pub alias: String,
    pub peer: SocketAddr,
    pub enqueued_at: DateTime<Utc>,
    pub handle: T,
}

/// One FIFO per configured alias.
///
/// A client is in at most one queue, and leaves it exactly once: popped for
/// pairing, removed on disconnect, or drained on session teardown.
#[derive(Debug)]
pub struct WaitingQueueRegistry<T> {
    queues: HashMap<String, VecDeque<PendingClient<T>>>,
}

impl<T> WaitingQueueRegistry<T> {
    /// Create an empty queue for each alias
    pub fn new<'a>(aliases: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            queues: aliases
                .into_iter()
                .map(|alias| (alias.to_string(), VecDeque::new()))
                .collect(),
        }
    }

    /// Append a client to its alias's queue.
    ///
    /// Hands the client back if the alias has no queue.
    pub fn push(&mut self, client: PendingClient<T>) -> Result<(), PendingClient<T>> {
        match self.queues.get_mut(&client.alias) {
            Some(queue) => {
                queue.push_back(client);
                Ok(())
            }
            None => Err(client),
        }
    }

    /// Remove and return the oldest waiting client for `alias`
    pub fn pop_oldest(&mut self, alias: &str) -> Option<PendingClient<T>> {
        self.queues.get_mut(alias)?.pop_front()
    }

    /// Remove a specific client, e.g. because it disconnected while waiting
    pub fn remove(&mut self, alias: &str, id: ClientId) -> Option<PendingClient<T>> {
        let queue = self.queues.get_mut(alias)?;
        let index = queue.iter().position(|client| client.id == id)?;
        queue.remove(index)
    }

    /// Empty every queue, oldest first within each alias
    pub fn drain_all(&mut self) -> Vec<PendingClient<T>> {
        self.queues
            .values_mut()
            .flat_map(|queue| queue.drain(..))
            .collect()
    }

    pub fn len(&self, alias: &str) -> usize {
        self.queues.get(alias).map_or(0, VecDeque::len)
    }

    pub fn total_len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    pub fn has_alias(&self, alias: &str) -> bool {
        self.queues.contains_key(alias)
    }
}
