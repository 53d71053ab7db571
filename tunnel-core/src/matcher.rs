//! The Matcher: pairs an authorized pipe arriving on either listener with
//! the oldest pending counterpart under the same tunnel key.

use crate::pipe::SocketPipe;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Which listener a pipe arrived on. The Relay side of a tunnel waits in the
/// Public listener's pending map and vice versa — each pipe waits where its
/// future counterpart will look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Relay,
    Public,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Relay => Side::Public,
            Side::Public => Side::Relay,
        }
    }
}

#[derive(Default)]
struct Queues {
    relay_pending: HashMap<String, VecDeque<SocketPipe>>,
    public_pending: HashMap<String, VecDeque<SocketPipe>>,
}

impl Queues {
    fn pending_for(&mut self, side: Side) -> &mut HashMap<String, VecDeque<SocketPipe>> {
        match side {
            Side::Relay => &mut self.relay_pending,
            Side::Public => &mut self.public_pending,
        }
    }
}

/// Pairs authorized pipes arriving on either listener, partitioned by tunnel
/// key.
///
/// The lookup-dequeue-enqueue sequence for a single arrival spans both
/// listeners' pending maps, so one mutex covers both: a per-shard lock on a
/// concurrent map alone would not serialize the whole sequence.
pub struct Matcher {
    queues: Mutex<Queues>,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
        }
    }

    /// Pair `pipe`, arriving on `side`, with the oldest pending counterpart
    /// under the same tunnel key. Returns `(pipe, counterpart)` if a
    /// counterpart was found; otherwise `pipe` has been enqueued onto its own
    /// side's pending map and `None` is returned.
    pub fn pair_or_enqueue(&self, side: Side, pipe: SocketPipe) -> Option<(SocketPipe, SocketPipe)> {
        let mut queues = self.queues.lock().expect("matcher mutex poisoned");
        let key = pipe.tunnel_key.clone();

        let counterpart_queue = queues.pending_for(side.other());
        if let Some(queue) = counterpart_queue.get_mut(&key) {
            if let Some(counterpart) = queue.pop_front() {
                if queue.is_empty() {
                    counterpart_queue.remove(&key);
                }
                return Some((pipe, counterpart));
            }
        }

        queues
            .pending_for(side)
            .entry(key)
            .or_default()
            .push_back(pipe);
        None
    }

    /// Number of pipes currently waiting, across all tunnel keys, on `side`'s
    /// pending map. Exposed for pool-size and shutdown bookkeeping.
    pub fn pending_count(&self, side: Side) -> usize {
        let mut queues = self.queues.lock().expect("matcher mutex poisoned");
        queues.pending_for(side).values().map(VecDeque::len).sum()
    }

    /// Drain every pipe from both pending maps, for operator-initiated
    /// shutdown.
    pub fn drain_all(&self) -> Vec<SocketPipe> {
        let mut queues = self.queues.lock().expect("matcher mutex poisoned");
        let mut drained = Vec::new();
        for queue in queues.relay_pending.values_mut() {
            drained.extend(queue.drain(..));
        }
        for queue in queues.public_pending.values_mut() {
            drained.extend(queue.drain(..));
        }
        queues.relay_pending.clear();
        queues.public_pending.clear();
        drained
    }
}
