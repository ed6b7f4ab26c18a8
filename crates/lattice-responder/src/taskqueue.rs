//! Task queue — peer-fair, priority-ordered store of pending traversal
//! tasks.
//!
//! Within a peer, higher-priority tasks pop first (insertion order breaks
//! ties). Across peers, the thawed peer whose last pop is oldest is chosen.
//! A peer freezes the moment a batch of its tasks completes, so one busy
//! peer cannot be re-picked immediately; `thaw_round` reinstates everyone.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Mutex;

use lattice_core::message::{PeerId, RequestId};

/// Identity of the response a task drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseKey {
    pub peer: PeerId,
    pub request_id: RequestId,
}

impl ResponseKey {
    pub fn new(peer: PeerId, request_id: RequestId) -> Self {
        Self { peer, request_id }
    }
}

/// A unit of traversal work for one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub topic: ResponseKey,
    pub priority: i32,
    pub work: u64,
}

#[derive(Debug, Eq, PartialEq)]
struct QueuedTask {
    task: Task,
    /// Global insertion sequence; earlier wins on equal priority.
    seq: u64,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on priority, then min on seq (FIFO among equals).
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct PeerQueue {
    tasks: BinaryHeap<QueuedTask>,
    /// Sequence stamp of this peer's last pop; oldest goes first.
    last_popped: u64,
}

#[derive(Debug, Default)]
struct Inner {
    peers: HashMap<PeerId, PeerQueue>,
    frozen: HashSet<PeerId>,
    next_seq: u64,
}

/// Peer-fair priority task queue. Safe for concurrent use on all
/// operations.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<Inner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue tasks for a peer.
    pub fn push_tasks(&self, peer: PeerId, tasks: impl IntoIterator<Item = Task>) {
        let mut inner = self.inner.lock().expect("task queue poisoned");
        for task in tasks {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner
                .peers
                .entry(peer)
                .or_default()
                .tasks
                .push(QueuedTask { task, seq });
        }
    }

    /// Pop tasks for a single peer until their summed work reaches
    /// `target_min_work`. Returns no tasks when every non-empty peer is
    /// frozen.
    pub fn pop_tasks(&self, target_min_work: u64) -> (Option<PeerId>, Vec<Task>, u64) {
        let mut inner = self.inner.lock().expect("task queue poisoned");

        let chosen = inner
            .peers
            .iter()
            .filter(|(peer, queue)| !queue.tasks.is_empty() && !inner.frozen.contains(*peer))
            .min_by_key(|(_, queue)| queue.last_popped)
            .map(|(peer, _)| *peer);

        let Some(peer) = chosen else {
            return (None, Vec::new(), 0);
        };

        let stamp = inner.next_seq;
        inner.next_seq += 1;

        let queue = inner.peers.get_mut(&peer).expect("chosen peer exists");
        queue.last_popped = stamp;

        let mut tasks = Vec::new();
        let mut accumulated = 0u64;
        while accumulated < target_min_work {
            let Some(queued) = queue.tasks.pop() else {
                break;
            };
            accumulated += queued.task.work;
            tasks.push(queued.task);
        }

        (Some(peer), tasks, accumulated)
    }

    /// Drop a queued task by topic. Missing topics are a no-op.
    pub fn remove(&self, topic: ResponseKey, peer: PeerId) {
        let mut inner = self.inner.lock().expect("task queue poisoned");
        if let Some(queue) = inner.peers.get_mut(&peer) {
            let retained: Vec<QueuedTask> = queue
                .tasks
                .drain()
                .filter(|q| q.task.topic != topic)
                .collect();
            queue.tasks = retained.into_iter().collect();
        }
    }

    /// Report a popped batch complete. Freezes the peer until the next
    /// thaw so it cannot be re-picked immediately.
    pub fn tasks_done(&self, peer: PeerId, _tasks: &[Task]) {
        let mut inner = self.inner.lock().expect("task queue poisoned");
        inner.frozen.insert(peer);
    }

    /// Reinstate every frozen peer.
    pub fn thaw_round(&self) {
        let mut inner = self.inner.lock().expect("task queue poisoned");
        inner.frozen.clear();
    }

    /// Number of queued tasks across all peers.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("task queue poisoned");
        inner.peers.values().map(|q| q.tasks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(peer: PeerId, id: RequestId) -> ResponseKey {
        ResponseKey::new(peer, id)
    }

    fn task(peer: PeerId, id: RequestId, priority: i32) -> Task {
        Task {
            topic: key(peer, id),
            priority,
            work: 1,
        }
    }

    const P1: PeerId = [1u8; 32];
    const P2: PeerId = [2u8; 32];

    #[test]
    fn pop_from_empty_queue_returns_nothing() {
        let queue = TaskQueue::new();
        let (peer, tasks, work) = queue.pop_tasks(1);
        assert!(peer.is_none());
        assert!(tasks.is_empty());
        assert_eq!(work, 0);
    }

    #[test]
    fn priority_order_within_a_peer() {
        let queue = TaskQueue::new();
        queue.push_tasks(P1, [task(P1, 1, 0), task(P1, 2, 10), task(P1, 3, 5)]);

        let mut popped = Vec::new();
        for _ in 0..3 {
            let (_, tasks, _) = queue.pop_tasks(1);
            popped.extend(tasks.into_iter().map(|t| t.topic.request_id));
        }
        assert_eq!(popped, vec![2, 3, 1]);
    }

    #[test]
    fn equal_priority_pops_in_insertion_order() {
        let queue = TaskQueue::new();
        queue.push_tasks(P1, [task(P1, 1, 0), task(P1, 2, 0), task(P1, 3, 0)]);

        let mut popped = Vec::new();
        for _ in 0..3 {
            let (_, tasks, _) = queue.pop_tasks(1);
            popped.extend(tasks.into_iter().map(|t| t.topic.request_id));
        }
        assert_eq!(popped, vec![1, 2, 3]);
    }

    #[test]
    fn pop_accumulates_work_to_target() {
        let queue = TaskQueue::new();
        queue.push_tasks(
            P1,
            [
                Task {
                    topic: key(P1, 1),
                    priority: 0,
                    work: 2,
                },
                Task {
                    topic: key(P1, 2),
                    priority: 0,
                    work: 2,
                },
                Task {
                    topic: key(P1, 3),
                    priority: 0,
                    work: 2,
                },
            ],
        );
        let (_, tasks, work) = queue.pop_tasks(3);
        assert_eq!(tasks.len(), 2);
        assert_eq!(work, 4);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn fairness_alternates_between_peers() {
        let queue = TaskQueue::new();
        queue.push_tasks(P1, [task(P1, 1, 0), task(P1, 2, 0)]);
        queue.push_tasks(P2, [task(P2, 1, 0), task(P2, 2, 0)]);

        let mut peers = Vec::new();
        for _ in 0..4 {
            let (peer, tasks, _) = queue.pop_tasks(1);
            assert_eq!(tasks.len(), 1);
            peers.push(peer.unwrap());
        }
        // Least-recently-popped first: strict alternation.
        assert_eq!(peers[0], peers[2]);
        assert_eq!(peers[1], peers[3]);
        assert_ne!(peers[0], peers[1]);
    }

    #[test]
    fn frozen_peer_is_skipped_until_thaw() {
        let queue = TaskQueue::new();
        queue.push_tasks(P1, [task(P1, 1, 0), task(P1, 2, 0)]);

        let (peer, tasks, _) = queue.pop_tasks(1);
        assert_eq!(peer, Some(P1));
        queue.tasks_done(P1, &tasks);

        let (peer, tasks, _) = queue.pop_tasks(1);
        assert!(peer.is_none(), "frozen peer must not be re-picked");
        assert!(tasks.is_empty());

        queue.thaw_round();
        let (peer, tasks, _) = queue.pop_tasks(1);
        assert_eq!(peer, Some(P1));
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn freeze_does_not_block_other_peers() {
        let queue = TaskQueue::new();
        queue.push_tasks(P1, [task(P1, 1, 0)]);
        queue.push_tasks(P2, [task(P2, 1, 0)]);

        let (first, tasks, _) = queue.pop_tasks(1);
        queue.tasks_done(first.unwrap(), &tasks);

        let (second, _, _) = queue.pop_tasks(1);
        assert!(second.is_some());
        assert_ne!(first, second);
    }

    #[test]
    fn remove_drops_only_the_named_topic() {
        let queue = TaskQueue::new();
        queue.push_tasks(P1, [task(P1, 1, 0), task(P1, 2, 0)]);
        queue.remove(key(P1, 1), P1);
        assert_eq!(queue.len(), 1);

        let (_, tasks, _) = queue.pop_tasks(1);
        assert_eq!(tasks[0].topic.request_id, 2);
    }

    #[test]
    fn remove_missing_topic_is_a_no_op() {
        let queue = TaskQueue::new();
        queue.remove(key(P1, 99), P1);
        queue.push_tasks(P1, [task(P1, 1, 0)]);
        queue.remove(key(P2, 1), P2);
        assert_eq!(queue.len(), 1);
    }
}
