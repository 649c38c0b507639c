//! Serialized Execution Queue.
//!
//! Work submitted under the same key runs strictly one at a time, in the
//! order it was enqueued. Different keys never wait on each other.
//!
//! Ticket ids are for introspection only. Lane positions are tracked by an
//! internal slot number, so two handles enqueued with the same ticket id
//! still run one after the other.
//!
//! Each key owns a lane: a FIFO of tickets plus a `watch` channel whose value
//! is bumped whenever a ticket leaves the lane. A waiting handle runs once its
//! ticket reaches the head. A ticket is removed when its task completes, fails
//! or panics, and also when its handle is dropped before running.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use uuid::Uuid;

pub type TicketId = Uuid;

/// Where a ticket is in its lane's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    Waiting,
    Running,
}

#[derive(Debug)]
struct Ticket {
    slot: u64,
    id: TicketId,
    state: TicketState,
}

struct Lane {
    tickets: VecDeque<Ticket>,
    departures: watch::Sender<u64>,
}

impl Lane {
    fn new() -> Self {
        let (departures, _) = watch::channel(0);
        Self {
            tickets: VecDeque::new(),
            departures,
        }
    }
}

type Lanes = Arc<Mutex<HashMap<String, Lane>>>;

fn lock(lanes: &Lanes) -> MutexGuard<'_, HashMap<String, Lane>> {
    // Critical sections never panic midway, so a poisoned map is still consistent
    lanes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-key FIFO executor.
#[derive(Clone, Default)]
pub struct SerializedQueue {
    lanes: Lanes,
    next_slot: Arc<AtomicU64>,
}

impl SerializedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `task` under `key`.
    ///
    /// The ticket is taken immediately, so call order fixes execution order
    /// even if the returned handles are awaited later or in another order.
    /// The handle resolves to whatever the task returns; a task `Err` is
    /// passed through untouched.
    pub fn enqueue<F, Fut, T>(&self, key: &str, task: F) -> impl Future<Output = T> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue_with_ticket(key, Uuid::new_v4(), task)
    }

    /// Like [`enqueue`](Self::enqueue), with a caller-chosen ticket id.
    pub fn enqueue_with_ticket<F, Fut, T>(
        &self,
        key: &str,
        ticket: TicketId,
        task: F,
    ) -> impl Future<Output = T> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let mut departures = {
            let mut lanes = lock(&self.lanes);
            let lane = lanes.entry(key.to_string()).or_insert_with(Lane::new);
            lane.tickets.push_back(Ticket {
                slot,
                id: ticket,
                state: TicketState::Waiting,
            });
            lane.departures.subscribe()
        };

        let guard = TicketGuard {
            lanes: self.lanes.clone(),
            key: key.to_string(),
            slot,
            ticket,
        };

        async move {
            let guard = guard;
            while !guard.try_activate() {
                if departures.changed().await.is_err() {
                    // Lane is gone, so nothing is ahead of us
                    break;
                }
            }
            tracing::trace!("Queue {}: running ticket {}", guard.key, guard.ticket);
            task().await
        }
    }

    /// True while `ticket` is waiting or running under `key`.
    pub fn is_queued(&self, key: &str, ticket: &TicketId) -> bool {
        self.state(key, ticket).is_some()
    }

    pub fn state(&self, key: &str, ticket: &TicketId) -> Option<TicketState> {
        let lanes = lock(&self.lanes);
        lanes
            .get(key)?
            .tickets
            .iter()
            .find(|t| &t.id == ticket)
            .map(|t| t.state)
    }

    /// Number of tickets (waiting or running) under `key`.
    pub fn len(&self, key: &str) -> usize {
        lock(&self.lanes).get(key).map_or(0, |lane| lane.tickets.len())
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }
}

/// Owns a ticket's place in its lane; releasing it lets the next ticket run.
struct TicketGuard {
    lanes: Lanes,
    key: String,
    slot: u64,
    ticket: TicketId,
}

impl TicketGuard {
    fn try_activate(&self) -> bool {
        let mut lanes = lock(&self.lanes);
        let Some(lane) = lanes.get_mut(&self.key) else {
            return true;
        };
        match lane.tickets.front_mut() {
            Some(head) if head.slot == self.slot => {
                if head.state == TicketState::Waiting {
                    head.state = TicketState::Running;
                }
                true
            }
            Some(_) => !lane.tickets.iter().any(|t| t.slot == self.slot),
            None => true,
        }
    }
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        let mut lanes = lock(&self.lanes);
        let Some(lane) = lanes.get_mut(&self.key) else {
            return;
        };
        if let Some(position) = lane.tickets.iter().position(|t| t.slot == self.slot) {
            lane.tickets.remove(position);
            lane.departures.send_modify(|count| *count = count.wrapping_add(1));
        }
        if lane.tickets.is_empty() {
            lanes.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_fifo_with_varying_durations() {
        let queue = SerializedQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..5u64)
            .map(|i| {
                let order = order.clone();
                queue.enqueue("source-a", move || async move {
                    sleep(Duration::from_millis(50 - i * 10)).await;
                    order.lock().unwrap().push(i);
                    i
                })
            })
            .collect();

        // Await in reverse to show that enqueue order, not await order, decides
        let mut tasks = Vec::new();
        for handle in handles.into_iter().rev() {
            tasks.push(tokio::spawn(handle));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.len("source-a"), 0);
    }

    #[tokio::test]
    async fn test_at_most_one_running_per_key() {
        let queue = SerializedQueue::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(queue.enqueue("k", move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }))
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let queue = SerializedQueue::new();
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

        let slow_tx = done_tx.clone();
        let slow = tokio::spawn(queue.enqueue("slow", move || async move {
            sleep(Duration::from_millis(200)).await;
            slow_tx.send("slow").unwrap();
        }));
        let fast = tokio::spawn(queue.enqueue("fast", move || async move {
            done_tx.send("fast").unwrap();
        }));

        fast.await.unwrap();
        slow.await.unwrap();

        assert_eq!(done_rx.recv().await, Some("fast"));
        assert_eq!(done_rx.recv().await, Some("slow"));
    }

    #[tokio::test]
    async fn test_errors_propagate_and_release_lane() {
        let queue = SerializedQueue::new();

        let failing = queue.enqueue("k", || async { Err::<u32, String>("boom".to_string()) });
        let next = queue.enqueue("k", || async { Ok::<u32, String>(7) });

        assert_eq!(failing.await, Err("boom".to_string()));
        assert_eq!(next.await, Ok(7));
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_ticket() {
        let queue = SerializedQueue::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = tokio::spawn(queue.enqueue("k", move || async move {
            release_rx.await.ok();
            1
        }));
        let abandoned = queue.enqueue("k", || async { 2 });
        let third = tokio::spawn(queue.enqueue("k", || async { 3 }));

        assert_eq!(queue.len("k"), 3);
        drop(abandoned);
        assert_eq!(queue.len("k"), 2);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(third.await.unwrap(), 3);
        assert!(queue.is_empty("k"));
    }

    #[tokio::test]
    async fn test_duplicate_ticket_ids_still_serialize() {
        let queue = SerializedQueue::new();
        let ticket = Uuid::new_v4();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..2)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(queue.enqueue_with_ticket("k", ticket, move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    i
                }))
            })
            .collect();

        assert_eq!(queue.len("k"), 2);
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(results, vec![0, 1]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty("k"));
    }

    #[tokio::test]
    async fn test_ticket_introspection() {
        let queue = SerializedQueue::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let first_ticket = Uuid::new_v4();
        let second_ticket = Uuid::new_v4();

        let first = tokio::spawn(queue.enqueue_with_ticket("k", first_ticket, move || async move {
            started_tx.send(()).ok();
            release_rx.await.ok();
        }));
        let second = queue.enqueue_with_ticket("k", second_ticket, || async {});

        started_rx.await.unwrap();
        assert_eq!(queue.state("k", &first_ticket), Some(TicketState::Running));
        assert_eq!(queue.state("k", &second_ticket), Some(TicketState::Waiting));
        assert!(queue.is_queued("k", &second_ticket));
        assert!(!queue.is_queued("other", &second_ticket));

        release_tx.send(()).unwrap();
        first.await.unwrap();
        second.await;
        assert!(!queue.is_queued("k", &first_ticket));
        assert!(!queue.is_queued("k", &second_ticket));
    }
}
