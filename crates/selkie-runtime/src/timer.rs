//! Per-worker timer wheel.
//!
//! TigerStyle: Explicit deadlines, FIFO among ties, safe cancellation.
//!
//! A min-heap over monotonic milliseconds. Repeated entries carry an
//! (interval, remaining-fires) pair; single-shot wake entries resume a
//! suspended task instead of invoking a callback. Timers with the same
//! deadline fire in creation order, and cancelling a timer from inside its
//! own fire is allowed.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use tokio::sync::oneshot;

enum TimerKind {
    /// Fire the owning service's timer callback
    Callback,
    /// Resume a suspended task (`sleep`)
    Wake(oneshot::Sender<()>),
}

struct Entry {
    fire_at: u64,
    seq: u64,
    id: u32,
    owner: u32,
    interval_ms: u64,
    /// Fires left; negative means forever
    remaining: i32,
    kind: TimerKind,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the std max-heap pops the earliest (fire_at, seq) first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then(other.seq.cmp(&self.seq))
    }
}

/// A callback expiration produced by `fire_due`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueTimer {
    pub id: u32,
    pub owner: u32,
    pub is_last: bool,
}

/// Min-heap timer wheel owned by one worker
#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Entry>,
    next_id: u32,
    next_seq: u64,
    live: HashSet<u32>,
    cancelled: HashSet<u32>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.live.contains(&self.next_id) {
                self.live.insert(self.next_id);
                return self.next_id;
            }
        }
    }

    fn push(&mut self, mut entry: Entry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(entry);
    }

    /// Schedule a repeated timer for `owner`.
    ///
    /// `times <= 0` means fire forever.
    pub fn repeated(&mut self, interval_ms: u64, times: i32, owner: u32, now: u64) -> u32 {
        let interval_ms = interval_ms.max(1);
        let id = self.alloc_id();
        self.push(Entry {
            fire_at: now + interval_ms,
            seq: 0,
            id,
            owner,
            interval_ms,
            remaining: if times <= 0 { -1 } else { times },
            kind: TimerKind::Callback,
        });
        id
    }

    /// Schedule a single-shot wake resuming `tx` after `delay_ms`
    pub fn wake_after(&mut self, delay_ms: u64, owner: u32, tx: oneshot::Sender<()>, now: u64) -> u32 {
        let id = self.alloc_id();
        self.push(Entry {
            fire_at: now + delay_ms,
            seq: 0,
            id,
            owner,
            interval_ms: 0,
            remaining: 1,
            kind: TimerKind::Wake(tx),
        });
        id
    }

    /// Cancel a timer by id; unknown ids are ignored
    pub fn remove(&mut self, id: u32) {
        if self.live.contains(&id) {
            self.cancelled.insert(id);
        }
    }

    /// Cancel every timer owned by a departing service
    pub fn remove_owned(&mut self, owner: u32) {
        let ids: Vec<u32> = self
            .heap
            .iter()
            .filter(|e| e.owner == owner)
            .map(|e| e.id)
            .collect();
        for id in ids {
            self.remove(id);
        }
    }

    /// Earliest pending deadline in monotonic ms
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.fire_at)
    }

    pub fn len(&self) -> usize {
        self.live.len() - self.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drop_entry(&mut self, id: u32) {
        self.live.remove(&id);
        self.cancelled.remove(&id);
    }

    /// Pop everything due at `now`: wake entries resume their tasks here,
    /// callback expirations are returned for the worker to dispatch.
    pub fn fire_due(&mut self, now: u64) -> Vec<DueTimer> {
        let mut due = Vec::new();
        while let Some(head) = self.heap.peek() {
            if head.fire_at > now {
                break;
            }
            let mut entry = self.heap.pop().expect("peeked entry");

            if self.cancelled.contains(&entry.id) {
                self.drop_entry(entry.id);
                continue;
            }

            match entry.kind {
                TimerKind::Wake(tx) => {
                    self.drop_entry(entry.id);
                    let _ = tx.send(());
                }
                TimerKind::Callback => {
                    let is_last = entry.remaining == 1;
                    due.push(DueTimer {
                        id: entry.id,
                        owner: entry.owner,
                        is_last,
                    });
                    if is_last {
                        self.drop_entry(entry.id);
                    } else {
                        if entry.remaining > 0 {
                            entry.remaining -= 1;
                        }
                        entry.fire_at = now + entry.interval_ms;
                        self.push(entry);
                    }
                }
            }
        }
        due
    }
}
