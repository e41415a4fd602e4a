//! Session bookkeeping for request/response correlation.
//!
//! TigerStyle: Explicit session lifetimes, at-most-once resume.
//!
//! Each service maps live session ids to the waker of the task suspended
//! on that call. A cancelled session leaves a sentinel behind so a late
//! reply is dropped without resuming anything. A parallel watcher map
//! remembers which service each session is waiting on, so pending calls
//! can be failed when their target exits.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;

use selkie_core::constants::SESSION_ID_MAX;
use selkie_core::{Buffer, Message, PType};

enum Slot {
    Waiting(oneshot::Sender<Message>),
    Cancelled,
}

/// What happened to an incoming sessioned message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// A waiting task was resumed
    Delivered,
    /// The session was cancelled; the reply was dropped
    DroppedCancelled,
    /// No such session; a protocol error on the sender's side
    UnknownSession,
}

/// Per-service session table
#[derive(Default)]
pub struct SessionMap {
    next: Cell<i32>,
    slots: RefCell<HashMap<i32, Slot>>,
    watch: RefCell<HashMap<i32, u32>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh positive session id.
    ///
    /// Monotonic with wraparound at `SESSION_ID_MAX`, never zero, never
    /// colliding with a live or cancelled entry.
    pub fn next_session(&self) -> i32 {
        let slots = self.slots.borrow();
        let mut id = self.next.get();
        loop {
            id = if id >= SESSION_ID_MAX { 1 } else { id + 1 };
            if !slots.contains_key(&id) {
                break;
            }
        }
        self.next.set(id);
        id
    }

    /// Park a waker under `session`, watching `receiver` for exit
    pub fn register(&self, session: i32, receiver: u32, tx: oneshot::Sender<Message>) {
        debug_assert!(session > 0, "session ids are positive");
        let prev = self.slots.borrow_mut().insert(session, Slot::Waiting(tx));
        debug_assert!(prev.is_none(), "session id collision");
        self.watch.borrow_mut().insert(session, receiver);
    }

    /// Make a session inert; a late reply will be dropped. Idempotent.
    pub fn cancel(&self, session: i32) {
        self.slots.borrow_mut().insert(session, Slot::Cancelled);
        self.watch.borrow_mut().remove(&session);
    }

    /// Forget a session entirely; used when the request was never sent
    pub fn discard(&self, session: i32) {
        self.slots.borrow_mut().remove(&session);
        self.watch.borrow_mut().remove(&session);
    }

    /// Route an incoming message with `session > 0` to its waiting task
    pub fn resume(&self, msg: Message) -> Resume {
        debug_assert!(msg.session > 0);
        let slot = self.slots.borrow_mut().remove(&msg.session);
        self.watch.borrow_mut().remove(&msg.session);
        match slot {
            Some(Slot::Waiting(tx)) => {
                let _ = tx.send(msg);
                Resume::Delivered
            }
            Some(Slot::Cancelled) => Resume::DroppedCancelled,
            None => Resume::UnknownSession,
        }
    }

    /// Fail every pending session whose watched receiver just exited
    pub fn fail_watching(&self, dead: u32) {
        let sessions: Vec<i32> = self
            .watch
            .borrow()
            .iter()
            .filter(|(_, receiver)| **receiver == dead)
            .map(|(session, _)| *session)
            .collect();
        for session in sessions {
            self.watch.borrow_mut().remove(&session);
            if let Some(Slot::Waiting(tx)) = self.slots.borrow_mut().remove(&session) {
                let reply = Message {
                    sender: dead,
                    receiver: 0,
                    session,
                    ptype: PType::Error,
                    subtype: 0,
                    header: "exit".into(),
                    data: Arc::new(Buffer::from("target exited")),
                };
                let _ = tx.send(reply);
            }
        }
    }

    /// Number of live (non-cancelled) sessions
    pub fn live_count(&self) -> usize {
        self.slots
            .borrow()
            .values()
            .filter(|s| matches!(s, Slot::Waiting(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(session: i32) -> Message {
        Message::new(2, 1, session, PType::Lua, "", Arc::new(Buffer::from("ok")))
    }

    #[test]
    fn test_session_ids_unique_and_positive() {
        let map = SessionMap::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = map.next_session();
            assert!(id > 0);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_wraparound_skips_live_entries() {
        let map = SessionMap::new();
        map.next.set(SESSION_ID_MAX - 1);

        let (tx, _rx) = oneshot::channel();
        map.register(1, 9, tx); // occupy the post-wrap slot

        let a = map.next_session();
        assert_eq!(a, SESSION_ID_MAX);
        let b = map.next_session();
        assert_eq!(b, 2); // wrapped past 1, which is live
    }

    #[test]
    fn test_resume_delivers_exactly_once() {
        let map = SessionMap::new();
        let (tx, mut rx) = oneshot::channel();
        map.register(5, 9, tx);

        assert_eq!(map.resume(reply(5)), Resume::Delivered);
        assert!(rx.try_recv().is_ok());
        // A second reply with the same session is a protocol error
        assert_eq!(map.resume(reply(5)), Resume::UnknownSession);
    }

    #[test]
    fn test_cancel_is_idempotent_and_drops_late_reply() {
        let map = SessionMap::new();
        let (tx, mut rx) = oneshot::channel();
        map.register(5, 9, tx);

        map.cancel(5);
        map.cancel(5); // no-op after the first

        assert_eq!(map.resume(reply(5)), Resume::DroppedCancelled);
        assert!(rx.try_recv().is_err());
        assert_eq!(map.live_count(), 0);
    }

    #[test]
    fn test_fail_watching_resumes_with_exit_error() {
        let map = SessionMap::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        map.register(1, 100, tx1);
        map.register(2, 200, tx2);

        map.fail_watching(100);

        let failed = rx1.try_recv().unwrap();
        assert_eq!(failed.ptype, PType::Error);
        assert_eq!(failed.header, "exit");
        // The other call is untouched
        assert!(rx2.try_recv().is_err());
        assert_eq!(map.live_count(), 1);
    }
}
