//! Typed publish/subscribe bus.
//!
//! Any thread may [`post`](MessageBus::post) a message; every [`Mailbox`]
//! registered on the bus at that moment receives its own copy, which it picks
//! up on the next [`poll`](Mailbox::poll).
//!
//! ## Locking
//!
//! ```text
//!   MessageBus<M>
//!   ┌───────────────────────────────────────────────┐
//!   │ mailboxes: Mutex<Vec<Arc<Queue<M>>>>          │  registry lock
//!   └───────────────┬───────────────┬───────────────┘
//!                   ▼               ▼
//!            Queue { Mutex<Vec<M>> }  Queue { ... }   per-mailbox lock
//! ```
//!
//! `post`, mailbox registration and deregistration take the registry lock;
//! delivery then takes each queue lock while still holding it. `poll` takes
//! only its own queue lock. The two tiers are always acquired registry first,
//! so posting and polling never deadlock.
//!
//! ## Guarantees
//!
//! - A message posted before a poll is delivered exactly once per mailbox.
//! - Messages are FIFO within one mailbox; nothing is promised across mailboxes.
//! - Messages posted before a mailbox registers are not delivered to it.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

/// Identifies a mailbox to [`BusMessage::should_deliver`].
pub type MailboxId = u32;

/// A message type that can travel on a [`MessageBus`].
pub trait BusMessage: Clone + Send + 'static {
    /// Whether this message should be queued for the mailbox `mailbox_id`.
    /// Delivers to every mailbox unless overridden.
    fn should_deliver(&self, mailbox_id: MailboxId) -> bool {
        let _ = mailbox_id;
        true
    }
}

struct Queue<M> {
    id: MailboxId,
    pending: Mutex<Vec<M>>,
}

/// Broadcasts messages of type `M` to every registered [`Mailbox`].
pub struct MessageBus<M: BusMessage> {
    mailboxes: Mutex<Vec<Arc<Queue<M>>>>,
    next_id: AtomicU32,
}

type BusRegistry = Mutex<FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

static GLOBAL_BUSES: OnceLock<BusRegistry> = OnceLock::new();

impl<M: BusMessage> MessageBus<M> {
    pub fn new() -> Self {
        Self {
            mailboxes: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// The process-wide bus for `M`, created on first use.
    pub fn global() -> Arc<Self> {
        let registry = GLOBAL_BUSES.get_or_init(|| Mutex::new(FxHashMap::default()));
        let bus = Arc::clone(
            registry
                .lock()
                .entry(TypeId::of::<M>())
                .or_insert_with(|| Arc::new(MessageBus::<M>::new()) as Arc<dyn Any + Send + Sync>),
        );
        match bus.downcast::<MessageBus<M>>() {
            Ok(bus) => bus,
            Err(_) => unreachable!("bus registry entries are keyed by their message type"),
        }
    }

    /// Registers a new mailbox with a bus-assigned id.
    pub fn mailbox(self: &Arc<Self>) -> Mailbox<M> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.mailbox_with_id(id)
    }

    /// Registers a new mailbox with a caller-chosen id.
    pub fn mailbox_with_id(self: &Arc<Self>, id: MailboxId) -> Mailbox<M> {
        let queue = Arc::new(Queue {
            id,
            pending: Mutex::new(Vec::new()),
        });
        self.mailboxes.lock().push(Arc::clone(&queue));
        Mailbox {
            bus: Arc::clone(self),
            queue,
        }
    }

    /// Queues a copy of `message` in every mailbox that accepts it and
    /// returns how many mailboxes received it.
    pub fn post(&self, message: M) -> usize {
        let mailboxes = self.mailboxes.lock();
        let mut delivered = 0;
        for queue in mailboxes.iter() {
            if message.should_deliver(queue.id) {
                queue.pending.lock().push(message.clone());
                delivered += 1;
            }
        }
        trace!(delivered, "bus message posted");
        delivered
    }

    /// Number of mailboxes currently registered.
    pub fn mailbox_count(&self) -> usize {
        self.mailboxes.lock().len()
    }

    fn unregister(&self, queue: &Arc<Queue<M>>) {
        self.mailboxes.lock().retain(|q| !Arc::ptr_eq(q, queue));
    }
}

impl<M: BusMessage> Default for MessageBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: BusMessage> fmt::Debug for MessageBus<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("message", &std::any::type_name::<M>())
            .field("mailboxes", &self.mailbox_count())
            .finish()
    }
}

/// Receiving end of a [`MessageBus`]. Deregisters itself on drop.
pub struct Mailbox<M: BusMessage> {
    bus: Arc<MessageBus<M>>,
    queue: Arc<Queue<M>>,
}

impl<M: BusMessage> Mailbox<M> {
    pub fn id(&self) -> MailboxId {
        self.queue.id
    }

    pub fn bus(&self) -> &Arc<MessageBus<M>> {
        &self.bus
    }

    /// Moves every pending message into `out` (cleared first), oldest first,
    /// leaving the mailbox empty.
    pub fn poll(&self, out: &mut Vec<M>) {
        out.clear();
        let mut pending = self.queue.pending.lock();
        std::mem::swap(&mut *pending, out);
    }

    /// Convenience form of [`poll`](Self::poll) returning a fresh vector.
    pub fn drain(&self) -> Vec<M> {
        std::mem::take(&mut *self.queue.pending.lock())
    }

    /// `true` when no message is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.pending.lock().is_empty()
    }
}

impl<M: BusMessage> Drop for Mailbox<M> {
    fn drop(&mut self) {
        self.bus.unregister(&self.queue);
    }
}

impl<M: BusMessage> fmt::Debug for Mailbox<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox").field("id", &self.queue.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Note(u32);

    impl BusMessage for Note {}

    #[derive(Clone, Debug, PartialEq)]
    struct Targeted {
        to: MailboxId,
    }

    impl BusMessage for Targeted {
        fn should_deliver(&self, mailbox_id: MailboxId) -> bool {
            self.to == mailbox_id
        }
    }

    #[test]
    fn every_mailbox_gets_a_copy() {
        let bus = Arc::new(MessageBus::<Note>::new());
        let a = bus.mailbox();
        let b = bus.mailbox();
        assert_ne!(a.id(), b.id());

        assert_eq!(bus.post(Note(1)), 2);
        assert_eq!(a.drain(), vec![Note(1)]);
        assert_eq!(b.drain(), vec![Note(1)]);
        assert!(a.drain().is_empty());
    }

    #[test]
    fn poll_is_fifo_and_empties_mailbox() {
        let bus = Arc::new(MessageBus::<Note>::new());
        let inbox = bus.mailbox();
        bus.post(Note(7));
        bus.post(Note(7));
        bus.post(Note(8));

        let mut out = vec![Note(99)];
        inbox.poll(&mut out);
        assert_eq!(out, vec![Note(7), Note(7), Note(8)]);
        assert!(inbox.is_empty());

        inbox.poll(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn messages_before_registration_are_not_delivered() {
        let bus = Arc::new(MessageBus::<Note>::new());
        assert_eq!(bus.post(Note(1)), 0);
        let late = bus.mailbox();
        assert!(late.is_empty());
    }

    #[test]
    fn dropped_mailbox_is_deregistered() {
        let bus = Arc::new(MessageBus::<Note>::new());
        let keep = bus.mailbox();
        {
            let _gone = bus.mailbox();
            assert_eq!(bus.mailbox_count(), 2);
        }
        assert_eq!(bus.mailbox_count(), 1);
        assert_eq!(bus.post(Note(3)), 1);
        assert_eq!(keep.drain(), vec![Note(3)]);
    }

    #[test]
    fn should_deliver_filters_by_mailbox_id() {
        let bus = Arc::new(MessageBus::<Targeted>::new());
        let ten = bus.mailbox_with_id(10);
        let eleven = bus.mailbox_with_id(11);

        assert_eq!(bus.post(Targeted { to: 11 }), 1);
        assert!(ten.is_empty());
        assert_eq!(eleven.drain(), vec![Targeted { to: 11 }]);
    }

    #[test]
    fn global_bus_is_shared_per_message_type() {
        #[derive(Clone)]
        struct OnlyHere;
        impl BusMessage for OnlyHere {}

        let a = MessageBus::<OnlyHere>::global();
        let b = MessageBus::<OnlyHere>::global();
        assert!(Arc::ptr_eq(&a, &b));

        let inbox = a.mailbox();
        assert_eq!(b.post(OnlyHere), 1);
        assert_eq!(inbox.drain().len(), 1);
    }
}
