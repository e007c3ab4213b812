use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use rocket::serde::json::Value;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BoardEventKind {
    #[serde(rename = "item.created")]
    ItemCreated,
    #[serde(rename = "item.deleted")]
    ItemDeleted,
    #[serde(rename = "channel.created")]
    ChannelCreated,
    #[serde(rename = "board.updated")]
    BoardUpdated,
}

impl BoardEventKind {
    /// Name used for the SSE `event:` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            BoardEventKind::ItemCreated => "item.created",
            BoardEventKind::ItemDeleted => "item.deleted",
            BoardEventKind::ChannelCreated => "channel.created",
            BoardEventKind::BoardUpdated => "board.updated",
        }
    }
}

#[derive(Clone, Debug)]
pub struct BoardEvent {
    pub board_id: String,
    pub kind: BoardEventKind,
    pub payload: Value,
}

pub type Handler = Arc<dyn Fn(&BoardEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_seq: u64,
    boards: HashMap<String, BTreeMap<u64, Handler>>,
}

/// Per-board fan-out of change notifications to live push connections.
///
/// Delivery is synchronous, best-effort and at-most-once: events are a hint
/// to refetch, never the source of truth.
#[derive(Clone, Default)]
pub struct Broadcaster {
    registry: Arc<Mutex<Registry>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, board_id: &str, kind: BoardEventKind, payload: Value) {
        self.publish(BoardEvent {
            board_id: board_id.to_string(),
            kind,
            payload,
        });
    }

    pub fn publish(&self, event: BoardEvent) {
        // Snapshot under the lock, deliver outside it so a handler may
        // subscribe or unsubscribe without deadlocking.
        let handlers: Vec<Handler> = match lock(&self.registry).boards.get(&event.board_id) {
            Some(set) => set.values().cloned().collect(),
            None => return,
        };

        for handler in handlers {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if delivered.is_err() {
                tracing::warn!(
                    board_id = %event.board_id,
                    event = event.kind.as_str(),
                    "board event handler panicked"
                );
            }
        }
    }

    pub fn subscribe<F>(&self, board_id: &str, handler: F) -> Subscription
    where
        F: Fn(&BoardEvent) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let seq = registry.next_seq;
        registry.next_seq += 1;
        registry
            .boards
            .entry(board_id.to_string())
            .or_default()
            .insert(seq, Arc::new(handler));

        Subscription {
            board_id: board_id.to_string(),
            seq,
            registry: Arc::downgrade(&self.registry),
            active: AtomicBool::new(true),
        }
    }

    /// Subscription whose events arrive on an unbounded channel, for the SSE
    /// stream. A closed receiver just makes delivery a silent no-op.
    pub fn subscribe_channel(
        &self,
        board_id: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<BoardEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(board_id, move |event| {
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    pub fn subscriber_count(&self, board_id: &str) -> usize {
        lock(&self.registry)
            .boards
            .get(board_id)
            .map_or(0, BTreeMap::len)
    }

    /// Boards with at least one live subscriber.
    pub fn board_count(&self) -> usize {
        lock(&self.registry).boards.len()
    }
}

/// Handle for one registered handler. Unsubscribes on drop.
pub struct Subscription {
    board_id: String,
    seq: u64,
    registry: Weak<Mutex<Registry>>,
    active: AtomicBool,
}

impl Subscription {
    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    /// Removes the handler. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = lock(&registry);
        if let Some(set) = registry.boards.get_mut(&self.board_id) {
            set.remove(&self.seq);
            if set.is_empty() {
                registry.boards.remove(&self.board_id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// A panicking handler runs outside the lock, so poisoning can only come from
// a bug in this module; the map itself stays consistent either way.
fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::serde::json::json;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &str) -> impl Fn(&BoardEvent) + Send + Sync {
        let log = Arc::clone(log);
        let name = name.to_string();
        move |event: &BoardEvent| {
            log.lock()
                .unwrap()
                .push(format!("{}:{}", name, event.kind.as_str()));
        }
    }

    #[test]
    fn fans_out_only_to_the_published_board_in_subscription_order() {
        let bus = Broadcaster::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = bus.subscribe("B1", recorder(&log, "a"));
        let _b = bus.subscribe("B1", recorder(&log, "b"));
        let _other = bus.subscribe("B2", recorder(&log, "other"));
        let _c = bus.subscribe("B1", recorder(&log, "c"));

        bus.emit("B1", BoardEventKind::ItemCreated, json!({"id": "item_1"}));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:item.created", "b:item.created", "c:item.created"]
        );
    }

    #[test]
    fn preserves_publish_order_per_handler() {
        let bus = Broadcaster::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _sub = bus.subscribe("B1", recorder(&log, "a"));

        bus.emit("B1", BoardEventKind::ChannelCreated, json!({}));
        bus.emit("B1", BoardEventKind::ItemDeleted, json!({}));
        bus.emit("B1", BoardEventKind::BoardUpdated, json!({}));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:channel.created", "a:item.deleted", "a:board.updated"]
        );
    }

    #[test]
    fn unsubscribe_is_idempotent_and_evicts_empty_boards() {
        let bus = Broadcaster::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let keep = bus.subscribe("B1", recorder(&log, "keep"));
        let gone = bus.subscribe("B1", recorder(&log, "gone"));

        gone.unsubscribe();
        gone.unsubscribe();
        assert_eq!(bus.subscriber_count("B1"), 1);

        bus.emit("B1", BoardEventKind::ItemCreated, json!({}));
        assert_eq!(*log.lock().unwrap(), vec!["keep:item.created"]);

        drop(keep);
        assert_eq!(bus.subscriber_count("B1"), 0);
        assert_eq!(bus.board_count(), 0);

        // Dropping an already-unsubscribed handle must not disturb a new one.
        let _fresh = bus.subscribe("B1", recorder(&log, "fresh"));
        drop(gone);
        assert_eq!(bus.subscriber_count("B1"), 1);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = Broadcaster::new();
        bus.emit("unknown-board", BoardEventKind::ItemCreated, json!({}));
        assert_eq!(bus.board_count(), 0);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let bus = Broadcaster::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _bad = bus.subscribe("B1", |_: &BoardEvent| panic!("subscriber blew up"));
        let _good = bus.subscribe("B1", recorder(&log, "good"));

        bus.emit("B1", BoardEventKind::ItemCreated, json!({}));
        bus.emit("B1", BoardEventKind::ItemCreated, json!({}));

        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(bus.subscriber_count("B1"), 2);
    }

    #[test]
    fn handler_may_unsubscribe_itself_during_delivery() {
        let bus = Broadcaster::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let sub = bus.subscribe("B1", move |_: &BoardEvent| {
            if let Some(sub) = inner.lock().unwrap().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        bus.emit("B1", BoardEventKind::ItemCreated, json!({}));
        assert_eq!(bus.subscriber_count("B1"), 0);
    }

    #[test]
    fn channel_subscription_relays_events() {
        let bus = Broadcaster::new();
        let (sub, mut rx) = bus.subscribe_channel("B1");
        assert_eq!(sub.board_id(), "B1");

        bus.emit("B1", BoardEventKind::ItemDeleted, json!({"id": "item_9"}));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, BoardEventKind::ItemDeleted);
        assert_eq!(event.payload["id"], "item_9");

        drop(sub);
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.board_count(), 0);
    }

    #[test]
    fn subscription_outliving_broadcaster_is_harmless() {
        let bus = Broadcaster::new();
        let sub = bus.subscribe("B1", |_: &BoardEvent| {});
        drop(bus);
        sub.unsubscribe();
    }
}
