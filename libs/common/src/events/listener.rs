use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use alloy_primitives::B256;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::abi::ContractAbi;
use super::handler::{EventError, EventHandler};
use super::log::LogEvent;

/// Subscribe/publish surface shared by the listener and its consumers.
#[async_trait::async_trait]
pub trait EventManager: Send + Sync {
    /// Registers handlers, resolving each by event name against the known
    /// contracts. Fails without registering anything if a name is unknown.
    fn subscribe(&self, handlers: Vec<Arc<dyn EventHandler>>) -> Result<Subscription, EventError>;

    /// Delivers a log to every handler bound to its topic0 and waits for
    /// all of them to finish.
    async fn publish_log_event(&self, log: LogEvent);
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    contract: String,
    handler: Arc<dyn EventHandler>,
    errors: mpsc::Sender<EventError>,
}

type SubscriberTable = HashMap<B256, Vec<Subscriber>>;

/// Fans decoded contract logs out to subscribed handlers.
pub struct Listener {
    contracts: Vec<ContractAbi>,
    subscribers: Arc<RwLock<SubscriberTable>>,
    next_id: AtomicU64,
}

impl Listener {
    pub fn new(contracts: Vec<ContractAbi>) -> Self {
        Self {
            contracts,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscriber_count(&self, topic: &B256) -> usize {
        self.subscribers.read().get(topic).map_or(0, Vec::len)
    }

    fn resolve(&self, name: &str) -> Option<(B256, &str)> {
        self.contracts
            .iter()
            .find_map(|c| c.event(name).map(|e| (e.topic, c.name())))
    }
}

#[async_trait::async_trait]
impl EventManager for Listener {
    fn subscribe(&self, handlers: Vec<Arc<dyn EventHandler>>) -> Result<Subscription, EventError> {
        if handlers.is_empty() {
            return Err(EventError::NoHandlers);
        }

        let mut bound = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let (topic, contract) = self
                .resolve(handler.event_name())
                .ok_or_else(|| EventError::EventNotFound(handler.event_name().to_string()))?;
            bound.push((topic, contract.to_string(), handler));
        }

        let (errors_tx, errors_rx) = mpsc::channel(bound.len());
        let mut keys = Vec::with_capacity(bound.len());

        let mut table = self.subscribers.write();
        for (topic, contract, handler) in bound {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                event = handler.event_name(),
                contract = %contract,
                %topic,
                id,
                "Subscribed handler"
            );
            table.entry(topic).or_default().push(Subscriber {
                id,
                contract,
                handler,
                errors: errors_tx.clone(),
            });
            keys.push((topic, id));
        }

        Ok(Subscription {
            keys,
            table: Arc::downgrade(&self.subscribers),
            errors: errors_rx,
        })
    }

    async fn publish_log_event(&self, log: LogEvent) {
        let Some(topic) = log.topic0().copied() else {
            tracing::warn!(address = %log.address, block = log.block_number, "Dropping log without topics");
            return;
        };

        // Snapshot under the read lock so handlers run without it held.
        let subscribers = {
            let table = self.subscribers.read();
            table.get(&topic).cloned()
        };
        let Some(subscribers) = subscribers else {
            return;
        };

        let log = Arc::new(log);
        let mut tasks = JoinSet::new();
        for subscriber in subscribers {
            let log = Arc::clone(&log);
            tasks.spawn(async move {
                if let Err(err) = subscriber.handler.handle(&log).await {
                    tracing::error!(
                        event = subscriber.handler.event_name(),
                        contract = %subscriber.contract,
                        block = log.block_number,
                        tx_hash = %log.tx_hash,
                        error = %err,
                        "Event handler failed"
                    );
                    if subscriber.errors.try_send(err).is_err() {
                        tracing::warn!(
                            id = subscriber.id,
                            "Subscriber error channel full or closed, dropping error"
                        );
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Event handler task panicked");
            }
        }
    }
}

/// Handle to a set of registered handlers. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    keys: Vec<(B256, u64)>,
    table: Weak<RwLock<SubscriberTable>>,
    errors: mpsc::Receiver<EventError>,
}

impl Subscription {
    /// Next handler error. Returns `None` once unsubscribed and drained.
    pub async fn err(&mut self) -> Option<EventError> {
        self.errors.recv().await
    }

    pub fn try_err(&mut self) -> Option<EventError> {
        self.errors.try_recv().ok()
    }

    pub fn unsubscribe(&mut self) {
        if let Some(table) = self.table.upgrade() {
            let mut table = table.write();
            for (topic, id) in self.keys.drain(..) {
                if let Some(list) = table.get_mut(&topic) {
                    list.retain(|s| s.id != id);
                    if list.is_empty() {
                        table.remove(&topic);
                    }
                }
            }
        }
        self.keys.clear();
        self.errors.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::handler::typed;
    use alloy_primitives::{Address, U256};
    use alloy_sol_types::{sol, SolEvent};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    sol! {
        #[derive(Debug)]
        event Tick(uint256 indexed n);
        #[derive(Debug)]
        event Tock(uint256 n);
    }

    fn listener() -> Listener {
        Listener::new(vec![ContractAbi::new("Clock")
            .with_event::<Tick>()
            .with_event::<Tock>()])
    }

    fn tick(n: u64) -> LogEvent {
        LogEvent::from_event(Address::ZERO, &Tick { n: U256::from(n) }, n)
    }

    struct Failing;

    #[async_trait::async_trait]
    impl EventHandler for Failing {
        fn event_name(&self) -> &str {
            "Tick"
        }

        async fn handle(&self, _log: &LogEvent) -> Result<(), EventError> {
            Err(EventError::Handler {
                event: "Tick".into(),
                reason: "boom".into(),
            })
        }
    }

    struct Named(&'static str);

    #[async_trait::async_trait]
    impl EventHandler for Named {
        fn event_name(&self) -> &str {
            self.0
        }

        async fn handle(&self, _log: &LogEvent) -> Result<(), EventError> {
            Ok(())
        }
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn EventHandler>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handler = typed::<Tick, _, _>(move |_, _| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        (count, handler)
    }

    #[test]
    fn test_subscribe_unknown_event_registers_nothing() {
        let listener = listener();
        let (_, handler) = counter();
        let err = listener
            .subscribe(vec![handler, Arc::new(Named("Missing"))])
            .unwrap_err();

        assert_eq!(err, EventError::EventNotFound("Missing".into()));
        assert_eq!(listener.subscriber_count(&Tick::SIGNATURE_HASH), 0);
    }

    #[test]
    fn test_subscribe_requires_handlers() {
        assert_eq!(
            listener().subscribe(vec![]).unwrap_err(),
            EventError::NoHandlers
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_once() {
        let listener = listener();
        let (a, ha) = counter();
        let (b, hb) = counter();
        let _sa = listener.subscribe(vec![ha]).unwrap();
        let _sb = listener.subscribe(vec![hb]).unwrap();

        listener.publish_log_event(tick(1)).await;

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_affect_siblings() {
        let listener = listener();
        let (count, ok) = counter();
        let mut failing = listener.subscribe(vec![Arc::new(Failing)]).unwrap();
        let _ok = listener.subscribe(vec![ok]).unwrap();

        listener.publish_log_event(tick(1)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(failing.try_err(), Some(EventError::Handler { .. })));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery_and_closes_errors() {
        let listener = listener();
        let (count, handler) = counter();
        let mut sub = listener.subscribe(vec![handler]).unwrap();

        sub.unsubscribe();
        listener.publish_log_event(tick(1)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(listener.subscriber_count(&Tick::SIGNATURE_HASH), 0);
        assert!(sub.err().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let listener = listener();
        let (_, handler) = counter();
        {
            let _sub = listener.subscribe(vec![handler]).unwrap();
            assert_eq!(listener.subscriber_count(&Tick::SIGNATURE_HASH), 1);
        }
        assert_eq!(listener.subscriber_count(&Tick::SIGNATURE_HASH), 0);
    }

    #[tokio::test]
    async fn test_publish_waits_for_slow_handlers() {
        let listener = listener();
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let handler = typed::<Tick, _, _>(move |_, _| {
            let d = Arc::clone(&d);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                d.fetch_add(1, Ordering::SeqCst);
            }
        });
        let _sub = listener.subscribe(vec![handler]).unwrap();

        listener.publish_log_event(tick(3)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unrelated_topic_is_ignored() {
        let listener = listener();
        let (count, handler) = counter();
        let _sub = listener.subscribe(vec![handler]).unwrap();

        let tock = LogEvent::from_event(Address::ZERO, &Tock { n: U256::from(1u64) }, 1);
        listener.publish_log_event(tock).await;
        listener.publish_log_event(LogEvent::default()).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
