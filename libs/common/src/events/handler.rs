use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use alloy_sol_types::SolEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::abi::event_name;
use super::log::LogEvent;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("event {0} not found in any known contract")]
    EventNotFound(String),

    #[error("no event handlers provided")]
    NoHandlers,

    #[error("log has no topics")]
    NoTopics,

    #[error("failed to decode {event}: {reason}")]
    Decode { event: String, reason: String },

    #[error("handler for {event} failed: {reason}")]
    Handler { event: String, reason: String },
}

/// Consumer of one named contract event.
///
/// The listener binds each handler to a topic when it subscribes, and only
/// calls `handle` with logs carrying that topic.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    fn event_name(&self) -> &str;

    async fn handle(&self, log: &LogEvent) -> Result<(), EventError>;
}

/// Decodes a log into `E`. Indexed fields are read from `topics[1..]`, the
/// rest from the data section.
pub fn decode<E: SolEvent>(log: &LogEvent) -> Result<E, EventError> {
    let name = event_name::<E>();
    let topic0 = log.topic0().ok_or(EventError::NoTopics)?;
    if *topic0 != E::SIGNATURE_HASH {
        return Err(EventError::Decode {
            event: name.to_string(),
            reason: format!("unexpected topic {topic0}"),
        });
    }

    E::decode_log_data(&log.log_data()).map_err(|e| EventError::Decode {
        event: name.to_string(),
        reason: e.to_string(),
    })
}

/// Handler that decodes into a typed event and hands it to an async callback.
pub struct TypedHandler<E, F> {
    callback: F,
    _event: PhantomData<fn() -> E>,
}

impl<E, F, Fut> TypedHandler<E, F>
where
    E: SolEvent + Send + 'static,
    F: Fn(E, LogEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            _event: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<E, F, Fut> EventHandler for TypedHandler<E, F>
where
    E: SolEvent + Send + 'static,
    F: Fn(E, LogEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn event_name(&self) -> &str {
        event_name::<E>()
    }

    async fn handle(&self, log: &LogEvent) -> Result<(), EventError> {
        let event = decode::<E>(log)?;
        (self.callback)(event, log.clone()).await;
        Ok(())
    }
}

/// Handler that forwards decoded events into a bounded channel, so a single
/// worker can consume several event kinds in order.
///
/// Sends block while the channel is full, until the token is cancelled.
pub struct ChannelHandler<E, M> {
    sender: mpsc::Sender<M>,
    cancel: CancellationToken,
    _event: PhantomData<fn() -> E>,
}

impl<E, M> ChannelHandler<E, M>
where
    E: SolEvent + Send + 'static,
    M: From<E> + Send + 'static,
{
    pub fn new(sender: mpsc::Sender<M>, cancel: CancellationToken) -> Self {
        Self {
            sender,
            cancel,
            _event: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<E, M> EventHandler for ChannelHandler<E, M>
where
    E: SolEvent + Send + 'static,
    M: From<E> + Send + 'static,
{
    fn event_name(&self) -> &str {
        event_name::<E>()
    }

    async fn handle(&self, log: &LogEvent) -> Result<(), EventError> {
        let event = decode::<E>(log)?;
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            sent = self.sender.send(M::from(event)) => sent.map_err(|_| EventError::Handler {
                event: event_name::<E>().to_string(),
                reason: "receiver closed".to_string(),
            }),
        }
    }
}

/// Boxes a typed callback handler.
pub fn typed<E, F, Fut>(callback: F) -> Arc<dyn EventHandler>
where
    E: SolEvent + Send + 'static,
    F: Fn(E, LogEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(TypedHandler::<E, F>::new(callback))
}

/// Boxes a channel-forwarding handler.
pub fn channel<E, M>(sender: mpsc::Sender<M>, cancel: CancellationToken) -> Arc<dyn EventHandler>
where
    E: SolEvent + Send + 'static,
    M: From<E> + Send + 'static,
{
    Arc::new(ChannelHandler::<E, M>::new(sender, cancel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, Bytes, U256};
    use alloy_sol_types::sol;

    sol! {
        #[derive(Debug)]
        event Deposited(address indexed who, uint256 indexed window, uint256 amount);
        #[derive(Debug)]
        event Other(uint256 value);
    }

    fn deposited_log() -> LogEvent {
        let event = Deposited {
            who: Address::repeat_byte(0x11),
            window: U256::from(7u64),
            amount: U256::from(1_000u64),
        };
        LogEvent::from_event(Address::repeat_byte(0xaa), &event, 12)
    }

    #[test]
    fn test_decode_reads_indexed_and_data_fields() {
        let decoded = decode::<Deposited>(&deposited_log()).unwrap();
        assert_eq!(decoded.who, Address::repeat_byte(0x11));
        assert_eq!(decoded.window, U256::from(7u64));
        assert_eq!(decoded.amount, U256::from(1_000u64));
    }

    #[test]
    fn test_decode_rejects_wrong_topic() {
        let err = decode::<Other>(&deposited_log()).unwrap_err();
        assert!(matches!(err, EventError::Decode { ref event, .. } if event == "Other"));
    }

    #[test]
    fn test_decode_rejects_empty_topics() {
        let log = LogEvent::default();
        assert_eq!(decode::<Deposited>(&log).unwrap_err(), EventError::NoTopics);
    }

    #[test]
    fn test_decode_rejects_truncated_data() {
        let mut log = deposited_log();
        log.data = Bytes::from(log.data[..4].to_vec());
        assert!(matches!(
            decode::<Deposited>(&log),
            Err(EventError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn test_typed_handler_invokes_callback() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = typed::<Deposited, _, _>(move |ev, log| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((ev.window, log.block_number));
            }
        });

        assert_eq!(handler.event_name(), "Deposited");
        handler.handle(&deposited_log()).await.unwrap();
        assert_eq!(rx.recv().await, Some((U256::from(7u64), 12)));
    }

    #[derive(Debug)]
    struct Window(U256);

    impl From<Deposited> for Window {
        fn from(ev: Deposited) -> Self {
            Window(ev.window)
        }
    }

    #[tokio::test]
    async fn test_channel_handler_forwards_and_reports_closed_receiver() {
        let (tx, mut rx) = mpsc::channel::<Window>(1);
        let handler = channel::<Deposited, Window>(tx, CancellationToken::new());

        handler.handle(&deposited_log()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().0, U256::from(7u64));

        drop(rx);
        let err = handler.handle(&deposited_log()).await.unwrap_err();
        assert!(matches!(err, EventError::Handler { .. }));
    }

    #[tokio::test]
    async fn test_channel_handler_stops_blocking_on_cancel() {
        let (tx, _rx) = mpsc::channel::<Window>(1);
        let cancel = CancellationToken::new();
        let handler = channel::<Deposited, Window>(tx, cancel.clone());

        handler.handle(&deposited_log()).await.unwrap();
        cancel.cancel();
        handler.handle(&deposited_log()).await.unwrap();
    }
}
