//! Contract event plumbing.
//!
//! The [`Publisher`] polls the chain and pushes raw logs into an
//! [`EventManager`], normally a [`Listener`]. The listener resolves
//! subscriptions by event name against the known [`ContractAbi`]s and fans
//! each log out to every handler bound to its topic, concurrently, waiting
//! for all of them before the next log is published.
//!
//! A handler failure is logged and delivered on that subscriber's error
//! channel only. It never reaches sibling handlers or the publisher.

mod abi;
mod handler;
mod listener;
mod log;
pub mod progress;
pub mod publisher;

pub use abi::{event_name, ContractAbi, EventInfo};
pub use handler::{channel, decode, typed, ChannelHandler, EventError, EventHandler, TypedHandler};
pub use listener::{EventManager, Listener, Subscription};
pub use log::LogEvent;
pub use progress::{FileProgressStore, InMemoryProgressStore, ProgressError, ProgressStore};
pub use publisher::{ChainClient, LogFilter, Publisher, PublisherConfig, PublisherError, QueryError};
