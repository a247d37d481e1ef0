//! Synchronization primitives for tasks.

pub mod event;
pub mod promise;

pub use event::SingleConsumerEvent;
pub use promise::{channel, Promise, PromiseFuture};
