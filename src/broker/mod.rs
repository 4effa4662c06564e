//! Broker module - exchanges, queues and their on-disk mirror.
//!
//! A broker root looks like:
//! - `MQManager.json` : registry of every exchange
//! - `<exchange>/exchange.json` : one descriptor per exchange
//! - `<exchange>/<queue>/<bucket>/<timestamp>.json` : pending messages

pub mod consumer;
pub mod exchange;
pub mod lock;
pub mod manager;
pub mod message;
pub mod producer;
pub mod queue;

pub use consumer::Consumer;
pub use exchange::{Exchange, ExchangeDescriptor};
pub use manager::{Manager, ManagerDescriptor};
pub use message::Message;
pub use producer::Producer;
pub use queue::{Queue, QueueDescriptor, QueueStats};

use crate::error::{Error, Result};

/// Exchange and queue names become directory names, so they must be a
/// single plain path component.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.contains('\0');

    if bad {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}
