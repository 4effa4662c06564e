//! dirmq library root.
//!
//! A filesystem-backed message broker. Producers post JSON payloads to
//! named queues grouped under exchanges; consumers remove the oldest
//! pending messages. Every message is a file, every queue a directory.

pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;

pub use broker::{Consumer, Exchange, Manager, Message, Producer, Queue, QueueStats};
pub use cli::Commands;
pub use config::{BrokerConfig, BrokerOptions, ErrorPolicy, OrderingMode};
pub use error::{Error, Result};
