//! Producers build messages and hand them to an exchange.

use serde::Serialize;
use std::sync::Arc;

use super::exchange::Exchange;
use super::message::Message;
use crate::error::Result;

/// Posts messages to one exchange.
#[derive(Clone, Debug)]
pub struct Producer {
    exchange: Arc<Exchange>,
}

impl Producer {
    pub(crate) fn new(exchange: Arc<Exchange>) -> Self {
        Self { exchange }
    }

    /// Build a message for `key` and route it.
    ///
    /// Under the lenient policy every failure is logged and `Ok(())` is
    /// returned, so callers cannot tell a dropped message from a delivered
    /// one.
    pub fn post<T: Serialize + ?Sized>(&self, key: &str, payload: &T) -> Result<()> {
        let posted = Message::from_serializable(key, payload)
            .and_then(|message| self.exchange.post_message(&message));

        self.exchange
            .options()
            .error_policy
            .recover("Failed to post message", posted, || ())
    }

    /// Route an already built message.
    pub fn post_message(&self, message: &Message) -> Result<()> {
        self.exchange.post_message(message)
    }

    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerOptions, ErrorPolicy};
    use crate::error::Error;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_post_routes_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = Exchange::open("ex", "DIRECT", dir.path().join("ex"), BrokerOptions::default()).unwrap();
        let queue = exchange.register_queue("prices").unwrap();
        let producer = exchange.producer();

        producer.post("prices", &json!({"symbol": "ETH", "bid": 1.0})).unwrap();
        let mut tags = BTreeMap::new();
        tags.insert("source", "feed");
        producer.post("prices", &tags).unwrap();

        assert_eq!(queue.len().unwrap(), 2);
    }

    #[test]
    fn test_post_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let lenient = Exchange::open("a", "DIRECT", dir.path().join("a"), BrokerOptions::default()).unwrap();
        assert!(lenient.producer().post("ghost", "hello").is_ok());

        let options = BrokerOptions::default().with_error_policy(ErrorPolicy::Strict);
        let strict = Exchange::open("b", "DIRECT", dir.path().join("b"), options).unwrap();
        assert!(matches!(strict.producer().post("ghost", "hello"), Err(Error::NotFound(_))));
    }
}
