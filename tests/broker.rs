use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

use dirmq::{BrokerConfig, BrokerOptions, Error, ErrorPolicy, Manager, OrderingMode};
use serde_json::json;

fn open(root: &std::path::Path, options: BrokerOptions) -> Manager {
    dirmq::logging::init_test();
    Manager::open(BrokerConfig::new(root).with_options(options)).unwrap()
}

#[test]
fn posts_come_back_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path(), BrokerOptions::default());
    let exchange = manager.create_exchange("Test", "DIRECT").unwrap().unwrap();
    exchange.register_queue("test_folder").unwrap();

    let producer = exchange.producer();
    for i in 0..25 {
        producer.post("test_folder", &json!({ "fname": "ada", "seq": i })).unwrap();
    }

    let consumer = exchange.consumer("test_folder").unwrap();
    let mut seen = Vec::new();
    while let Some(msg) = consumer.receive_one().unwrap() {
        assert_eq!(msg.key(), "test_folder");
        assert!(!msg.path().unwrap().exists());
        seen.push(msg.payload()["seq"].as_i64().unwrap());
    }
    assert_eq!(seen, (0..25).collect::<Vec<i64>>());
}

#[test]
fn registered_queue_has_directory() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path(), BrokerOptions::default());
    let exchange = manager.create_exchange("Binance", "Key").unwrap().unwrap();

    exchange.register_queue("Transactions").unwrap();
    let queue = exchange.get_queue("Transactions").unwrap();
    assert!(queue.storage_path().is_dir());
    assert_eq!(queue.storage_path(), dir.path().join("Binance").join("Transactions"));
}

#[test]
fn receive_many_takes_oldest_three_of_five() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path(), BrokerOptions::default());
    let exchange = manager.create_exchange("ex", "DIRECT").unwrap().unwrap();
    let queue = exchange.register_queue("q").unwrap();

    let producer = exchange.producer();
    for i in 0..5 {
        producer.post("q", &i).unwrap();
    }

    let consumer = exchange.consumer("q").unwrap();
    let batch = consumer.receive_many(3).unwrap();
    let values: Vec<i64> = batch.iter().map(|m| m.payload_as().unwrap()).collect();
    assert_eq!(values, vec![0, 1, 2]);
    assert_eq!(queue.len().unwrap(), 2);
}

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let manager = open(dir.path(), BrokerOptions::default());
        let exchange = manager.create_exchange("Binance", "Key").unwrap().unwrap();
        exchange.register_queue("Transactions").unwrap();
        exchange.producer().post("Transactions", "pending").unwrap();
        manager.create_exchange("Test", "DIRECT").unwrap();
    }

    let manager = open(dir.path(), BrokerOptions::default());
    assert_eq!(manager.exchange_names(), vec!["Binance", "Test"]);
    let exchange = manager.get_exchange("Binance").unwrap();
    assert_eq!(exchange.queue_names(), vec!["Transactions"]);

    let msg = exchange.consumer("Transactions").unwrap().receive_one().unwrap().unwrap();
    assert_eq!(msg.payload(), &json!("pending"));
}

#[test]
fn strict_policy_surfaces_failures() {
    let dir = tempfile::tempdir().unwrap();
    let options = BrokerOptions::default().with_error_policy(ErrorPolicy::Strict);
    let manager = open(dir.path(), options);
    let exchange = manager.create_exchange("A", "DIRECT").unwrap().unwrap();

    assert!(matches!(manager.create_exchange("A", "DIRECT"), Err(Error::AlreadyExists(_))));
    assert!(matches!(manager.get_exchange("B"), Err(Error::NotFound(_))));
    assert!(matches!(exchange.producer().post("nowhere", &1), Err(Error::NotFound(_))));
    assert_eq!(manager.exchange_names(), vec!["A"]);
}

#[test]
fn embedded_timestamp_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let options = BrokerOptions::default().with_ordering(OrderingMode::CreationTimestamp);
    let manager = open(dir.path(), options);
    let exchange = manager.create_exchange("ex", "DIRECT").unwrap().unwrap();
    exchange.register_queue("q").unwrap();

    // Build first, post in reverse: creation time wins over write time.
    let messages: Vec<_> = (0..4).map(|i| dirmq::Message::new("q", json!(i))).collect();
    for msg in messages.iter().rev() {
        exchange.post_message(msg).unwrap();
    }

    let consumer = exchange.consumer("q").unwrap();
    let got: Vec<i64> = consumer
        .receive_many(10)
        .unwrap()
        .iter()
        .map(|m| m.payload_as().unwrap())
        .collect();
    assert_eq!(got, vec![0, 1, 2, 3]);
}

#[test]
fn concurrent_consumers_receive_each_message_once() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open(dir.path(), BrokerOptions::default());
    let exchange = manager.create_exchange("ex", "DIRECT").unwrap().unwrap();
    exchange.register_queue("work").unwrap();

    let producer = exchange.producer();
    for i in 0..200 {
        producer.post("work", &i).unwrap();
    }

    let received = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let consumer = exchange.consumer("work").unwrap();
            let received = Arc::clone(&received);
            thread::spawn(move || loop {
                let batch = consumer.receive_many(7).unwrap();
                if batch.is_empty() {
                    break;
                }
                let mut received = received.lock().unwrap();
                for msg in batch {
                    received.push(msg.payload_as::<i64>().unwrap());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 200);
    let unique: HashSet<i64> = received.iter().copied().collect();
    assert_eq!(unique.len(), 200);
}
