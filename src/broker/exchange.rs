//! Exchanges: named groups of queues with routing by message key.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::consumer::Consumer;
use super::message::Message;
use super::producer::Producer;
use super::queue::{Queue, QueueDescriptor};
use super::validate_name;
use crate::config::BrokerOptions;
use crate::error::{Error, Result};

/// Descriptor file name inside an exchange directory.
pub const EXCHANGE_FILE: &str = "exchange.json";

/// Persisted form of an exchange (`exchange.json`).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExchangeDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub output_path: PathBuf,
    pub save_path: PathBuf,
    #[serde(default)]
    pub dict_queue: BTreeMap<String, QueueDescriptor>,
}

/// A named collection of queues.
#[derive(Debug)]
pub struct Exchange {
    name: String,
    kind: String,
    storage_path: PathBuf,
    save_path: PathBuf,
    options: BrokerOptions,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
}

impl Exchange {
    /// Open an exchange rooted at `storage_path`, restoring any queues
    /// recorded in its descriptor, then rewrite the descriptor.
    pub fn open(
        name: impl Into<String>,
        kind: impl Into<String>,
        storage_path: impl Into<PathBuf>,
        options: BrokerOptions,
    ) -> Result<Arc<Self>> {
        Self::open_with_fallback(name.into(), kind.into(), storage_path.into(), options, None)
    }

    /// Like `open`, but restores `fallback` queues when `exchange.json`
    /// is missing.
    pub(crate) fn open_with_fallback(
        name: String,
        kind: String,
        storage_path: PathBuf,
        options: BrokerOptions,
        fallback: Option<&BTreeMap<String, QueueDescriptor>>,
    ) -> Result<Arc<Self>> {
        validate_name(&name)?;

        let save_path = storage_path.join(EXCHANGE_FILE);
        let exchange = Self {
            name,
            kind,
            storage_path,
            save_path,
            options,
            queues: RwLock::new(HashMap::new()),
        };

        exchange.load(fallback)?;
        exchange.persist()?;

        Ok(Arc::new(exchange))
    }

    fn load(&self, fallback: Option<&BTreeMap<String, QueueDescriptor>>) -> Result<()> {
        let policy = self.options.error_policy;

        let recorded = if self.save_path.is_file() {
            let read = read_descriptor(&self.save_path).map(|d| Some(d.dict_queue));
            policy.recover(
                &format!("Unreadable exchange descriptor {}", self.save_path.display()),
                read,
                || None,
            )?
        } else if let Some(queues) = fallback {
            tracing::info!("Restoring exchange {} from registry", self.name);
            Some(queues.clone())
        } else {
            None
        };

        let Some(recorded) = recorded else {
            return Ok(());
        };

        let mut queues = self.queues.write();
        for (key, descriptor) in recorded {
            if key != descriptor.name {
                tracing::warn!(
                    "Queue entry '{}' names queue '{}' in exchange {}",
                    key,
                    descriptor.name,
                    self.name
                );
            }

            // Queues always live under the exchange directory; the recorded
            // output_path is informational.
            let opened = validate_name(&descriptor.name)
                .and_then(|_| Queue::open(&descriptor.name, &self.storage_path));
            let context = format!("Could not restore queue {}/{}", self.name, descriptor.name);
            if let Some(queue) = policy.recover(&context, opened.map(Some), || None)? {
                queues.insert(descriptor.name.clone(), Arc::new(queue));
            }
        }

        tracing::debug!("Loaded exchange {} with {} queues", self.name, queues.len());
        Ok(())
    }

    /// Register (or re-register) a queue and persist the descriptor.
    ///
    /// Re-registering replaces the in-memory entry; files on disk are
    /// untouched.
    pub fn register_queue(&self, name: &str) -> Result<Arc<Queue>> {
        validate_name(name)?;
        let queue = Arc::new(Queue::open(name, &self.storage_path)?);

        let mut queues = self.queues.write();
        queues.insert(name.to_string(), Arc::clone(&queue));
        let descriptor = self.descriptor_from(&queues);
        self.persist_descriptor(&descriptor)?;
        drop(queues);

        tracing::info!("Registered queue {} on exchange {}", name, self.name);
        Ok(queue)
    }

    /// Deregistration is not supported; queues live as long as the exchange.
    pub fn deregister_queue(&self, name: &str) -> Result<()> {
        tracing::debug!("Ignoring deregistration of queue {} on exchange {}", name, self.name);
        Ok(())
    }

    pub fn get_queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.read().get(name).cloned()
    }

    /// Registered queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Route a message to the queue named by its key.
    ///
    /// Unroutable messages are dropped; the policy decides whether the
    /// caller hears about it.
    pub fn post_message(&self, message: &Message) -> Result<()> {
        let routed = match self.get_queue(message.key()) {
            Some(queue) => queue.append(message).map(|_| ()),
            None => Err(Error::NotFound(format!(
                "queue '{}' on exchange '{}'",
                message.key(),
                self.name
            ))),
        };

        self.options
            .error_policy
            .recover("Message not delivered", routed, || ())
    }

    pub fn producer(self: &Arc<Self>) -> Producer {
        Producer::new(Arc::clone(self))
    }

    /// Consumer for a registered queue, or `None` if it is unknown.
    pub fn consumer(self: &Arc<Self>, queue_name: &str) -> Option<Consumer> {
        if !self.queues.read().contains_key(queue_name) {
            tracing::debug!("No queue {} on exchange {}", queue_name, self.name);
            return None;
        }
        Some(Consumer::new(Arc::clone(self), queue_name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opaque exchange type tag.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    pub fn descriptor(&self) -> ExchangeDescriptor {
        self.descriptor_from(&self.queues.read())
    }

    /// Write `exchange.json`.
    pub fn persist(&self) -> Result<()> {
        let queues = self.queues.read();
        let descriptor = self.descriptor_from(&queues);
        self.persist_descriptor(&descriptor)
    }

    fn persist_descriptor(&self, descriptor: &ExchangeDescriptor) -> Result<()> {
        let written = write_descriptor(&self.storage_path, &self.save_path, descriptor);
        let context = format!("Failed to persist exchange {}", self.name);
        self.options.error_policy.recover(&context, written, || ())
    }

    fn descriptor_from(&self, queues: &HashMap<String, Arc<Queue>>) -> ExchangeDescriptor {
        ExchangeDescriptor {
            name: self.name.clone(),
            kind: self.kind.clone(),
            output_path: self.storage_path.clone(),
            save_path: self.save_path.clone(),
            dict_queue: queues
                .iter()
                .map(|(name, queue)| (name.clone(), queue.descriptor()))
                .collect(),
        }
    }
}

fn read_descriptor(path: &Path) -> Result<ExchangeDescriptor> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_descriptor(dir: &Path, path: &Path, descriptor: &ExchangeDescriptor) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    let content = serde_json::to_string_pretty(descriptor)?;
    fs::write(path, content)?;
    tracing::debug!("Saved exchange descriptor {}", path.display());
    Ok(())
}
