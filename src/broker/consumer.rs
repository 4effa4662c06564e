//! Consumers: destructive reads of the oldest pending messages.
//!
//! A message file is deleted as soon as it is handed out. There is no
//! acknowledgment step, so a caller that crashes after receiving a message
//! loses it.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use super::exchange::Exchange;
use super::lock::with_lock;
use super::message::Message;
use super::queue::{PendingFile, Queue};
use crate::error::{Error, Result};

/// Reads from one queue of one exchange.
#[derive(Clone, Debug)]
pub struct Consumer {
    exchange: Arc<Exchange>,
    queue_name: String,
}

impl Consumer {
    pub(crate) fn new(exchange: Arc<Exchange>, queue_name: impl Into<String>) -> Self {
        Self {
            exchange,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    /// Remove and return the oldest pending message.
    ///
    /// `Ok(None)` means the queue is empty. A file that cannot be parsed
    /// comes back as an invalid message under the lenient policy.
    pub fn receive_one(&self) -> Result<Option<Message>> {
        Ok(self.receive(1)?.into_iter().next())
    }

    /// Remove and return up to `limit` oldest messages, oldest first.
    pub fn receive_many(&self, limit: usize) -> Result<Vec<Message>> {
        self.receive(limit)
    }

    /// Route a message through this consumer's exchange.
    pub fn post(&self, message: &Message) -> Result<()> {
        self.exchange.post_message(message)
    }

    fn receive(&self, limit: usize) -> Result<Vec<Message>> {
        let options = self.exchange.options();
        let policy = options.error_policy;

        // Resolved on every call so a re-registered queue is picked up.
        let Some(queue) = self.exchange.get_queue(&self.queue_name) else {
            let missing = Err(Error::NotFound(format!(
                "queue '{}' on exchange '{}'",
                self.queue_name,
                self.exchange.name()
            )));
            return policy.recover("Cannot receive", missing, Vec::new);
        };

        if limit == 0 {
            return Ok(Vec::new());
        }

        let taken = if options.exclusive_dequeue {
            with_lock(&queue.lock_path(), options.lock_timeout(), || {
                self.take_oldest(&queue, limit)
            })
        } else {
            self.take_oldest(&queue, limit)
        };

        let context = format!("Receive from queue {} failed", self.queue_name);
        policy.recover(&context, taken, Vec::new)
    }

    /// Scan, load the selected files, then delete them.
    fn take_oldest(&self, queue: &Queue, limit: usize) -> Result<Vec<Message>> {
        let options = self.exchange.options();
        let strict = options.error_policy.is_strict();

        let pending = queue.pending(options.ordering)?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let selected: &[PendingFile] = &pending[..limit.min(pending.len())];

        let mut loaded = Vec::with_capacity(selected.len());
        let mut malformed = None;
        for file in selected {
            match Message::load(&file.path) {
                Ok(message) => loaded.push((file, message)),
                Err(e) => {
                    tracing::error!("Could not read message {}: {}", file.path.display(), e);
                    if strict && malformed.is_none() {
                        malformed = Some(e);
                    }
                    loaded.push((file, Message::invalid(&file.path)));
                }
            }
        }

        // In strict mode only the unreadable files are consumed; readable
        // ones stay queued for the next call.
        if let Some(error) = malformed {
            for (file, message) in &loaded {
                if !message.is_valid() {
                    remove_message_file(file)?;
                }
            }
            return Err(error);
        }

        let messages = hand_out(loaded, strict, |path| fs::remove_file(path))?;
        tracing::debug!("Received {} messages from queue {}", messages.len(), self.queue_name);
        Ok(messages)
    }
}

/// Delete each loaded file and keep the messages whose file is gone.
///
/// A file that cannot be deleted stays queued and is left out of the
/// result under the lenient policy.
fn hand_out<F>(loaded: Vec<(&PendingFile, Message)>, strict: bool, mut remove: F) -> Result<Vec<Message>>
where
    F: FnMut(&Path) -> io::Result<()>,
{
    let mut messages = Vec::with_capacity(loaded.len());
    for (file, message) in loaded {
        match remove(&file.path) {
            Ok(()) => messages.push(message),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Another consumer took it between scan and delete.
                tracing::warn!("Message {} already consumed", file.path.display());
            }
            Err(e) if strict => return Err(e.into()),
            Err(e) => {
                tracing::warn!("Could not delete {}, leaving it queued: {}", file.path.display(), e);
            }
        }
    }
    Ok(messages)
}

fn remove_message_file(file: &PendingFile) -> Result<()> {
    match fs::remove_file(&file.path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
