//! CLI commands for dirmq using clap.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

use crate::broker::Manager;
use crate::config::{default_root, settings_path, BrokerConfig, HOME_ENV};

/// dirmq - filesystem-backed message broker.
#[derive(Parser, Debug)]
#[command(name = "dirmq")]
#[command(version)]
#[command(about = "dirmq - exchanges, queues and JSON message files on disk", long_about = None)]
pub struct Commands {
    /// Broker root directory
    #[arg(long, global = true, env = HOME_ENV)]
    pub root: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage exchanges
    #[command(subcommand, alias = "x")]
    Exchange(ExchangeCommand),

    /// Manage queues
    #[command(subcommand, alias = "q")]
    Queue(QueueCommand),

    /// Post a message; the key names the target queue
    Post {
        exchange: String,
        key: String,
        /// JSON payload (anything that is not JSON is sent as a string)
        payload: String,
    },

    /// Receive (and remove) the oldest messages of a queue
    Receive {
        exchange: String,
        queue: String,

        /// Maximum number of messages
        #[arg(long, default_value_t = 1)]
        limit: usize,
    },

    /// Show broker settings
    Settings {
        /// Write the current settings to settings.json
        #[arg(long)]
        write: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ExchangeCommand {
    /// Create an exchange
    Create {
        name: String,

        /// Exchange type tag
        #[arg(long = "type", default_value = "DIRECT")]
        kind: String,
    },

    /// List exchanges
    List,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// Register a queue on an exchange
    Register { exchange: String, name: String },

    /// List queues of an exchange
    List { exchange: String },

    /// Show queue statistics
    Stats { exchange: String, name: String },

    /// Remove empty bucket directories
    Prune { exchange: String, name: String },
}

impl Commands {
    /// Broker root from `--root`, `DIRMQ_HOME`, or the per-user default.
    pub fn root_dir(&self) -> Result<PathBuf> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => Ok(default_root()?),
        }
    }

    pub fn run(&self) -> Result<()> {
        let config = BrokerConfig::load(self.root_dir()?)?;

        if let Command::Settings { write } = &self.command {
            return cmd_settings(&config, *write);
        }

        let manager = Manager::open(config)?;
        match &self.command {
            Command::Exchange(cmd) => cmd_exchange(&manager, cmd),
            Command::Queue(cmd) => cmd_queue(&manager, cmd),
            Command::Post { exchange, key, payload } => cmd_post(&manager, exchange, key, payload),
            Command::Receive { exchange, queue, limit } => cmd_receive(&manager, exchange, queue, *limit),
            Command::Settings { .. } => Ok(()),
        }
    }
}

// Command implementations

fn cmd_settings(config: &BrokerConfig, write: bool) -> Result<()> {
    if write {
        config.save()?;
        println!("Wrote {}", settings_path(&config.root).display());
    }
    println!("root: {}", config.root.display());
    println!("{}", serde_json::to_string_pretty(&config.options)?);
    Ok(())
}

fn cmd_exchange(manager: &Manager, cmd: &ExchangeCommand) -> Result<()> {
    match cmd {
        ExchangeCommand::Create { name, kind } => match manager.create_exchange(name, kind)? {
            Some(exchange) => println!("Created exchange {} ({})", exchange.name(), exchange.kind()),
            None => bail!("Exchange name already in use: {}", name),
        },
        ExchangeCommand::List => {
            let names = manager.exchange_names();
            println!("Exchanges ({}):", names.len());
            for name in names {
                let exchange = manager.get_exchange(&name)?;
                println!("  {} [{}] queues: {}", name, exchange.kind(), exchange.queue_names().len());
            }
        }
    }
    Ok(())
}

fn cmd_queue(manager: &Manager, cmd: &QueueCommand) -> Result<()> {
    match cmd {
        QueueCommand::Register { exchange, name } => {
            let queue = manager.get_exchange(exchange)?.register_queue(name)?;
            println!("Registered queue {} at {}", queue.name(), queue.storage_path().display());
        }
        QueueCommand::List { exchange } => {
            let exchange = manager.get_exchange(exchange)?;
            let names = exchange.queue_names();
            println!("Queues on {} ({}):", exchange.name(), names.len());
            for name in names {
                println!("  {}", name);
            }
        }
        QueueCommand::Stats { exchange, name } => {
            let Some(queue) = manager.get_exchange(exchange)?.get_queue(name) else {
                bail!("Queue not found: {}/{}", exchange, name);
            };
            println!("{}", queue.stats()?);
        }
        QueueCommand::Prune { exchange, name } => {
            let Some(queue) = manager.get_exchange(exchange)?.get_queue(name) else {
                bail!("Queue not found: {}/{}", exchange, name);
            };
            let removed = queue.prune_empty_buckets()?;
            println!("Removed {} empty buckets", removed);
        }
    }
    Ok(())
}

fn cmd_post(manager: &Manager, exchange: &str, key: &str, payload: &str) -> Result<()> {
    let exchange = manager.get_exchange(exchange)?;
    if exchange.get_queue(key).is_none() {
        bail!("Queue not present: {}/{}", exchange.name(), key);
    }

    let payload: Value =
        serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()));
    exchange.producer().post(key, &payload)?;
    println!("Posted to {}/{}", exchange.name(), key);
    Ok(())
}

fn cmd_receive(manager: &Manager, exchange: &str, queue: &str, limit: usize) -> Result<()> {
    let exchange = manager.get_exchange(exchange)?;
    let Some(consumer) = exchange.consumer(queue) else {
        bail!("Queue not found: {}/{}", exchange.name(), queue);
    };

    let messages = consumer.receive_many(limit)?;
    if messages.is_empty() {
        println!("Queue {} is empty", queue);
    }
    for message in messages {
        if message.is_valid() {
            println!("{}", serde_json::to_string(&message.to_record())?);
        } else {
            let path = message.path().map(|p| p.display().to_string()).unwrap_or_default();
            eprintln!("Dropped unreadable message {}", path);
        }
    }
    Ok(())
}
