//! Top-level registry of exchanges, mirrored to `MQManager.json`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::exchange::{Exchange, ExchangeDescriptor};
use super::validate_name;
use crate::config::{BrokerConfig, BrokerOptions};
use crate::error::{Error, Result};

/// Registry file name inside the broker root.
pub const MANAGER_FILE: &str = "MQManager.json";

/// Persisted form of the registry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ManagerDescriptor {
    pub output_path: PathBuf,
    pub config_path: PathBuf,
    #[serde(default)]
    pub exchanges: BTreeMap<String, ExchangeDescriptor>,
}

/// Owns every exchange of one broker root.
///
/// Construct one per root and pass it around; several independent roots
/// can be open in the same process.
#[derive(Debug)]
pub struct Manager {
    root: PathBuf,
    config_path: PathBuf,
    options: BrokerOptions,
    exchanges: RwLock<HashMap<String, Arc<Exchange>>>,
}

impl Manager {
    /// Open a broker root with default options.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open(BrokerConfig::new(root))
    }

    /// Open a broker root, load the registry and rewrite it.
    pub fn open(config: BrokerConfig) -> Result<Self> {
        let BrokerConfig { root, options } = config;
        fs::create_dir_all(&root)?;

        let manager = Self {
            config_path: root.join(MANAGER_FILE),
            root,
            options,
            exchanges: RwLock::new(HashMap::new()),
        };

        manager.load()?;
        manager.persist()?;

        tracing::info!(
            "Broker opened at {} with {} exchanges",
            manager.root.display(),
            manager.exchanges.read().len()
        );
        Ok(manager)
    }

    fn load(&self) -> Result<()> {
        if !self.config_path.is_file() {
            return Ok(());
        }

        let policy = self.options.error_policy;
        let read = read_descriptor(&self.config_path).map(Some);
        let context = format!("Unreadable registry {}", self.config_path.display());
        let Some(descriptor) = policy.recover(&context, read, || None)? else {
            return Ok(());
        };

        let mut exchanges = self.exchanges.write();
        for (key, d) in descriptor.exchanges {
            if key != d.name {
                tracing::warn!("Registry entry '{}' names exchange '{}'", key, d.name);
            }

            let opened = Exchange::open_with_fallback(
                d.name.clone(),
                d.kind.clone(),
                d.output_path.clone(),
                self.options.clone(),
                Some(&d.dict_queue),
            );
            let context = format!("Could not restore exchange {}", d.name);
            if let Some(exchange) = policy.recover(&context, opened.map(Some), || None)? {
                exchanges.insert(d.name.clone(), exchange);
            }
        }

        Ok(())
    }

    /// Create an exchange under `<root>/<name>`.
    ///
    /// A duplicate name yields `Ok(None)` under the lenient policy and
    /// `Err(AlreadyExists)` under the strict one.
    pub fn create_exchange(&self, name: &str, kind: &str) -> Result<Option<Arc<Exchange>>> {
        validate_name(name)?;

        let mut exchanges = self.exchanges.write();
        if exchanges.contains_key(name) {
            let duplicate = Err(Error::AlreadyExists(format!("exchange '{}'", name)));
            return self
                .options
                .error_policy
                .recover("Could not create exchange", duplicate, || None);
        }

        let exchange = Exchange::open(name, kind, self.root.join(name), self.options.clone())?;
        exchanges.insert(name.to_string(), Arc::clone(&exchange));
        let descriptor = self.descriptor_from(&exchanges);
        self.persist_descriptor(&descriptor)?;
        drop(exchanges);

        tracing::info!("Created exchange {} ({})", name, kind);
        Ok(Some(exchange))
    }

    /// Look up an exchange. Unknown names are always an error.
    pub fn get_exchange(&self, name: &str) -> Result<Arc<Exchange>> {
        self.exchanges
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("exchange '{}'", name)))
    }

    /// Registered exchange names, sorted.
    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.exchanges.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    pub fn descriptor(&self) -> ManagerDescriptor {
        self.descriptor_from(&self.exchanges.read())
    }

    /// Rewrite `MQManager.json` from the in-memory registry.
    pub fn persist(&self) -> Result<()> {
        let exchanges = self.exchanges.read();
        let descriptor = self.descriptor_from(&exchanges);
        self.persist_descriptor(&descriptor)
    }

    fn persist_descriptor(&self, descriptor: &ManagerDescriptor) -> Result<()> {
        let written = write_descriptor(&self.config_path, descriptor);
        self.options
            .error_policy
            .recover("Failed to persist registry", written, || ())
    }

    fn descriptor_from(&self, exchanges: &HashMap<String, Arc<Exchange>>) -> ManagerDescriptor {
        ManagerDescriptor {
            output_path: self.root.clone(),
            config_path: self.config_path.clone(),
            exchanges: exchanges
                .iter()
                .map(|(name, exchange)| (name.clone(), exchange.descriptor()))
                .collect(),
        }
    }
}

fn read_descriptor(path: &Path) -> Result<ManagerDescriptor> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_descriptor(path: &Path, descriptor: &ManagerDescriptor) -> Result<()> {
    let content = serde_json::to_string_pretty(descriptor)?;
    fs::write(path, content)?;
    tracing::debug!("Saved registry {}", path.display());
    Ok(())
}
