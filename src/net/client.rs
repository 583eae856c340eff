//! Gossip Client
//!
//! Pooled one-way sender towards peer nodes, plus the preferred-address
//! book: when a peer advertises an internal address, the snitch helper
//! records it here and new connections go to that address instead. The
//! address book is the only gossip-related state persisted to disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::write_envelope;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::gossip::Envelope;

/// endpoint -> preferred endpoint mapping, persisted as TOML
#[derive(Debug, Default)]
pub struct PreferredAddressBook {
    path: Option<PathBuf>,
    map: RwLock<HashMap<Endpoint, Endpoint>>,
}

impl PreferredAddressBook {
    /// Load the book from `path`, starting empty if the file is absent
    /// or unreadable
    pub fn load(path: Option<PathBuf>) -> Self {
        let mut map = HashMap::new();
        if let Some(path) = &path {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str::<HashMap<String, String>>(&content) {
                    Ok(entries) => {
                        for (endpoint, preferred) in entries {
                            if let (Ok(endpoint), Ok(preferred)) =
                                (Endpoint::parse(&endpoint), Endpoint::parse(&preferred))
                            {
                                map.insert(endpoint, preferred);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("ignoring malformed preferred-address book: {}", e)
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("could not read preferred-address book: {}", e),
            }
        }
        Self {
            path,
            map: RwLock::new(map),
        }
    }

    pub fn set(&self, endpoint: &Endpoint, preferred: Endpoint) {
        {
            let mut map = self.map.write().unwrap();
            if map.get(endpoint) == Some(&preferred) {
                return;
            }
            map.insert(endpoint.clone(), preferred);
        }
        self.persist();
    }

    pub fn resolve(&self, endpoint: &Endpoint) -> String {
        let map = self.map.read().unwrap();
        match map.get(endpoint) {
            Some(preferred) => preferred.address(),
            None => endpoint.address(),
        }
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let entries: HashMap<String, String> = {
            let map = self.map.read().unwrap();
            map.iter()
                .map(|(endpoint, preferred)| (endpoint.to_string(), preferred.to_string()))
                .collect()
        };
        match toml::to_string(&entries) {
            Ok(content) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(path, content) {
                    tracing::warn!("could not persist preferred-address book: {}", e);
                }
            }
            Err(e) => tracing::warn!("could not serialize preferred-address book: {}", e),
        }
    }
}

/// One-way gossip sender with a write-half connection pool
pub struct GossipClient {
    pool: RwLock<HashMap<String, Arc<Mutex<OwnedWriteHalf>>>>,
    connect_timeout: Duration,
    preferred: PreferredAddressBook,
}

impl GossipClient {
    pub fn new(connect_timeout: Duration, preferred: PreferredAddressBook) -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
            connect_timeout,
            preferred,
        }
    }

    pub fn preferred(&self) -> &PreferredAddressBook {
        &self.preferred
    }

    pub fn set_preferred(&self, endpoint: &Endpoint, preferred: Endpoint) {
        // drop the pooled connection so the next send dials the new address
        self.remove_connection(&endpoint.address());
        self.preferred.set(endpoint, preferred);
    }

    /// Send one envelope without waiting for any reply. A stale pooled
    /// connection is dropped and redialed once.
    pub async fn send_one_way(&self, to: &Endpoint, envelope: &Envelope) -> Result<()> {
        let address = self.preferred.resolve(to);

        if let Some(entry) = self.get_connection(&address) {
            let mut writer = entry.lock().await;
            if write_envelope(&mut *writer, envelope).await.is_ok() {
                return Ok(());
            }
            drop(writer);
            self.remove_connection(&address);
        }

        let stream = self.connect(&address).await?;
        let (read_half, mut writer) = stream.into_split();
        // one-way transport: the peer answers over its own connection
        drop(read_half);
        write_envelope(&mut writer, envelope).await?;
        self.store_connection(address, writer);
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;
        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    fn get_connection(&self, address: &str) -> Option<Arc<Mutex<OwnedWriteHalf>>> {
        self.pool.read().unwrap().get(address).cloned()
    }

    fn store_connection(&self, address: String, writer: OwnedWriteHalf) {
        self.pool
            .write()
            .unwrap()
            .insert(address, Arc::new(Mutex::new(writer)));
    }

    fn remove_connection(&self, address: &str) {
        self.pool.write().unwrap().remove(address);
    }

    pub fn close_all(&self) {
        self.pool.write().unwrap().clear();
    }

    pub fn connection_count(&self) -> usize {
        self.pool.read().unwrap().len()
    }
}
