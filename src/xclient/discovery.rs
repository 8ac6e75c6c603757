//! Server address discovery: a hand-maintained list, or one refreshed from
//! an HTTP registry with heartbeat-based liveness.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;

use crate::error::Error;
use crate::registry::SERVERS_HEADER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    RandomSelect,
    RoundRobinSelect,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Re-reads the server list from its source, if it has one.
    async fn refresh(&self) -> Result<(), Error>;
    /// Replaces the server list.
    async fn update(&self, servers: Vec<String>) -> Result<(), Error>;
    /// Picks one server according to `mode`.
    async fn get(&self, mode: SelectMode) -> Result<String, Error>;
    async fn get_all(&self) -> Result<Vec<String>, Error>;
}

struct ServersState {
    servers: Vec<String>,
    // round-robin cursor
    index: usize,
}

/// Discovery over a hand-maintained server list.
pub struct MultiServersDiscovery {
    state: Mutex<ServersState>,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        // random starting point so a fleet of fresh clients does not all
        // route its first call to server 0
        let index = rand::thread_rng().gen_range(0..u32::MAX as usize);
        MultiServersDiscovery {
            state: Mutex::new(ServersState { servers, index }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServersState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<(), Error> {
        // nothing to refresh from
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), Error> {
        self.state().servers = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, Error> {
        let mut state = self.state();
        let n = state.servers.len();
        if n == 0 {
            return Err(Error::Discovery("no available servers".into()));
        }
        match mode {
            SelectMode::RandomSelect => {
                Ok(state.servers[rand::thread_rng().gen_range(0..n)].clone())
            }
            SelectMode::RoundRobinSelect => {
                let server = state.servers[state.index % n].clone();
                state.index = (state.index + 1) % n;
                Ok(server)
            }
        }
    }

    async fn get_all(&self) -> Result<Vec<String>, Error> {
        Ok(self.state().servers.clone())
    }
}

pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery refreshed from a registry over HTTP. The registry reports the
/// alive servers in the `X-Geerpc-Servers` response header.
pub struct RegistryDiscovery {
    servers: MultiServersDiscovery,
    registry: String,
    update_timeout: Duration,
    last_update: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// `update_timeout` bounds how stale the cached list may get before a
    /// `get`/`get_all` triggers a refresh; zero picks the default.
    pub fn new(registry: impl Into<String>, update_timeout: Duration) -> Self {
        let update_timeout = if update_timeout.is_zero() {
            DEFAULT_UPDATE_TIMEOUT
        } else {
            update_timeout
        };
        RegistryDiscovery {
            servers: MultiServersDiscovery::new(Vec::new()),
            registry: registry.into(),
            update_timeout,
            last_update: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    fn is_fresh(&self) -> bool {
        let last_update = self
            .last_update
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        matches!(*last_update, Some(at) if at.elapsed() <= self.update_timeout)
    }

    fn stamp(&self) {
        let mut last_update = self
            .last_update
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last_update = Some(Instant::now());
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<(), Error> {
        if self.is_fresh() {
            return Ok(());
        }

        log::info!("rpc registry: refresh servers from registry {}", self.registry);
        let response = self
            .http
            .get(&self.registry)
            .send()
            .await
            .map_err(|err| Error::Discovery(format!("refresh failed: {}", err)))?;

        let servers: Vec<String> = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        self.servers.update(servers).await?;
        self.stamp();
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), Error> {
        self.servers.update(servers).await?;
        self.stamp();
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, Error> {
        self.refresh().await?;
        self.servers.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>, Error> {
        self.refresh().await?;
        self.servers.get_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn empty_list_has_no_servers() {
        let d = MultiServersDiscovery::new(Vec::new());
        match d.get(SelectMode::RandomSelect).await {
            Err(Error::Discovery(msg)) => assert_eq!(msg, "no available servers"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn round_robin_distributes_evenly() {
        let servers = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let d = MultiServersDiscovery::new(servers);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..7 {
            let server = d.get(SelectMode::RoundRobinSelect).await.unwrap();
            *counts.entry(server).or_default() += 1;
        }

        // 7 calls over 3 servers: every server gets 2 or 3
        assert_eq!(counts.values().sum::<usize>(), 7);
        for (_, count) in counts {
            assert!(count == 2 || count == 3);
        }
    }

    #[tokio::test]
    async fn random_select_stays_in_set() {
        let servers = vec!["a".to_string(), "b".to_string()];
        let d = MultiServersDiscovery::new(servers.clone());
        for _ in 0..20 {
            let server = d.get(SelectMode::RandomSelect).await.unwrap();
            assert!(servers.contains(&server));
        }
    }

    #[tokio::test]
    async fn update_replaces_list() {
        let d = MultiServersDiscovery::new(vec!["a".to_string()]);
        d.update(vec!["x".to_string(), "y".to_string()]).await.unwrap();
        assert_eq!(d.get_all().await.unwrap(), vec!["x", "y"]);
    }
}
