//! Load-balancing facade over multiple single-connection clients.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::error::Error;
use crate::message::Options;

pub mod discovery;

pub use discovery::{Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode};

/// Client that routes each call to one server picked by a `Discovery`,
/// caching one connection per address.
pub struct XClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    options: Options,
    clients: Mutex<HashMap<String, Client>>,
}

impl<D: Discovery> XClient<D> {
    pub fn new(discovery: D, mode: SelectMode, options: Options) -> Self {
        XClient {
            discovery,
            mode,
            options,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Closes and evicts every cached client.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
    }

    async fn dial(&self, rpc_addr: &str) -> Result<Client, Error> {
        {
            let mut clients = self.clients.lock().await;
            if let Some(client) = clients.get(rpc_addr).cloned() {
                if client.is_available() {
                    return Ok(client);
                }
                clients.remove(rpc_addr);
                let _ = client.close().await;
            }
        }

        // dial outside the cache lock
        let client = Client::sdial(rpc_addr, self.options.clone()).await?;
        let mut clients = self.clients.lock().await;
        let entry = clients
            .entry(rpc_addr.to_string())
            .or_insert_with(|| client.clone());
        Ok(entry.clone())
    }

    async fn call_addr<Req, Res>(
        &self,
        rpc_addr: &str,
        service_method: &str,
        args: Req,
    ) -> Result<Res, Error>
    where
        Req: Serialize + Send + Sync + 'static,
        Res: DeserializeOwned + Send + 'static,
    {
        let client = self.dial(rpc_addr).await?;
        client.call(service_method, args).await
    }

    /// Calls one server picked by the configured select mode.
    pub async fn call<Req, Res>(&self, service_method: &str, args: Req) -> Result<Res, Error>
    where
        Req: Serialize + Send + Sync + 'static,
        Res: DeserializeOwned + Send + 'static,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        self.call_addr(&rpc_addr, service_method, args).await
    }

    /// Calls every known server concurrently. The first failure cancels the
    /// calls still in flight and becomes the return value; otherwise the
    /// first successful reply is returned (`None` with no servers). Each
    /// branch decodes into its own fresh reply value, so a losing reply
    /// never clobbers the winner.
    pub async fn broadcast<Req, Res>(
        &self,
        service_method: &str,
        args: Req,
    ) -> Result<Option<Res>, Error>
    where
        Req: Serialize + Send + Sync + Clone + 'static,
        Res: DeserializeOwned + Send + 'static,
    {
        let servers = self.discovery.get_all().await?;
        let token = CancellationToken::new();
        let outcome: StdMutex<(Option<Error>, Option<Res>)> = StdMutex::new((None, None));

        let calls = servers.into_iter().map(|rpc_addr| {
            let token = token.clone();
            let args = args.clone();
            let outcome = &outcome;
            async move {
                let result: Result<Res, Error> = tokio::select! {
                    _ = token.cancelled() => Err(Error::Shutdown),
                    result = self.call_addr(&rpc_addr, service_method, args) => result,
                };

                let mut guard = outcome
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match result {
                    Ok(reply) => {
                        if guard.1.is_none() {
                            guard.1 = Some(reply);
                        }
                    }
                    Err(err) => {
                        if guard.0.is_none() {
                            guard.0 = Some(err);
                            // prune the calls that have not finished yet
                            token.cancel();
                        }
                    }
                }
            }
        });
        join_all(calls).await;

        let (err, reply) = outcome
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match err {
            Some(err) => Err(err),
            None => Ok(reply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_with_no_servers() {
        let xclient = XClient::new(
            MultiServersDiscovery::new(Vec::new()),
            SelectMode::RandomSelect,
            Options::default(),
        );
        let reply: Option<i32> = xclient.broadcast("Foo.Sum", (1i32, 2i32)).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn call_with_no_servers() {
        let xclient = XClient::new(
            MultiServersDiscovery::new(Vec::new()),
            SelectMode::RoundRobinSelect,
            Options::default(),
        );
        let err = xclient
            .call::<_, i32>("Foo.Sum", (1i32, 2i32))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Discovery(_)));
    }
}
