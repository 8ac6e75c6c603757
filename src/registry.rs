//! Registry tracking alive servers via TTL'd heartbeats, served over HTTP.
//!
//! Servers `POST` their address periodically; clients `GET` the alive list
//! from the `X-Geerpc-Servers` response header.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hyper::header::HeaderValue;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};

use crate::error::Error;

pub const DEFAULT_REGISTRY_PATH: &str = "/_geerpc/registry";
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Response header carrying the comma-joined alive server list.
pub const SERVERS_HEADER: &str = "X-Geerpc-Servers";
/// Request header carrying one server address on registration/heartbeat.
pub const SERVER_HEADER: &str = "X-Geerpc-Server";

/// Registry state: one entry per server address with its last heartbeat.
pub struct Registry {
    timeout: Duration,
    path: String,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Registry {
    /// `timeout` is how long an entry stays alive after its last heartbeat;
    /// zero means entries never expire.
    pub fn new(timeout: Duration) -> Self {
        Self::with_path(timeout, DEFAULT_REGISTRY_PATH)
    }

    pub fn with_path(timeout: Duration, path: impl Into<String>) -> Self {
        Registry {
            timeout,
            path: path.into(),
            servers: Mutex::new(HashMap::new()),
        }
    }

    fn servers(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.servers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn put_server(&self, addr: &str) {
        self.servers().insert(addr.to_string(), Instant::now());
    }

    /// Alive servers, sorted. Expired entries are purged on the same pass.
    fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers();
        let now = Instant::now();
        let mut alive = Vec::with_capacity(servers.len());
        servers.retain(|addr, heartbeat| {
            if self.timeout.is_zero() || now.duration_since(*heartbeat) <= self.timeout {
                alive.push(addr.clone());
                true
            } else {
                false
            }
        });
        alive.sort();
        alive
    }

    /// HTTP entry point: `GET` reports the alive list, `POST` upserts a
    /// heartbeat, anything else is rejected.
    pub fn handle(&self, req: Request<Body>) -> Response<Body> {
        if req.uri().path() != self.path {
            return status(StatusCode::NOT_FOUND);
        }

        match *req.method() {
            Method::GET => match HeaderValue::from_str(&self.alive_servers().join(",")) {
                Ok(value) => {
                    let mut response = Response::new(Body::empty());
                    response.headers_mut().insert(SERVERS_HEADER, value);
                    response
                }
                Err(_) => status(StatusCode::INTERNAL_SERVER_ERROR),
            },
            Method::POST => {
                match req
                    .headers()
                    .get(SERVER_HEADER)
                    .and_then(|value| value.to_str().ok())
                {
                    Some(addr) if !addr.is_empty() => {
                        self.put_server(addr);
                        status(StatusCode::OK)
                    }
                    _ => status(StatusCode::INTERNAL_SERVER_ERROR),
                }
            }
            _ => status(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    /// Binds the registry and returns its local address plus the serve
    /// future, which the caller drives (usually in a spawned task).
    pub fn start(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<(SocketAddr, impl Future<Output = Result<(), Error>>), Error> {
        let registry = Arc::clone(self);
        let make_svc = make_service_fn(move |_conn| {
            let registry = Arc::clone(&registry);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let registry = Arc::clone(&registry);
                    async move { Ok::<_, Infallible>(registry.handle(req)) }
                }))
            }
        });

        let builder = hyper::Server::try_bind(&addr)
            .map_err(|err| Error::Internal(format!("registry bind failed: {}", err)))?;
        let server = builder.serve(make_svc);
        let local_addr = server.local_addr();
        log::info!("rpc registry: serving at http://{}{}", local_addr, self.path);

        Ok((local_addr, async move {
            server
                .await
                .map_err(|err| Error::Internal(format!("registry server failed: {}", err)))
        }))
    }
}

fn status(code: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = code;
    response
}

/// Registers `addr` with the registry and keeps it alive: one POST up
/// front (its failure is returned), then one every `period` from a
/// background task until a send fails. A zero `period` leaves a minute of
/// slack before the default registry timeout.
pub async fn heartbeat(registry: &str, addr: &str, period: Duration) -> Result<(), Error> {
    let period = if period.is_zero() {
        DEFAULT_REGISTRY_TIMEOUT - Duration::from_secs(60)
    } else {
        period
    };

    let client = reqwest::Client::new();
    send_heartbeat(&client, registry, addr).await?;

    let registry = registry.to_string();
    let addr = addr.to_string();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            if let Err(err) = send_heartbeat(&client, &registry, &addr).await {
                log::error!("rpc server: heartbeat error: {}", err);
                break;
            }
        }
    });
    Ok(())
}

async fn send_heartbeat(
    client: &reqwest::Client,
    registry: &str,
    addr: &str,
) -> Result<(), Error> {
    log::info!("{} send heartbeat to registry {}", addr, registry);
    client
        .post(registry)
        .header(SERVER_HEADER, addr)
        .send()
        .await
        .map_err(|err| Error::Internal(format!("heartbeat failed: {}", err)))?;
    Ok(())
}
