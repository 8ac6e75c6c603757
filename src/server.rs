//! The dispatching server: accepts connections, negotiates a codec, then
//! reads requests sequentially and runs each handler in its own task. All
//! response writes are serialized by one mutex over the codec's write half,
//! so responses never interleave on the wire.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use erased_serde as erased;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinSet;

use crate::codec::{self, CodecRead, CodecSet, CodecWrite};
use crate::error::Error;
use crate::message::{Header, MAGIC_NUMBER};
use crate::service::{HandlerFuture, MethodType, Service};

/// Path that `CONNECT` upgrades target when RPC shares a port with HTTP.
pub const DEFAULT_RPC_PATH: &str = "/_geerpc_";
/// Path of the plain-text debug page listing per-method call counts.
pub const DEFAULT_DEBUG_PATH: &str = "/debug/geerpc";

/// Status line sent (and expected) for a successful `CONNECT` upgrade.
pub const CONNECTED: &str = "HTTP/1.0 200 Connected to GeeRPC";

type Sending = Arc<Mutex<Box<dyn CodecWrite>>>;

/// RPC server. Cheap to clone; clones share the registered services.
#[derive(Clone)]
pub struct Server {
    services: Arc<RwLock<HashMap<String, Arc<Service>>>>,
    codecs: Arc<CodecSet>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self::with_codecs(CodecSet::default())
    }

    /// A server resolving codec identifiers against a custom set.
    pub fn with_codecs(codecs: CodecSet) -> Self {
        Server {
            services: Arc::new(RwLock::new(HashMap::new())),
            codecs: Arc::new(codecs),
        }
    }

    /// Registers a service. Fails if the name is already taken.
    pub fn register(&self, service: Service) -> Result<(), Error> {
        let name = service.name().to_string();
        if name.is_empty() || name.contains('.') {
            return Err(Error::Internal(format!(
                "rpc server: invalid service name {:?}",
                name
            )));
        }

        let mut services = lock_write(&self.services);
        match services.entry(name) {
            Entry::Occupied(entry) => Err(Error::Internal(format!(
                "rpc: service already defined: {}",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    fn find_method(&self, service_method: &str) -> Result<Arc<MethodType>, Error> {
        let dot = service_method.rfind('.').ok_or_else(|| {
            Error::Service(format!(
                "rpc server: service/method request ill-formed: {}",
                service_method
            ))
        })?;
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);

        let service = lock_read(&self.services)
            .get(service_name)
            .cloned()
            .ok_or_else(|| {
                Error::Service(format!("rpc server: can't find service {}", service_name))
            })?;
        service.method(method_name).ok_or_else(|| {
            Error::Service(format!("rpc server: can't find method {}", method_name))
        })
    }

    /// Accepts connections forever, serving each in its own task. Returns
    /// only when the listener itself fails.
    pub async fn accept(&self, listener: TcpListener) -> Result<(), Error> {
        loop {
            let (stream, peer) = listener.accept().await?;
            log::info!("rpc server: accepting connection from {}", peer);

            let server = self.clone();
            tokio::spawn(async move {
                server.serve_conn(stream).await;
                log::info!("rpc server: client disconnected from {}", peer);
            });
        }
    }

    /// Serves one duplex stream: option preamble, then the request loop.
    /// Handshake failures are logged and the connection dropped without a
    /// response.
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.serve_stream(reader, writer).await;
    }

    pub async fn serve_stream<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut reader = reader;
        let options = match codec::read_options(&mut reader).await {
            Ok(options) => options,
            Err(err) => {
                log::error!("rpc server: option error: {}", err);
                return;
            }
        };
        if options.magic_number != MAGIC_NUMBER {
            log::error!(
                "rpc server: invalid magic number {:#x}",
                options.magic_number
            );
            return;
        }
        let ctor = match self.codecs.get(&options.codec_type) {
            Some(ctor) => ctor,
            None => {
                log::error!("rpc server: invalid codec type {}", options.codec_type);
                return;
            }
        };

        let (codec_read, codec_write) = ctor(Box::new(reader), Box::new(writer));
        self.serve_codec(codec_read, codec_write, options.handle_timeout)
            .await;
    }

    async fn serve_codec(
        &self,
        mut reader: Box<dyn CodecRead>,
        writer: Box<dyn CodecWrite>,
        handle_timeout: Duration,
    ) {
        let sending: Sending = Arc::new(Mutex::new(writer));
        let mut handlers = JoinSet::new();

        loop {
            let header = match reader.read_header().await {
                None => break,
                Some(Err(err)) => {
                    log::error!("rpc server: read header error: {}", err);
                    break;
                }
                Some(Ok(header)) => header,
            };

            let method = match self.find_method(&header.service_method) {
                Ok(method) => method,
                Err(err) => {
                    // the body frame must still be consumed to stay aligned
                    if let Err(read_err) = reader.read_body(None).await {
                        log::error!("rpc server: read body error: {}", read_err);
                        break;
                    }
                    send_error_response(&sending, header, err).await;
                    continue;
                }
            };

            let mut outcome: Option<Result<HandlerFuture, Error>> = None;
            {
                let method = &method;
                let mut sink =
                    |de: &mut dyn erased::Deserializer<'static>| -> Result<(), Error> {
                        outcome = Some(method.invoke(de));
                        Ok(())
                    };
                if let Err(err) = reader.read_body(Some(&mut sink)).await {
                    log::error!("rpc server: read body error: {}", err);
                    break;
                }
            }
            let fut = match outcome {
                Some(Ok(fut)) => fut,
                Some(Err(err)) => {
                    send_error_response(&sending, header, err).await;
                    continue;
                }
                None => break,
            };

            handlers.spawn(handle_request(
                Arc::clone(&sending),
                header,
                fut,
                handle_timeout,
            ));
        }

        // drain in-flight handlers before tearing the connection down
        while handlers.join_next().await.is_some() {}
        sending.lock().await.close().await;
    }

    /// Accepts connections that speak HTTP first: a `CONNECT` on the RPC
    /// path upgrades to the normal RPC protocol on the same socket; the
    /// debug path answers with per-method call counts.
    pub async fn accept_http(&self, listener: TcpListener) -> Result<(), Error> {
        loop {
            let (stream, peer) = listener.accept().await?;
            log::info!("rpc server: accepting http connection from {}", peer);

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.serve_http_conn(stream).await {
                    log::debug!("rpc server: http connection from {}: {}", peer, err);
                }
            });
        }
    }

    async fn serve_http_conn(&self, stream: tokio::net::TcpStream) -> Result<(), Error> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").to_string();

        // drain the remaining header lines up to the blank separator
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
        }

        match (method.as_str(), path.as_str()) {
            ("CONNECT", DEFAULT_RPC_PATH) => {
                write_half
                    .write_all(format!("{}\r\n\r\n", CONNECTED).as_bytes())
                    .await?;
                write_half.flush().await?;
                self.serve_stream(reader, write_half).await;
                Ok(())
            }
            ("GET", DEFAULT_DEBUG_PATH) => {
                let body = self.debug_text();
                let response = format!(
                    "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                write_half.write_all(response.as_bytes()).await?;
                write_half.shutdown().await?;
                Ok(())
            }
            _ => {
                write_half
                    .write_all(
                        b"HTTP/1.0 405 Method Not Allowed\r\nContent-Type: text/plain\r\n\r\n405 must CONNECT\n",
                    )
                    .await?;
                write_half.shutdown().await?;
                Ok(())
            }
        }
    }

    fn debug_text(&self) -> String {
        let services = lock_read(&self.services);
        let mut names: Vec<_> = services.keys().cloned().collect();
        names.sort();

        let mut out = String::new();
        for name in names {
            if let Some(service) = services.get(&name) {
                for (method, calls) in service.method_stats() {
                    out.push_str(&format!("{}.{}: {}\n", name, method, calls));
                }
            }
        }
        out
    }
}

/// Runs one handler, enforcing the negotiated handle timeout. The handler
/// task signals `called` once the user method returns and `sent` once its
/// response is on the wire; on timeout the coordinator answers in its place
/// and the late response (if any) is discarded by the client.
async fn handle_request(
    sending: Sending,
    header: Header,
    fut: HandlerFuture,
    handle_timeout: Duration,
) {
    let (called_tx, called_rx) = oneshot::channel::<()>();
    let (sent_tx, sent_rx) = oneshot::channel::<()>();

    let response_header = Header {
        service_method: header.service_method.clone(),
        seq: header.seq,
        error: String::new(),
    };
    let sending_for_handler = Arc::clone(&sending);
    tokio::spawn(async move {
        let result = fut.await;
        let _ = called_tx.send(());

        let mut header = response_header;
        match result {
            Ok(body) => send_response(&sending_for_handler, &header, body.as_ref()).await,
            Err(err) => {
                header.error = err.to_string();
                send_response(&sending_for_handler, &header, &()).await;
            }
        }
        let _ = sent_tx.send(());
    });

    if handle_timeout.is_zero() {
        let _ = called_rx.await;
        let _ = sent_rx.await;
        return;
    }

    match tokio::time::timeout(handle_timeout, called_rx).await {
        Err(_) => {
            let header = Header {
                service_method: header.service_method,
                seq: header.seq,
                error: format!(
                    "rpc server: request handle timeout: expect within {:?}",
                    handle_timeout
                ),
            };
            send_response(&sending, &header, &()).await;
        }
        Ok(_) => {
            let _ = sent_rx.await;
        }
    }
}

async fn send_error_response(sending: &Sending, mut header: Header, err: Error) {
    header.error = err.to_string();
    send_response(sending, &header, &()).await;
}

async fn send_response(
    sending: &Mutex<Box<dyn CodecWrite>>,
    header: &Header,
    body: &(dyn erased::Serialize + Send + Sync),
) {
    let mut writer = sending.lock().await;
    if let Err(err) = writer.write(header, body).await {
        log::error!("rpc server: write response error: {}", err);
    }
}

fn lock_read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
