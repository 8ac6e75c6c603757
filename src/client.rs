//! The multiplexing client: many concurrent in-flight calls over one
//! connection, each keyed by a monotonically increasing sequence number and
//! demultiplexed by a single reader task.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use erased_serde as erased;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::sync::Mutex as AsyncMutex;

use crate::codec::{self, CodecRead, CodecSet, CodecWrite};
use crate::error::Error;
use crate::message::{Header, Options, MAGIC_NUMBER};
use crate::server::{CONNECTED, DEFAULT_RPC_PATH};

/// Completes one pending call. Invoked exactly once with either a
/// deserializer over the reply body or the error that ended the call; its
/// own error return reports a reply decode failure to the reader loop.
type ReplyHandler = Box<
    dyn FnMut(Result<&mut dyn erased::Deserializer<'static>, Error>) -> Result<(), Error> + Send,
>;

struct State {
    // seq starts at 1, 0 marks a call that never reached the pending map
    seq: u64,
    pending: HashMap<u64, ReplyHandler>,
    closing: bool,
    shutdown: bool,
    stop: Option<oneshot::Sender<()>>,
}

struct ClientCore {
    // outer lock: serializes request and response writes on the wire
    sending: AsyncMutex<Box<dyn CodecWrite>>,
    // inner lock, never held across an await
    state: Mutex<State>,
}

/// RPC client handle. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

/// An in-flight call. Resolves to the reply once the response arrives or the
/// connection shuts down. Dropping it before completion cancels the call:
/// the pending entry is removed and the eventual response is discarded.
pub struct Call<Res> {
    seq: u64,
    core: Weak<ClientCore>,
    rx: oneshot::Receiver<Result<Res, Error>>,
    finished: bool,
}

impl<Res> Future for Call<Res> {
    type Output = Result<Res, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.finished = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                this.finished = true;
                Poll::Ready(Err(Error::Shutdown))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<Res> Drop for Call<Res> {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(core) = self.core.upgrade() {
                core.remove_call(self.seq);
            }
        }
    }
}

impl<Res> Call<Res> {
    /// Cancels the call. Equivalent to dropping it.
    pub fn cancel(self) {}
}

impl Client {
    /// Connects over `network` ("tcp", or "unix" on unix platforms) with the
    /// transport connect bounded by `options.connect_timeout`.
    pub async fn dial(network: &str, addr: &str, options: Options) -> Result<Client, Error> {
        match network {
            "tcp" => {
                let stream =
                    connect_timeout(TcpStream::connect(addr), options.connect_timeout).await?;
                Self::with_stream(stream, options).await
            }
            #[cfg(unix)]
            "unix" => {
                let stream = connect_timeout(
                    tokio::net::UnixStream::connect(addr),
                    options.connect_timeout,
                )
                .await?;
                Self::with_stream(stream, options).await
            }
            other => Err(Error::Internal(format!(
                "rpc client: unsupported network {:?}",
                other
            ))),
        }
    }

    /// Connects to a server multiplexing RPC on an HTTP port: sends a
    /// `CONNECT` for the RPC path and proceeds with the normal handshake
    /// once the expected status line comes back.
    pub async fn dial_http(addr: &str, options: Options) -> Result<Client, Error> {
        let stream = connect_timeout(TcpStream::connect(addr), options.connect_timeout).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("CONNECT {} HTTP/1.0\r\n\r\n", DEFAULT_RPC_PATH).as_bytes())
            .await?;
        write_half.flush().await?;

        let mut status = String::new();
        reader.read_line(&mut status).await?;
        if status.trim_end() != CONNECTED {
            return Err(Error::Handshake(format!(
                "unexpected HTTP response: {:?}",
                status.trim_end()
            )));
        }
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
        }

        Self::with_split(reader, write_half, options).await
    }

    /// Dials an address of the form `protocol@addr`, e.g. `tcp@host:9999`,
    /// `http@host:7001` or `unix@/tmp/geerpc.sock`.
    pub async fn sdial(rpc_addr: &str, options: Options) -> Result<Client, Error> {
        let (protocol, addr) = rpc_addr.split_once('@').ok_or_else(|| {
            Error::Internal(format!(
                "rpc client: wrong address format {:?}, expect protocol@addr",
                rpc_addr
            ))
        })?;
        match protocol {
            "http" => Self::dial_http(addr, options).await,
            _ => Self::dial(protocol, addr, options).await,
        }
    }

    /// Performs the handshake on an already-connected stream.
    pub async fn with_stream<S>(stream: S, options: Options) -> Result<Client, Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::with_split(reader, writer, options).await
    }

    pub async fn with_split<R, W>(reader: R, mut writer: W, options: Options) -> Result<Client, Error>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut options = options;
        options.magic_number = MAGIC_NUMBER;

        let ctor = CodecSet::default()
            .get(&options.codec_type)
            .ok_or_else(|| {
                Error::Handshake(format!("invalid codec type {}", options.codec_type))
            })?;

        codec::write_options(&mut writer, &options).await?;
        let (codec_read, codec_write) = ctor(Box::new(reader), Box::new(writer));
        Ok(Self::with_codec(codec_read, codec_write))
    }

    /// Builds a client over pre-negotiated codec halves and spawns its
    /// reader task. The caller is responsible for having sent the option
    /// preamble if the peer expects one.
    pub fn with_codec(codec_read: Box<dyn CodecRead>, codec_write: Box<dyn CodecWrite>) -> Client {
        let (stop_tx, stop_rx) = oneshot::channel();
        let core = Arc::new(ClientCore {
            sending: AsyncMutex::new(codec_write),
            state: Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
                stop: Some(stop_tx),
            }),
        });

        // the reader holds only a weak handle so that dropping every Client
        // lets the connection wind down
        tokio::spawn(read_loop(Arc::downgrade(&core), codec_read, stop_rx));
        Client { core }
    }

    /// Submits a call and returns its completion handle.
    pub fn go<Req, Res>(&self, service_method: &str, args: Req) -> Call<Res>
    where
        Req: Serialize + Send + Sync + 'static,
        Res: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<Res, Error>>();
        let handler = reply_handler::<Res>(tx);

        match self.core.register_call(handler) {
            Ok(seq) => {
                let core = Arc::clone(&self.core);
                let service_method = service_method.to_string();
                tokio::spawn(async move {
                    core.write_call(seq, service_method, args).await;
                });
                Call {
                    seq,
                    core: Arc::downgrade(&self.core),
                    rx,
                    finished: false,
                }
            }
            Err((err, mut handler)) => {
                let _ = handler(Err(err));
                Call {
                    seq: 0,
                    core: Weak::new(),
                    rx,
                    finished: false,
                }
            }
        }
    }

    /// Submits a call and awaits its reply. To bound the wait, wrap the
    /// future in `tokio::time::timeout`; dropping it cancels the call.
    pub async fn call<Req, Res>(&self, service_method: &str, args: Req) -> Result<Res, Error>
    where
        Req: Serialize + Send + Sync + 'static,
        Res: DeserializeOwned + Send + 'static,
    {
        self.go(service_method, args).await
    }

    pub fn is_available(&self) -> bool {
        let state = lock(&self.core.state);
        !state.closing && !state.shutdown
    }

    /// Closes the connection. Outstanding calls complete with the shutdown
    /// error once the reader drains them. A second close reports the
    /// shutdown error.
    pub async fn close(&self) -> Result<(), Error> {
        let stop = {
            let mut state = lock(&self.core.state);
            if state.closing {
                return Err(Error::Shutdown);
            }
            state.closing = true;
            state.stop.take()
        };
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        self.core.sending.lock().await.close().await;
        Ok(())
    }
}

impl ClientCore {
    fn register_call(&self, handler: ReplyHandler) -> Result<u64, (Error, ReplyHandler)> {
        let mut state = lock(&self.state);
        if state.closing || state.shutdown {
            return Err((Error::Shutdown, handler));
        }
        let seq = state.seq;
        state.seq += 1;
        state.pending.insert(seq, handler);
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<ReplyHandler> {
        lock(&self.state).pending.remove(&seq)
    }

    async fn write_call<Req>(&self, seq: u64, service_method: String, args: Req)
    where
        Req: Serialize + Send + Sync,
    {
        let header = Header {
            service_method,
            seq,
            error: String::new(),
        };

        let mut writer = self.sending.lock().await;
        if let Err(err) = writer.write(&header, &args).await {
            drop(writer);
            // if the entry is gone the reader already handled a response for
            // this seq and the write error is dropped
            if let Some(mut handler) = self.remove_call(seq) {
                let _ = handler(Err(err));
            }
        }
    }

    /// Fails every pending call and marks the connection shut down. Holds
    /// the sending lock so no sender is mid-write while the map drains.
    async fn terminate_calls(&self, cause: Error) {
        let _writer = self.sending.lock().await;
        let drained = {
            let mut state = lock(&self.state);
            state.shutdown = true;
            std::mem::take(&mut state.pending)
        };
        for (_seq, mut handler) in drained {
            let _ = handler(Err(termination_error(&cause)));
        }
    }
}

async fn read_loop(
    core: Weak<ClientCore>,
    mut reader: Box<dyn CodecRead>,
    mut stop: oneshot::Receiver<()>,
) {
    let cause = loop {
        let header = tokio::select! {
            _ = &mut stop => break Error::Shutdown,
            header = reader.read_header() => header,
        };
        let header = match header {
            None => {
                break Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                ))
            }
            Some(Err(err)) => break err,
            Some(Ok(header)) => header,
        };

        let strong = match core.upgrade() {
            Some(core) => core,
            None => return,
        };

        let result = match strong.remove_call(header.seq) {
            // request write failed part-way, or the call was cancelled and
            // the server answered anyway
            None => reader.read_body(None).await,
            Some(mut handler) => {
                if !header.error.is_empty() {
                    let discard = reader.read_body(None).await;
                    let _ = handler(Err(Error::Service(header.error)));
                    discard
                } else {
                    let mut sink =
                        |de: &mut dyn erased::Deserializer<'static>| -> Result<(), Error> {
                            handler(Ok(de))
                        };
                    reader.read_body(Some(&mut sink)).await
                }
            }
        };
        drop(strong);

        if let Err(err) = result {
            break err;
        }
    };

    if let Some(core) = core.upgrade() {
        log::debug!("rpc client: reader exiting: {}", cause);
        core.terminate_calls(cause).await;
    }
}

fn reply_handler<Res>(tx: oneshot::Sender<Result<Res, Error>>) -> ReplyHandler
where
    Res: DeserializeOwned + Send + 'static,
{
    let mut tx = Some(tx);
    Box::new(move |outcome: Result<&mut dyn erased::Deserializer<'static>, Error>| {
        let tx = match tx.take() {
            Some(tx) => tx,
            None => return Ok(()),
        };
        match outcome {
            Ok(de) => match erased::deserialize::<Res>(de) {
                Ok(reply) => {
                    let _ = tx.send(Ok(reply));
                    Ok(())
                }
                Err(err) => {
                    // a body that fails to decode desyncs nothing (bodies are
                    // framed), but it still ends the connection
                    let _ = tx.send(Err(Error::Service(format!("reading body {}", err))));
                    Err(Error::Parse(Box::new(err)))
                }
            },
            Err(err) => {
                let _ = tx.send(Err(err));
                Ok(())
            }
        }
    })
}

async fn connect_timeout<T, F>(fut: F, limit: Duration) -> Result<T, Error>
where
    F: Future<Output = std::io::Result<T>>,
{
    if limit.is_zero() {
        return fut.await.map_err(Error::from);
    }
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::ConnectTimeout(limit)),
    }
}

fn termination_error(cause: &Error) -> Error {
    match cause {
        Error::Shutdown => Error::Shutdown,
        other => Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            other.to_string(),
        )),
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::bincode;

    fn duplex_client() -> (Client, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(near);
        let (cr, cw) = bincode::pair(r, w);
        (Client::with_codec(Box::new(cr), Box::new(cw)), far)
    }

    #[tokio::test]
    async fn bad_address_format() {
        match Client::sdial("no-at-sign", Options::default()).await {
            Err(Error::Internal(msg)) => assert!(msg.contains("wrong address format")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn calls_after_close_fail_fast() {
        let (client, _far) = duplex_client();
        assert!(client.is_available());

        client.close().await.unwrap();
        assert!(!client.is_available());

        let err = client.call::<_, i32>("Foo.Sum", 1i32).await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));

        // close is idempotent but reports the shutdown error
        assert!(matches!(client.close().await, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn server_eof_terminates_pending_calls() {
        let (client, far) = duplex_client();

        let call: Call<i32> = client.go("Foo.Sum", (1i32, 2i32));
        drop(far);

        let err = call.await.unwrap_err();
        assert!(matches!(err, Error::Io(_) | Error::Shutdown));

        // the reader notices the EOF and flips the connection to shutdown
        for _ in 0..50 {
            if !client.is_available() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!client.is_available());
    }
}
