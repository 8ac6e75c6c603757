//! Codecs frame an ordered sequence of `(Header, Body)` pairs over one byte
//! stream. Reads and writes are split so that a connection's single reader
//! task owns the read half while response writes are serialized behind a
//! mutex over the write half.

use std::collections::HashMap;

use async_trait::async_trait;
use erased_serde as erased;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::message::{Header, Options, BINCODE_CODEC, JSON_CODEC};
use crate::transport::frame::{FrameRead, FrameWrite};

pub mod bincode;
pub mod json;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Consumes one decoded body. Invoked at most once per `read_body` call with
/// a deserializer positioned over the body payload.
pub type BodySink<'a> =
    &'a mut (dyn FnMut(&mut dyn erased::Deserializer<'static>) -> Result<(), Error> + Send);

/// Read half of a codec. Only ever driven by one reader task.
#[async_trait]
pub trait CodecRead: Send {
    /// Returns `None` on a clean EOF at a message boundary.
    async fn read_header(&mut self) -> Option<Result<Header, Error>>;

    /// Reads exactly one body. A `None` sink discards the payload; a `Some`
    /// sink decodes it and its result is propagated.
    async fn read_body(&mut self, sink: Option<BodySink<'_>>) -> Result<(), Error>;
}

/// Write half of a codec. Callers serialize access externally; the writer
/// flushes before returning and shuts the stream down on any write error.
#[async_trait]
pub trait CodecWrite: Send {
    async fn write(
        &mut self,
        header: &Header,
        body: &(dyn erased::Serialize + Send + Sync),
    ) -> Result<(), Error>;

    async fn close(&mut self);
}

pub type CodecCtor = fn(BoxReader, BoxWriter) -> (Box<dyn CodecRead>, Box<dyn CodecWrite>);

/// Registered codec constructors, keyed by codec identifier.
///
/// There is no process-global codec map; a `Server` owns one of these and
/// clients resolve against `CodecSet::default()` unless handed a pre-built
/// codec.
pub struct CodecSet {
    ctors: HashMap<String, CodecCtor>,
}

impl Default for CodecSet {
    fn default() -> Self {
        let mut set = CodecSet {
            ctors: HashMap::new(),
        };
        set.register(BINCODE_CODEC, bincode::boxed);
        set.register(JSON_CODEC, json::boxed);
        set
    }
}

impl CodecSet {
    /// Registers a constructor under `codec_type`, replacing any previous one.
    pub fn register(&mut self, codec_type: &str, ctor: CodecCtor) {
        self.ctors.insert(codec_type.to_string(), ctor);
    }

    pub fn get(&self, codec_type: &str) -> Option<CodecCtor> {
        self.ctors.get(codec_type).copied()
    }
}

/// Writes the option preamble as one length-delimited JSON frame.
pub(crate) async fn write_options<W>(writer: &mut W, options: &Options) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + Send,
{
    let payload = serde_json::to_vec(options)?;
    writer.write_frame(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the option preamble. Any failure here is a handshake error.
pub(crate) async fn read_options<R>(reader: &mut R) -> Result<Options, Error>
where
    R: AsyncRead + Unpin + Send,
{
    match reader.read_frame().await {
        None => Err(Error::Handshake(
            "connection closed before option preamble".into(),
        )),
        Some(Err(err)) => Err(err),
        Some(Ok(payload)) => serde_json::from_slice(&payload)
            .map_err(|err| Error::Handshake(format!("malformed option preamble: {}", err))),
    }
}
