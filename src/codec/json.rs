//! JSON codec, mostly useful for debugging with a text protocol.

use std::io::Cursor;

use async_trait::async_trait;
use erased_serde as erased;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use super::{BodySink, BoxReader, BoxWriter, CodecRead, CodecWrite};
use crate::error::Error;
use crate::message::Header;
use crate::transport::frame::{FrameRead, FrameWrite};

pub struct JsonRead<R> {
    reader: R,
}

pub struct JsonWrite<W> {
    writer: W,
}

/// Buffered read/write codec halves over a split stream.
pub fn pair<R, W>(reader: R, writer: W) -> (JsonRead<BufReader<R>>, JsonWrite<BufWriter<W>>)
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    (
        JsonRead {
            reader: BufReader::new(reader),
        },
        JsonWrite {
            writer: BufWriter::new(writer),
        },
    )
}

pub(crate) fn boxed(
    reader: BoxReader,
    writer: BoxWriter,
) -> (Box<dyn CodecRead>, Box<dyn CodecWrite>) {
    let (r, w) = pair(reader, writer);
    (Box::new(r), Box::new(w))
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> CodecRead for JsonRead<R> {
    async fn read_header(&mut self) -> Option<Result<Header, Error>> {
        let payload = match self.reader.read_frame().await? {
            Ok(payload) => payload,
            Err(err) => return Some(Err(err)),
        };
        Some(serde_json::from_slice(&payload).map_err(Error::from))
    }

    async fn read_body(&mut self, sink: Option<BodySink<'_>>) -> Result<(), Error> {
        let payload = match self.reader.read_frame().await {
            None => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before body",
                )))
            }
            Some(Err(err)) => return Err(err),
            Some(Ok(payload)) => payload,
        };

        match sink {
            None => Ok(()),
            Some(sink) => {
                let mut de = serde_json::Deserializer::from_reader(Cursor::new(payload));
                let mut de = <dyn erased::Deserializer>::erase(&mut de);
                sink(&mut de)
            }
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> CodecWrite for JsonWrite<W> {
    async fn write(
        &mut self,
        header: &Header,
        body: &(dyn erased::Serialize + Send + Sync),
    ) -> Result<(), Error> {
        let result = async {
            self.writer.write_frame(&serde_json::to_vec(header)?).await?;
            self.writer.write_frame(&serde_json::to_vec(body)?).await?;
            self.writer.flush().await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn close(&mut self) {
        if let Err(err) = self.writer.shutdown().await {
            log::debug!("rpc codec: error shutting down stream: {}", err);
        }
    }
}
