use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Marks the option preamble of a geerpc connection.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Codec identifier of the default self-describing binary codec.
pub const BINCODE_CODEC: &str = "application/bincode";
/// Codec identifier of the JSON codec.
pub const JSON_CODEC: &str = "application/json";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request and response header. `seq` is assigned by the client and echoed
/// verbatim by the server; `error` is non-empty iff the server reports a
/// call-level failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub service_method: String,
    pub seq: u64,
    pub error: String,
}

/// Connection preamble negotiating the codec and timeouts.
///
/// Always encoded as one length-delimited JSON frame, independent of
/// `codec_type`; exactly one precedes all header/body pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub magic_number: u32,
    pub codec_type: String,
    pub connect_timeout: Duration,
    /// Zero means no limit on handler execution.
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            magic_number: MAGIC_NUMBER,
            codec_type: BINCODE_CODEC.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    pub fn with_codec(codec_type: impl Into<String>) -> Self {
        Options {
            codec_type: codec_type.into(),
            ..Options::default()
        }
    }
}
