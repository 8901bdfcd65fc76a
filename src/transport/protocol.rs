//! Wire format for the pose consumer link: bincode-encoded messages in
//! length-delimited frames.

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{error::TransportError, types::Landmark};

pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Client → server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Keypoints {
        timestamp_us: u64,
        landmarks: Vec<Landmark>,
    },
    Frame {
        timestamp_us: u64,
        width: u32,
        height: u32,
        jpeg_data: Vec<u8>,
    },
}

/// Server → client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ServerMessage {
    FrameResult {
        classification: Option<bool>,
        timestamp_ns: u64,
        processing_time_s: f64,
    },
    Error {
        message: String,
    },
}

pub type MessageStream<T> = Framed<T, LengthDelimitedCodec>;

pub fn message_stream<T: AsyncRead + AsyncWrite>(stream: T) -> MessageStream<T> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(stream, codec)
}

/// Send a serializable message (bincode + length prefix).
pub async fn send_message<S, M>(sink: &mut S, msg: &M) -> Result<(), TransportError>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
    M: Serialize,
{
    let data = bincode::serialize(msg)?;
    sink.send(Bytes::from(data)).await?;
    Ok(())
}

/// Receive and deserialize a message. `Ok(None)` once the peer has closed.
pub async fn recv_message<S, M>(stream: &mut S) -> Result<Option<M>, TransportError>
where
    S: Stream<Item = std::io::Result<BytesMut>> + Unpin,
    M: DeserializeOwned,
{
    match stream.next().await {
        Some(Ok(bytes)) => Ok(Some(bincode::deserialize(&bytes)?)),
        Some(Err(err)) => Err(err.into()),
        None => Ok(None),
    }
}
