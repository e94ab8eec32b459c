//! Framed object connections
//!
//! Every RPC is built from two primitives: read one object and write one
//! object. Objects travel as `MAGIC | u32 length | JSON payload`. Readers pass
//! a maximum length and the codec refuses a frame as soon as its header
//! announces more, before any of the body is buffered.

use crate::network::address::Address;
use crate::network::error::{GatewayError, GatewayResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Magic bytes for object framing
pub const MAGIC: [u8; 4] = *b"GATE";

/// Magic (4) + length (4)
const HEADER_LEN: usize = 8;

/// Deadlines applied to every connection
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// Bound on establishing a TCP connection
    pub dial_timeout: Duration,
    /// Bound on each single object read or write
    pub io_timeout: Duration,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(30),
        }
    }
}

/// Length-prefixed frame codec with an adjustable size limit
#[derive(Debug)]
pub struct ObjectCodec {
    max_len: usize,
}

impl ObjectCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len;
    }
}

impl Encoder<Bytes> for ObjectCodec {
    type Error = GatewayError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = u32::try_from(item.len()).map_err(|_| GatewayError::ObjectTooLarge {
            len: item.len(),
            max: u32::MAX as usize,
        })?;

        dst.reserve(HEADER_LEN + item.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(len);
        dst.put_slice(&item);

        Ok(())
    }
}

impl Decoder for ObjectCodec {
    type Item = BytesMut;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(GatewayError::Decode("invalid magic bytes".to_string()));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > self.max_len {
            return Err(GatewayError::ObjectTooLarge {
                len,
                max: self.max_len,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len)))
    }
}

/// A framed connection to a remote node
pub struct Conn {
    framed: Framed<TcpStream, ObjectCodec>,
    remote: Address,
    io_timeout: Duration,
    closed: bool,
}

impl Conn {
    /// Wrap an established stream
    pub fn new(stream: TcpStream, remote: Address, io_timeout: Duration) -> Self {
        Self {
            framed: Framed::new(stream, ObjectCodec::new(0)),
            remote,
            io_timeout,
            closed: false,
        }
    }

    /// Open a connection to `addr` within the dial deadline
    pub async fn dial(addr: &Address, config: &ConnConfig) -> GatewayResult<Self> {
        let connect_failed = |reason: String| GatewayError::ConnectFailed {
            addr: addr.clone(),
            reason,
        };

        let stream = timeout(config.dial_timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| connect_failed("dial timed out".to_string()))?
            .map_err(|e| connect_failed(e.to_string()))?;
        stream.set_nodelay(true)?;

        Ok(Self::new(stream, addr.clone(), config.io_timeout))
    }

    /// Transport address of the other end
    pub fn remote_address(&self) -> &Address {
        &self.remote
    }

    /// Read and decode one object no larger than `max_len` encoded bytes
    pub async fn read_object<T: DeserializeOwned>(&mut self, max_len: usize) -> GatewayResult<T> {
        self.framed.codec_mut().set_max_len(max_len);

        let frame = match timeout(self.io_timeout, self.framed.next()).await {
            Err(_) => return Err(GatewayError::Timeout("reading an object")),
            Ok(None) => {
                return Err(GatewayError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )))
            }
            Ok(Some(frame)) => frame?,
        };

        serde_json::from_slice(&frame).map_err(|e| GatewayError::Decode(e.to_string()))
    }

    /// Encode and write one object
    pub async fn write_object<T: Serialize + ?Sized>(&mut self, obj: &T) -> GatewayResult<()> {
        let data = serde_json::to_vec(obj).map_err(|e| GatewayError::Decode(e.to_string()))?;

        timeout(self.io_timeout, self.framed.send(Bytes::from(data)))
            .await
            .map_err(|_| GatewayError::Timeout("writing an object"))?
    }

    /// Shut the connection down; calling it again does nothing
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = timeout(self.io_timeout, self.framed.get_mut().shutdown()).await {
            log::debug!("Closing connection to {} timed out: {}", self.remote, e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::conn_pair;
    use serde::Deserialize;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        text: String,
    }

    #[test]
    fn test_codec_rejects_oversized_header() {
        let mut codec = ObjectCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32(1_000_000);

        // Only the header is present; the limit is enforced anyway
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, GatewayError::ObjectTooLarge { len: 1_000_000, max: 16 }));
    }

    #[test]
    fn test_codec_rejects_bad_magic() {
        let mut codec = ObjectCodec::new(16);
        let mut buf = BytesMut::from(&b"NOPE\x00\x00\x00\x01x"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(GatewayError::Decode(_))));
    }

    #[test]
    fn test_codec_waits_for_full_frame() {
        let mut codec = ObjectCodec::new(16);
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"\"hi\""), &mut buf).unwrap();

        let mut partial = buf.split_to(HEADER_LEN + 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert_eq!(&codec.decode(&mut partial).unwrap().unwrap()[..], b"\"hi\"");
    }

    #[tokio::test]
    async fn test_write_then_read_object() {
        let (mut client, mut server) = conn_pair(ConnConfig::default()).await;
        let greeting = Greeting {
            text: "hello".to_string(),
        };

        client.write_object(&greeting).await.unwrap();
        let received: Greeting = server.read_object(1024).await.unwrap();
        assert_eq!(received, greeting);
        assert_eq!(server.remote_address().host(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_read_over_limit_fails() {
        let (mut client, mut server) = conn_pair(ConnConfig::default()).await;
        client.write_object(&"x".repeat(4096)).await.unwrap();

        let err = server.read_object::<String>(100).await.unwrap_err();
        assert!(matches!(err, GatewayError::ObjectTooLarge { max: 100, .. }));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_decode_error() {
        let (mut client, mut server) = conn_pair(ConnConfig::default()).await;
        client.write_object(&42u32).await.unwrap();

        let err = server.read_object::<Greeting>(1024).await.unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let config = ConnConfig {
            dial_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_millis(100),
        };
        let (_client, mut server) = conn_pair(config).await;

        let err = server.read_object::<String>(1024).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut client, mut server) = conn_pair(ConnConfig::default()).await;
        client.close().await;
        client.close().await;
        assert!(client.is_closed());

        let mut rest = Vec::new();
        server.framed.get_mut().read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = Address::from(listener.local_addr().unwrap());
        drop(listener);

        let err = Conn::dial(&addr, &ConnConfig::default()).await.err().unwrap();
        assert!(matches!(err, GatewayError::ConnectFailed { .. }));
    }
}
