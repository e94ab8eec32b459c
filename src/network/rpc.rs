//! RPC dispatch
//!
//! Wire contract for one call: dial, write the identifier as one object, run
//! the handler-defined exchange, close. The server side reads the identifier,
//! looks it up in the [`RpcRegistry`] and hands the connection to the
//! registered [`RpcHandler`]. The dispatcher closes the connection whatever
//! the handler returns.

use crate::network::address::Address;
use crate::network::connection::{Conn, ConnConfig};
use crate::network::error::{GatewayError, GatewayResult};
use crate::network::message::{
    MAX_RPC_ID_LEN, MAX_VERSION_LEN, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, RPC_PING,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Server side of an RPC, shared by every connection that names it
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, conn: &mut Conn) -> GatewayResult<()>;
}

/// Client side of an RPC, run once on a freshly dialed connection
#[async_trait]
pub trait RpcCall: Send {
    async fn call(&mut self, conn: &mut Conn) -> GatewayResult<()>;
}

/// Reads exactly one object of at most `max_len` encoded bytes
#[derive(Debug)]
pub struct ReaderRpc<T> {
    max_len: usize,
    value: Option<T>,
}

impl<T> ReaderRpc<T> {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            value: None,
        }
    }

    /// The object read, if the call succeeded
    pub fn into_inner(self) -> Option<T> {
        self.value
    }
}

#[async_trait]
impl<T: DeserializeOwned + Send> RpcCall for ReaderRpc<T> {
    async fn call(&mut self, conn: &mut Conn) -> GatewayResult<()> {
        self.value = Some(conn.read_object(self.max_len).await?);
        Ok(())
    }
}

/// Writes exactly one object
#[derive(Debug)]
pub struct WriterRpc<'a, T: ?Sized> {
    value: &'a T,
}

impl<'a, T: ?Sized> WriterRpc<'a, T> {
    pub fn new(value: &'a T) -> Self {
        Self { value }
    }
}

#[async_trait]
impl<'a, T: Serialize + Sync + ?Sized> RpcCall for WriterRpc<'a, T> {
    async fn call(&mut self, conn: &mut Conn) -> GatewayResult<()> {
        conn.write_object(self.value).await
    }
}

/// Dial `addr`, name the RPC and run `rpc` on the connection
pub async fn call<C>(addr: &Address, id: &str, rpc: &mut C, config: &ConnConfig) -> GatewayResult<()>
where
    C: RpcCall + ?Sized,
{
    let mut conn = Conn::dial(addr, config).await?;
    log::debug!("Calling {} on {}", id, addr);

    let result = async {
        conn.write_object(id).await?;
        rpc.call(&mut conn).await
    }
    .await;

    conn.close().await;
    result
}

/// Ask `addr` for its protocol version and check that we can talk to it
pub async fn ping(addr: &Address, config: &ConnConfig) -> GatewayResult<u32> {
    let mut reader = ReaderRpc::<u32>::new(MAX_VERSION_LEN);
    call(addr, RPC_PING, &mut reader, config).await?;

    let version = reader
        .into_inner()
        .ok_or_else(|| GatewayError::Decode("empty ping reply".to_string()))?;
    if version < MIN_PROTOCOL_VERSION {
        return Err(GatewayError::IncompatiblePeer {
            addr: addr.clone(),
            version,
            min: MIN_PROTOCOL_VERSION,
        });
    }
    Ok(version)
}

/// Answers Ping with our protocol version
pub struct PingHandler;

#[async_trait]
impl RpcHandler for PingHandler {
    async fn handle(&self, conn: &mut Conn) -> GatewayResult<()> {
        conn.write_object(&PROTOCOL_VERSION).await
    }
}

/// Mapping from RPC identifier to handler.
///
/// Registering an identifier twice is an error and keeps the first handler.
#[derive(Default)]
pub struct RpcRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: &str, handler: Arc<dyn RpcHandler>) -> GatewayResult<()> {
        if serde_json::to_vec(id).map_or(true, |encoded| encoded.len() > MAX_RPC_ID_LEN) {
            return Err(GatewayError::ObjectTooLarge {
                len: id.len(),
                max: MAX_RPC_ID_LEN,
            });
        }

        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(id) {
            return Err(GatewayError::DuplicateRpc(id.to_string()));
        }
        handlers.insert(id.to_string(), handler);
        log::debug!("Registered RPC {}", id);
        Ok(())
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.handlers.read().await.contains_key(id)
    }

    /// Serve one inbound connection and close it
    pub async fn dispatch(&self, mut conn: Conn) -> GatewayResult<()> {
        let result = self.dispatch_inner(&mut conn).await;
        conn.close().await;
        result
    }

    async fn dispatch_inner(&self, conn: &mut Conn) -> GatewayResult<()> {
        let id: String = conn.read_object(MAX_RPC_ID_LEN).await?;

        // Clone the handler out so the table is not locked while it runs
        let handler = self
            .handlers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownRpc(id.clone()))?;

        log::debug!("Handling {} from {}", id, conn.remote_address());
        handler.handle(conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::{spawn_listener, test_conn_config};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts invocations and echoes one string back
    struct EchoHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle(&self, conn: &mut Conn) -> GatewayResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text: String = conn.read_object(256).await?;
            conn.write_object(&text).await
        }
    }

    /// Writes a string then reads the echo
    struct EchoCall {
        reply: Option<String>,
    }

    #[async_trait]
    impl RpcCall for EchoCall {
        async fn call(&mut self, conn: &mut Conn) -> GatewayResult<()> {
            conn.write_object("ping me").await?;
            self.reply = Some(conn.read_object(256).await?);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = RpcRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry
            .register("Echo", Arc::new(EchoHandler { calls: first.clone() }))
            .await
            .unwrap();
        let err = registry
            .register("Echo", Arc::new(EchoHandler { calls: second.clone() }))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateRpc(ref id) if id == "Echo"));

        // The first handler is still the one being served
        let registry = Arc::new(registry);
        let addr = spawn_listener(registry).await;
        let mut echo = EchoCall { reply: None };
        call(&addr, "Echo", &mut echo, &test_conn_config()).await.unwrap();

        assert_eq!(echo.reply.as_deref(), Some("ping me"));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_overlong_identifier_rejected() {
        let registry = RpcRegistry::new();
        let long = "x".repeat(MAX_RPC_ID_LEN + 1);
        assert!(registry.register(&long, Arc::new(PingHandler)).await.is_err());
        assert!(!registry.is_registered(&long).await);
    }

    #[tokio::test]
    async fn test_unknown_rpc_invokes_nothing_and_closes() {
        let registry = RpcRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register("Echo", Arc::new(EchoHandler { calls: calls.clone() }))
            .await
            .unwrap();
        let addr = spawn_listener(Arc::new(registry)).await;

        // The server closes without answering, so the read hits EOF
        let mut reader = ReaderRpc::<String>::new(256);
        let err = call(&addr, "Missing", &mut reader, &test_conn_config())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Io(_)));
        assert!(reader.into_inner().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_reports_unknown_rpc() {
        let registry = Arc::new(RpcRegistry::new());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = Address::from(listener.local_addr().unwrap());

        let client = tokio::spawn(async move {
            let mut conn = Conn::dial(&addr, &test_conn_config()).await.unwrap();
            conn.write_object("Nope").await.unwrap();
            conn
        });

        let (stream, remote) = listener.accept().await.unwrap();
        let conn = Conn::new(stream, Address::from(remote), test_conn_config().io_timeout);
        let err = registry.dispatch(conn).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownRpc(ref id) if id == "Nope"));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_and_writer_rpc() {
        let registry = RpcRegistry::new();
        registry.register(RPC_PING, Arc::new(PingHandler)).await.unwrap();
        let addr = spawn_listener(Arc::new(registry)).await;

        assert_eq!(ping(&addr, &test_conn_config()).await.unwrap(), PROTOCOL_VERSION);

        // A writer RPC completes as soon as its single object is written
        let mut writer = WriterRpc::new("unused");
        call(&addr, RPC_PING, &mut writer, &test_conn_config())
            .await
            .unwrap();
    }
}
