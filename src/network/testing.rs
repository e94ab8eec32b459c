//! Helpers for multi-node tests on the loopback interface

use crate::core::{ConsensusSet, MemoryChain};
use crate::network::address::Address;
use crate::network::connection::{Conn, ConnConfig};
use crate::network::node::{Gateway, GatewayConfig};
use crate::network::rpc::RpcRegistry;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub fn test_conn_config() -> ConnConfig {
    ConnConfig {
        dial_timeout: Duration::from_secs(2),
        io_timeout: Duration::from_secs(5),
    }
}

/// Ephemeral port, and no maintenance ticks during a test
pub fn test_gateway_config() -> GatewayConfig {
    GatewayConfig {
        port: 0,
        gossip_interval: Duration::from_secs(3600),
        conn: test_conn_config(),
        ..Default::default()
    }
}

/// Serve `registry` on a fresh loopback port
pub async fn spawn_listener(registry: Arc<RpcRegistry>) -> Address {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = Address::from(listener.local_addr().unwrap());

    tokio::spawn(async move {
        while let Ok((stream, remote)) = listener.accept().await {
            let registry = registry.clone();
            let conn = Conn::new(stream, Address::from(remote), test_conn_config().io_timeout);
            tokio::spawn(async move {
                let _ = registry.dispatch(conn).await;
            });
        }
    });
    addr
}

pub async fn spawn_gateway() -> Gateway {
    spawn_gateway_with(Arc::new(MemoryChain::new())).await
}

pub async fn spawn_gateway_with(consensus: Arc<dyn ConsensusSet>) -> Gateway {
    spawn_gateway_configured(test_gateway_config(), consensus).await
}

pub async fn spawn_gateway_configured(
    config: GatewayConfig,
    consensus: Arc<dyn ConsensusSet>,
) -> Gateway {
    let gateway = Gateway::bind(config, consensus).await.unwrap();
    gateway.serve();
    gateway
}

/// Connected (client, server) pair over loopback
pub async fn conn_pair(config: ConnConfig) -> (Conn, Conn) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = Address::from(listener.local_addr().unwrap());
    let (client, accepted) = tokio::join!(Conn::dial(&addr, &config), listener.accept());
    let (stream, remote) = accepted.unwrap();
    (
        client.unwrap(),
        Conn::new(stream, Address::from(remote), config.io_timeout),
    )
}

/// An address nothing listens on
pub async fn unused_address() -> Address {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    Address::from(listener.local_addr().unwrap())
}

/// Poll `check` until it holds or five seconds pass
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
