use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;

/// Abstraction of the sending side of a UDP socket, for testability.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: 'static + Send + Sync {
    async fn send_datagram(&self, to: SocketAddr, data: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        self.send_to(data, to).await?;
        Ok(())
    }
}
