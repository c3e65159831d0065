use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::connection::Connection;

/// Application callbacks of one connection. Implementations must not block: they are
///  called from the connection's receive path.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: 'static + Send + Sync {
    /// A complete application message arrived, reassembled and in delivery order for its
    ///  reliability mode.
    async fn on_message(&self, from: SocketAddr, data: &[u8]);

    /// The connection was torn down, by either side or by keepalive timeout. Called at
    ///  most once per connection.
    async fn on_disconnect(&self, peer: SocketAddr);
}

/// Server-side callback for newly established connections. The handle can be kept to
///  send messages to that peer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionEventHandler: 'static + Send + Sync {
    async fn on_new_connection(&self, connection: Arc<Connection>);
}
