//! TCP listener binding and sharing.
//!
//! # Responsibilities
//! - Resolve and bind the configured address
//! - Hand a second accept handle on the same socket to a replacement
//!   instance, so a reload that keeps the address never closes the port
//!
//! # Design Decisions
//! - `SO_REUSEADDR` is set so a restart can rebind a port in `TIME_WAIT`
//! - A shared handle is a duplicated descriptor: both instances accept from
//!   one kernel queue, and queued connections survive the old one closing

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};

const BACKLOG: u32 = 1024;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to resolve {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no socket address found for {0}")]
    NoAddress(String),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to duplicate listener on {address}: {source}")]
    Share {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// A bound, listening socket.
#[derive(Debug)]
pub struct BoundListener {
    /// Address as configured, before resolution.
    requested: String,
    local_addr: SocketAddr,
    socket: std::net::TcpListener,
}

impl BoundListener {
    /// Resolve `address` and start listening on it.
    ///
    /// Connections are queued by the kernel from the moment this returns,
    /// even before anything accepts them.
    pub async fn bind(address: &str) -> Result<Self, ListenerError> {
        let addr = tokio::net::lookup_host(address)
            .await
            .map_err(|source| ListenerError::Resolve { address: address.to_string(), source })?
            .next()
            .ok_or_else(|| ListenerError::NoAddress(address.to_string()))?;

        let bind_err = |source| ListenerError::Bind { address: addr, source };
        let socket = (if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }).map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(BACKLOG).map_err(bind_err)?;

        let local_addr = listener.local_addr().map_err(bind_err)?;
        let socket = listener.into_std().map_err(bind_err)?;

        tracing::info!(requested = %address, address = %local_addr, "Listener bound");

        Ok(Self {
            requested: address.to_string(),
            local_addr,
            socket,
        })
    }

    /// A second handle accepting from the same socket.
    pub fn share(&self) -> Result<Self, ListenerError> {
        let socket = self.socket.try_clone().map_err(|source| ListenerError::Share {
            address: self.local_addr,
            source,
        })?;
        tracing::debug!(address = %self.local_addr, "Listener shared");
        Ok(Self {
            requested: self.requested.clone(),
            local_addr: self.local_addr,
            socket,
        })
    }

    /// Tokio listener for an accept loop. The bound socket stays open for
    /// as long as either handle lives.
    pub fn accept_handle(&self) -> Result<TcpListener, ListenerError> {
        let share_err = |source| ListenerError::Share { address: self.local_addr, source };
        let socket = self.socket.try_clone().map_err(share_err)?;
        socket.set_nonblocking(true).map_err(share_err)?;
        TcpListener::from_std(socket).map_err(share_err)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn requested(&self) -> &str {
        &self.requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = BoundListener::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert_eq!(listener.requested(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_shared_handle_outlives_original() {
        let first = BoundListener::bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr();
        let second = first.share().unwrap();
        drop(first);

        let accept = second.accept_handle().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_server, peer) = accept.accept().await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_port_in_use_is_a_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let err = BoundListener::bind(&addr).await.unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_unresolvable_address() {
        assert!(BoundListener::bind("no-port-here").await.is_err());
    }
}
