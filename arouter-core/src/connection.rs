//! A single upstream gRPC connection (C3): lazy `tonic::transport::Channel`,
//! lifecycle state, and the reconnect triggered by the control API's
//! `SetConnection`.

use std::sync::Arc;

use tokio::sync::watch;
use tonic::transport::{Channel, Endpoint};

use crate::error::{ArouterError, Result};

/// Connectivity states a `Connection` can report. `tonic::transport::Channel`
/// does not expose a connectivity stream the way grpc-go's channel does, so
/// this tracks the outcome of the most recent connect attempt and the most
/// recent RPC on the channel instead of a true transport-level signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

pub struct Connection {
    pub name: String,
    addr: parking_lot::Mutex<String>,
    channel: parking_lot::Mutex<Option<Channel>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl Connection {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        Arc::new(Connection {
            name: name.into(),
            addr: parking_lot::Mutex::new(addr.into()),
            channel: parking_lot::Mutex::new(None),
            state_tx,
            state_rx,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    /// Build (or rebuild) the channel for the current address, lazily — the
    /// first RPC attempt drives the actual TCP/TLS handshake.
    pub async fn connect(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        let addr = self.addr.lock().clone();

        let endpoint = Endpoint::from_shared(addr.clone())
            .map_err(|e| ArouterError::Config(format!("invalid connection address {addr:?}: {e}")))?;
        let channel = endpoint.connect_lazy();

        *self.channel.lock() = Some(channel);
        self.set_state(ConnectionState::Ready);
        Ok(())
    }

    pub fn channel(&self) -> Option<Channel> {
        self.channel.lock().clone()
    }

    /// Called by the forwarder's pump tasks when an RPC on this channel
    /// fails at the transport level.
    pub fn report_transport_error(&self) {
        self.set_state(ConnectionState::TransientFailure);
    }

    /// Called on the next successful RPC after a `TransientFailure`.
    pub fn report_success(&self) {
        if self.state() == ConnectionState::TransientFailure {
            self.set_state(ConnectionState::Ready);
        }
    }

    /// Swap the target address and reconnect — the `SetConnection` control
    /// RPC's effect on a specific backend connection.
    pub async fn set_address(&self, addr: impl Into<String>) -> Result<()> {
        *self.addr.lock() = addr.into();
        self.connect().await
    }

    pub fn shutdown(&self) {
        *self.channel.lock() = None;
        self.set_state(ConnectionState::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_starts_in_new_state() {
        let conn = Connection::new("ro_vcore01", "http://127.0.0.1:50001");
        assert_eq!(conn.state(), ConnectionState::New);
    }

    #[tokio::test]
    async fn connect_transitions_to_ready() {
        let conn = Connection::new("ro_vcore01", "http://127.0.0.1:50001");
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert!(conn.channel().is_some());
    }

    #[test]
    fn invalid_address_is_rejected() {
        let conn = Connection::new("ro_vcore01", "not a uri\0");
        let result = tokio_test_block_on(conn.connect());
        assert!(result.is_err());
    }

    fn tokio_test_block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[tokio::test]
    async fn transport_error_then_success_round_trips_state() {
        let conn = Connection::new("ro_vcore01", "http://127.0.0.1:50001");
        conn.connect().await.unwrap();
        conn.report_transport_error();
        assert_eq!(conn.state(), ConnectionState::TransientFailure);
        conn.report_success();
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn shutdown_clears_channel() {
        let conn = Connection::new("ro_vcore01", "http://127.0.0.1:50001");
        conn.connect().await.unwrap();
        conn.shutdown();
        assert_eq!(conn.state(), ConnectionState::Shutdown);
        assert!(conn.channel().is_none());
    }

    #[tokio::test]
    async fn set_address_reconnects() {
        let conn = Connection::new("ro_vcore01", "http://127.0.0.1:50001");
        conn.connect().await.unwrap();
        conn.set_address("http://127.0.0.1:50002").await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(*conn.addr.lock(), "http://127.0.0.1:50002");
    }
}
