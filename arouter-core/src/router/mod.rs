//! Routing strategies (C7): given a request frame, pick a backend (and
//! optionally a specific connection on it) within a named backend cluster.
//!
//! Each strategy owns the `Arc<Cluster>` it routes against and, where
//! affinity applies, a `DashMap` from affinity key to backend name. The map
//! is first-writer-wins: once a key is bound, later calls with the same key
//! are pinned to the same backend even if the extraction would otherwise
//! select a different one.

use std::sync::Arc;

use bytes::Bytes;
use tonic::metadata::MetadataMap;

use crate::backend::Backend;
use crate::cluster::Cluster;
use crate::error::{ArouterError, Result};
use crate::method::MethodDetails;

pub mod affinity_header;
pub mod affinity_message;
pub mod binding;
pub mod round_robin;
pub mod source;

pub use affinity_header::AffinityHeaderRouter;
pub use affinity_message::AffinityMessageRouter;
pub use binding::BindingRouter;
pub use round_robin::RoundRobinRouter;
pub use source::SourceRouter;

/// One gRPC frame carrier (request direction), decoded from the wire by
/// `ServerCodec` and handed to the router before being forwarded upstream
/// unmodified.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub method: MethodDetails,
    pub payload: Bytes,
    pub metadata: MetadataMap,
    /// A stable identifier for the downstream client connection (its peer
    /// address), used by the `source` router to pin every call from one
    /// client connection to the same backend without any payload or header
    /// inspection.
    pub source: Option<String>,
    /// Set by a router (the binding router, specifically) when the response
    /// must carry a header back to the client — tonic's low-level streaming
    /// API only allows setting leading metadata on the `Response` itself,
    /// so the forwarder reads this after routing and before returning.
    pub pending_header: Option<(String, String)>,
}

impl RequestFrame {
    pub fn new(method: MethodDetails, payload: Bytes, metadata: MetadataMap) -> Self {
        RequestFrame { method, payload, metadata, source: None, pending_header: None }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// One gRPC frame carrier (response direction), decoded from the wire by
/// `ClientCodec` and handed to `Router::reply_handler` for affinity learned
/// from a response payload, before being forwarded downstream unmodified.
#[derive(Debug, Clone, Default)]
pub struct ResponseFrame {
    pub payload: Bytes,
}

/// The outcome of `Router::route`: a backend, and optionally a connection
/// pinned within it (affinity routers whose key is already bound skip the
/// backend's own round-robin and ask for a specific connection directly).
#[derive(Clone)]
pub struct RouteDecision {
    pub backend: Arc<Backend>,
    pub association_key: Option<String>,
}

/// A routing strategy bound to one backend cluster for one router's set of
/// methods. Implementations are the Rust shape of the original's
/// `round_robin.go`/`source.go`/`rpc_affinity_message-router.go`/
/// `rpc_affinity_header-router.go`/`binding-router.go`.
pub trait Router: Send + Sync {
    fn name(&self) -> &str;
    fn cluster(&self) -> &Arc<Cluster>;

    /// Choose a backend (and possibly pin a connection) for this request,
    /// mutating `frame.pending_header` if the strategy needs to hand a key
    /// back to the client.
    fn route(&self, frame: &mut RequestFrame) -> Result<RouteDecision>;

    /// Learn affinity from a response payload, for routers whose key lives
    /// in the *response* rather than the request (spec §7, §9 Open
    /// Question: failures here are logged and counted, never fatal).
    fn reply_handler(&self, _decision: &RouteDecision, _frame: &ResponseFrame) -> Result<()> {
        Ok(())
    }

    /// Explicitly install `key -> backend_name` in this router's own
    /// affinity map, overwriting whatever the key was previously bound to
    /// (the control API's `SetAffinity`, invariant 2). Strategies that
    /// don't keep a key-to-backend map of their own (round-robin, source,
    /// binding) have nothing to override and reject the call.
    fn set_affinity(&self, _key: &str, _backend_name: &str) -> Result<()> {
        Err(ArouterError::Routing(format!("router {:?} does not support explicit affinity overrides", self.name())))
    }
}

#[cfg(test)]
pub(crate) fn test_cluster(name: &str, backend_names: &[&str]) -> Arc<Cluster> {
    use crate::config::{Association, BackendClusterConfig, BackendConfig, BackendType, ConnectionConfig};

    let backends = backend_names
        .iter()
        .map(|n| BackendConfig {
            name: n.to_string(),
            kind: BackendType::Server,
            association: Association::default(),
            connections: vec![ConnectionConfig {
                name: format!("{n}01"),
                addr: "127.0.0.1".to_string(),
                port: "50001".to_string(),
            }],
        })
        .collect();

    Cluster::new(&BackendClusterConfig { name: name.to_string(), backends }).unwrap()
}
