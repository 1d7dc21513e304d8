//! `source`: pins every call made over the same downstream client connection
//! to the same backend, keyed on the connection's peer address rather than
//! any payload or header field. Used for protocols where the client opens
//! one long-lived stream and expects every call on it to land on the same
//! replica without advertising a key of its own.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::cluster::Cluster;
use crate::error::{ArouterError, Result};

use super::{Router, RouteDecision, RequestFrame};

pub struct SourceRouter {
    name: String,
    cluster: Arc<Cluster>,
    cursor: AtomicUsize,
    bindings: DashMap<String, String>,
}

impl SourceRouter {
    pub fn new(name: impl Into<String>, cluster: Arc<Cluster>) -> Self {
        SourceRouter { name: name.into(), cluster, cursor: AtomicUsize::new(0), bindings: DashMap::new() }
    }
}

impl Router for SourceRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    fn route(&self, frame: &mut RequestFrame) -> Result<RouteDecision> {
        if self.cluster.backends.is_empty() {
            return Err(ArouterError::Routing(format!("cluster {:?} has no backends", self.cluster.name)));
        }

        let Some(source) = frame.source.clone() else {
            return Err(ArouterError::Routing("source router requires a connection source identity".to_string()));
        };

        if let Some(bound) = self.bindings.get(&source) {
            if let Some(backend) = self.cluster.backend_by_name(bound.value()) {
                return Ok(RouteDecision { backend, association_key: Some(source) });
            }
        }

        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.cluster.backends.len();
        let backend = self.cluster.backends[idx].clone();
        self.bindings.entry(source.clone()).or_insert_with(|| backend.name.clone());
        Ok(RouteDecision { backend, association_key: Some(source) })
    }
}
