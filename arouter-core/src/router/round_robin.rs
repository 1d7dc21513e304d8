//! `round_robin`: every call rotates to the next backend in the cluster, no
//! affinity. The simplest strategy and the default for stateless reads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cluster::Cluster;
use crate::error::{ArouterError, Result};

use super::{Router, RouteDecision, RequestFrame};

pub struct RoundRobinRouter {
    name: String,
    cluster: Arc<Cluster>,
    cursor: AtomicUsize,
}

impl RoundRobinRouter {
    pub fn new(name: impl Into<String>, cluster: Arc<Cluster>) -> Self {
        RoundRobinRouter { name: name.into(), cluster, cursor: AtomicUsize::new(0) }
    }
}

impl Router for RoundRobinRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    fn route(&self, _frame: &mut RequestFrame) -> Result<RouteDecision> {
        if self.cluster.backends.is_empty() {
            return Err(ArouterError::Routing(format!("cluster {:?} has no backends", self.cluster.name)));
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.cluster.backends.len();
        Ok(RouteDecision { backend: self.cluster.backends[idx].clone(), association_key: None })
    }
}
