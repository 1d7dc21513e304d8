//! `rpc_affinity_message`: affinity key is a named field extracted from the
//! request payload itself (e.g. a device serial number embedded in every
//! call for that device), so no header convention is required of clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use prost_reflect::{DescriptorPool, MessageDescriptor};

use crate::cluster::Cluster;
use crate::error::{ArouterError, Result};
use crate::field_extract::{extract_field, MethodSchema};

use super::{Router, RouteDecision, RequestFrame};

pub struct AffinityMessageRouter {
    name: String,
    cluster: Arc<Cluster>,
    route_field: String,
    input_descriptors: HashMap<String, MessageDescriptor>,
    associations: DashMap<String, String>,
    cursor: AtomicUsize,
}

impl AffinityMessageRouter {
    pub fn new(
        name: impl Into<String>,
        cluster: Arc<Cluster>,
        pool: &DescriptorPool,
        package: &str,
        service: &str,
        methods: &[String],
        route_field: impl Into<String>,
    ) -> Result<Self> {
        let mut input_descriptors = HashMap::new();
        for method in methods {
            let schema = MethodSchema::resolve(pool, package, service, method)?;
            input_descriptors.insert(method.clone(), schema.input);
        }

        Ok(AffinityMessageRouter {
            name: name.into(),
            cluster,
            route_field: route_field.into(),
            input_descriptors,
            associations: DashMap::new(),
            cursor: AtomicUsize::new(0),
        })
    }
}

impl Router for AffinityMessageRouter {
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

        let descriptor = self.input_descriptors.get(&frame.method.method).ok_or_else(|| {
            ArouterError::Routing(format!("router {:?} has no affinity schema for method {:?}", self.name, frame.method.method))
        })?;

        let key = extract_field(descriptor, &frame.payload, &self.route_field)?;

        if let Some(bound) = self.associations.get(&key) {
            if let Some(backend) = self.cluster.backend_by_name(bound.value()) {
                return Ok(RouteDecision { backend, association_key: Some(key) });
            }
        }

        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.cluster.backends.len();
        let backend = self.cluster.backends[idx].clone();
        self.associations.entry(key.clone()).or_insert_with(|| backend.name.clone());
        Ok(RouteDecision { backend, association_key: Some(key) })
    }

    fn set_affinity(&self, key: &str, backend_name: &str) -> Result<()> {
        if self.cluster.backend_by_name(backend_name).is_none() {
            return Err(ArouterError::Routing(format!("backend {backend_name:?} not found in cluster {:?}", self.cluster.name)));
        }
        self.associations.insert(key.to_string(), backend_name.to_string());
        Ok(())
    }
}
