//! `rpc_affinity_header`: affinity key comes from a gRPC metadata header the
//! client is expected to send on every call for the same logical entity,
//! rather than a field embedded in the payload.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::cluster::Cluster;
use crate::error::{ArouterError, Result};

use super::{Router, RouteDecision, RequestFrame};

pub struct AffinityHeaderRouter {
    name: String,
    cluster: Arc<Cluster>,
    header_key: String,
    associations: DashMap<String, String>,
    cursor: AtomicUsize,
}

impl AffinityHeaderRouter {
    pub fn new(name: impl Into<String>, cluster: Arc<Cluster>, header_key: impl Into<String>) -> Self {
        AffinityHeaderRouter {
            name: name.into(),
            cluster,
            header_key: header_key.into(),
            associations: DashMap::new(),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Router for AffinityHeaderRouter {
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

        let key = frame
            .metadata
            .get(self.header_key.as_str())
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ArouterError::Routing(format!("request is missing affinity header {:?}", self.header_key)))?
            .to_string();

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodDetails;
    use bytes::Bytes;
    use tonic::metadata::MetadataMap;

    fn frame_with_header(key: &'static str, value: &str) -> RequestFrame {
        let mut metadata = MetadataMap::new();
        metadata.insert(key, value.parse().unwrap());
        RequestFrame::new(MethodDetails::parse("/voltha.VolthaService/ListDevices"), Bytes::new(), metadata)
    }

    #[test]
    fn pins_calls_sharing_the_header_value() {
        let cluster = super::super::test_cluster("rw_vcore", &["a", "b"]);
        let router = AffinityHeaderRouter::new("rw_vcore_affinity", cluster, "voltha_serial_number");
        let first = router.route(&mut frame_with_header("voltha_serial_number", "123")).unwrap().backend.name.clone();
        let second = router.route(&mut frame_with_header("voltha_serial_number", "123")).unwrap().backend.name.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_header_is_an_error() {
        let cluster = super::super::test_cluster("rw_vcore", &["a"]);
        let router = AffinityHeaderRouter::new("rw_vcore_affinity", cluster, "voltha_serial_number");
        let mut frame = RequestFrame::new(MethodDetails::parse("/voltha.VolthaService/X"), Bytes::new(), MetadataMap::new());
        assert!(router.route(&mut frame).is_err());
    }
}
