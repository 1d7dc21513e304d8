//! `binding`: affinity is established explicitly by one designated "binding"
//! method (e.g. `Subscribe`), called with an empty or absent header. The
//! router mints the binding by round-robin and hands the chosen *backend
//! name* back to the client as a response header (`get_meta_key_val`); the
//! client then sends that backend name as the header on every subsequent
//! call — to the binding method again, or to any other bound method — and
//! the router routes straight to the named backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::cluster::Cluster;
use crate::error::{ArouterError, Result};

use super::{Router, RouteDecision, RequestFrame};

pub struct BindingRouter {
    name: String,
    cluster: Arc<Cluster>,
    /// The method whose call creates a new binding when its header is empty.
    binding_method: String,
    /// The header name carrying the bound backend's name on every call.
    field: String,
    /// The set of backend names that have been handed out as bindings.
    bindings: DashMap<String, ()>,
    cursor: AtomicUsize,
}

impl BindingRouter {
    pub fn new(name: impl Into<String>, cluster: Arc<Cluster>, binding_method: impl Into<String>, field: impl Into<String>) -> Self {
        BindingRouter {
            name: name.into(),
            cluster,
            binding_method: binding_method.into(),
            field: field.into(),
            bindings: DashMap::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    fn header_value(&self, frame: &RequestFrame) -> Option<String> {
        frame
            .metadata
            .get(self.field.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .filter(|v| !v.is_empty())
    }

    /// The response header this router wants echoed to the client: the name
    /// of the backend the call was routed to.
    pub fn get_meta_key_val(&self, decision: &RouteDecision) -> Option<(String, String)> {
        Some((self.field.clone(), decision.backend.name.clone()))
    }

    fn mint_binding(&self) -> Arc<crate::backend::Backend> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.cluster.backends.len();
        let backend = self.cluster.backends[idx].clone();
        self.bindings.insert(backend.name.clone(), ());
        backend
    }

    fn resolve_binding(&self, backend_name: &str) -> Result<Arc<crate::backend::Backend>> {
        if self.bindings.get(backend_name).is_none() {
            return Err(ArouterError::Routing(format!("no binding exists for backend {backend_name:?}")));
        }
        self.cluster
            .backend_by_name(backend_name)
            .ok_or_else(|| ArouterError::Routing(format!("binding {backend_name:?} points at an unknown backend")))
    }
}

impl Router for BindingRouter {
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

        let header = self.header_value(frame);

        let backend = if frame.method.method == self.binding_method && header.is_none() {
            self.mint_binding()
        } else {
            let backend_name = header
                .ok_or_else(|| ArouterError::Routing(format!("call is missing binding header {:?}", self.field)))?;
            self.resolve_binding(&backend_name)?
        };

        let decision = RouteDecision { backend, association_key: None };
        frame.pending_header = self.get_meta_key_val(&decision);
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodDetails;
    use bytes::Bytes;
    use tonic::metadata::MetadataMap;

    fn frame(method: &str, header_value: Option<&str>) -> RequestFrame {
        let mut metadata = MetadataMap::new();
        if let Some(v) = header_value {
            metadata.insert("voltha_backend_name", v.parse().unwrap());
        }
        RequestFrame::new(MethodDetails::parse(&format!("/voltha.VolthaService/{method}")), Bytes::new(), metadata)
    }

    #[test]
    fn binding_call_with_empty_header_mints_and_echoes_backend_name() {
        let cluster = super::super::test_cluster("rw_vcore", &["a", "b"]);
        let router = BindingRouter::new("binder", cluster, "Subscribe", "voltha_backend_name");

        let mut f = frame("Subscribe", Some(""));
        let decision = router.route(&mut f).unwrap();
        assert_eq!(f.pending_header, Some(("voltha_backend_name".to_string(), decision.backend.name.clone())));
    }

    #[test]
    fn binding_call_with_absent_header_mints_and_echoes_backend_name() {
        let cluster = super::super::test_cluster("rw_vcore", &["a", "b"]);
        let router = BindingRouter::new("binder", cluster, "Subscribe", "voltha_backend_name");

        let mut f = frame("Subscribe", None);
        let decision = router.route(&mut f).unwrap();
        assert_eq!(f.pending_header, Some(("voltha_backend_name".to_string(), decision.backend.name.clone())));
    }

    #[test]
    fn binding_call_with_known_backend_name_finds_the_binding() {
        let cluster = super::super::test_cluster("rw_vcore", &["a", "b"]);
        let router = BindingRouter::new("binder", cluster, "Subscribe", "voltha_backend_name");

        let minted = router.route(&mut frame("Subscribe", None)).unwrap().backend.name.clone();
        let found = router.route(&mut frame("Subscribe", Some(&minted))).unwrap().backend.name.clone();
        assert_eq!(minted, found);
    }

    #[test]
    fn bound_method_reuses_the_binding() {
        let cluster = super::super::test_cluster("rw_vcore", &["a", "b"]);
        let router = BindingRouter::new("binder", cluster, "Subscribe", "voltha_backend_name");

        let minted = router.route(&mut frame("Subscribe", None)).unwrap().backend.name.clone();
        let enable_backend = router.route(&mut frame("EnableDevice", Some(&minted))).unwrap().backend.name.clone();
        assert_eq!(minted, enable_backend);
    }

    #[test]
    fn bound_method_without_existing_binding_errors() {
        let cluster = super::super::test_cluster("rw_vcore", &["a"]);
        let router = BindingRouter::new("binder", cluster, "Subscribe", "voltha_backend_name");
        assert!(router.route(&mut frame("EnableDevice", Some("rw_vcore0"))).is_err());
    }

    #[test]
    fn bound_method_without_header_errors() {
        let cluster = super::super::test_cluster("rw_vcore", &["a"]);
        let router = BindingRouter::new("binder", cluster, "EnableDevice", "voltha_backend_name");
        assert!(router.route(&mut frame("EnableDevice", None)).is_err());
    }
}
