//! The reverse-proxy control API (C9): `SetAffinity` and `SetConnection`.
//!
//! The surface is two RPCs with three small, stable message shapes, so
//! rather than pull in a `.proto`/`protoc`/build-script pipeline for them,
//! the messages are hand-declared `prost::Message` structs and the tonic
//! service dispatch is hand-written in the same shape `tonic-build` would
//! generate: a `NamedService` impl plus a `tower::Service` matching exactly
//! two paths.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use prost::Message;
use tonic::server::{Grpc, NamedService, UnaryService};
use tonic_prost::ProstCodec;
use tonic::{Request, Response, Status};

use crate::proxy::ProxyRegistry;

#[derive(Clone, PartialEq, Message)]
pub struct Affinity {
    #[prost(string, tag = "1")]
    pub router: String,
    #[prost(string, tag = "2")]
    pub route: String,
    #[prost(string, tag = "3")]
    pub key: String,
    #[prost(string, tag = "4")]
    pub backend: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Conn {
    #[prost(string, tag = "1")]
    pub backend_cluster: String,
    #[prost(string, tag = "2")]
    pub backend: String,
    #[prost(string, tag = "3")]
    pub connection: String,
    #[prost(string, tag = "4")]
    pub addr: String,
    #[prost(uint32, tag = "5")]
    pub port: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Empty {}

/// The hand-written equivalent of a `tonic-build`-generated
/// `configuration_server::Configuration` trait: one async method per RPC.
#[async_trait::async_trait]
pub trait ConfigurationApi: Send + Sync + 'static {
    async fn set_affinity(&self, request: Request<Affinity>) -> Result<Response<Empty>, Status>;
    async fn set_connection(&self, request: Request<Conn>) -> Result<Response<Empty>, Status>;
}

/// The concrete implementation backed by a proxy's registries.
pub struct ControlApiService {
    registry: ProxyRegistry,
}

impl ControlApiService {
    pub fn new(registry: ProxyRegistry) -> Self {
        ControlApiService { registry }
    }
}

#[async_trait::async_trait]
impl ConfigurationApi for ControlApiService {
    async fn set_affinity(&self, request: Request<Affinity>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        let router = self
            .registry
            .router_for_route(&req.router, &req.route)
            .ok_or_else(|| Status::not_found(format!("no router for router {:?} route {:?}", req.router, req.route)))?;
        router.set_affinity(&req.key, &req.backend).map_err(Status::from)?;
        Ok(Response::new(Empty {}))
    }

    async fn set_connection(&self, request: Request<Conn>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        if req.port == 0 || req.port > u16::from(u16::MAX) as u32 {
            return Err(Status::invalid_argument(format!("invalid port {}", req.port)));
        }
        let cluster = self
            .registry
            .cluster_by_name(&req.backend_cluster)
            .ok_or_else(|| Status::not_found(format!("backend cluster {:?} not found", req.backend_cluster)))?;
        let backend = cluster
            .backend_by_name(&req.backend)
            .ok_or_else(|| Status::not_found(format!("backend {:?} not found", req.backend)))?;
        let connection = backend
            .connection_by_name(&req.connection)
            .ok_or_else(|| Status::not_found(format!("connection {:?} not found", req.connection)))?;
        connection
            .set_address(format!("http://{}:{}", req.addr, req.port))
            .await
            .map_err(Status::from)?;
        Ok(Response::new(Empty {}))
    }
}

struct SetAffinitySvc(std::sync::Arc<ControlApiService>);

impl UnaryService<Affinity> for SetAffinitySvc {
    type Response = Empty;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Empty>, Status>> + Send>>;
    fn call(&mut self, request: Request<Affinity>) -> Self::Future {
        let inner = self.0.clone();
        Box::pin(async move { inner.set_affinity(request).await })
    }
}

struct SetConnectionSvc(std::sync::Arc<ControlApiService>);

impl UnaryService<Conn> for SetConnectionSvc {
    type Response = Empty;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Empty>, Status>> + Send>>;
    fn call(&mut self, request: Request<Conn>) -> Self::Future {
        let inner = self.0.clone();
        Box::pin(async move { inner.set_connection(request).await })
    }
}

#[derive(Clone)]
pub struct ControlApiTower(pub std::sync::Arc<ControlApiService>);

impl NamedService for ControlApiTower {
    const NAME: &'static str = "afrouter.Configuration";
}

impl tower::Service<http::Request<tonic::body::Body>> for ControlApiTower {
    type Response = http::Response<tonic::body::Body>;
    type Error = std::convert::Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<tonic::body::Body>) -> Self::Future {
        let inner = self.0.clone();
        match req.uri().path() {
            "/afrouter.Configuration/SetAffinity" => {
                let mut grpc = Grpc::new(ProstCodec::default());
                Box::pin(async move { Ok(grpc.unary(SetAffinitySvc(inner), req).await) })
            }
            "/afrouter.Configuration/SetConnection" => {
                let mut grpc = Grpc::new(ProstCodec::default());
                Box::pin(async move { Ok(grpc.unary(SetConnectionSvc(inner), req).await) })
            }
            _ => Box::pin(async move {
                Ok(Status::unimplemented("unknown control API method").into_http())
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Association, BackendClusterConfig, BackendConfig, BackendType, ConnectionConfig};
    use crate::cluster::Cluster;
    use crate::method::MethodDetails;
    use crate::router::{AffinityHeaderRouter, RequestFrame};
    use bytes::Bytes;
    use tonic::metadata::MetadataMap;

    fn registry_with_backend() -> (ProxyRegistry, std::sync::Arc<crate::cluster::Cluster>) {
        let cluster = Cluster::new(&BackendClusterConfig {
            name: "ro_vcore".to_string(),
            backends: vec![BackendConfig {
                name: "ro_vcore0".to_string(),
                kind: BackendType::Server,
                association: Association::default(),
                connections: vec![ConnectionConfig {
                    name: "ro_vcore01".to_string(),
                    addr: "127.0.0.1".to_string(),
                    port: "50001".to_string(),
                }],
            }],
        })
        .unwrap();
        let mut registry = ProxyRegistry::new();
        registry.register_cluster(cluster.clone());
        (registry, cluster)
    }

    fn registry_with_affinity_router() -> (ProxyRegistry, std::sync::Arc<crate::cluster::Cluster>) {
        let cluster = Cluster::new(&BackendClusterConfig {
            name: "rw_vcore".to_string(),
            backends: vec![
                BackendConfig {
                    name: "rw_vcore0".to_string(),
                    kind: BackendType::Server,
                    association: Association::default(),
                    connections: vec![ConnectionConfig {
                        name: "rw_vcore01".to_string(),
                        addr: "127.0.0.1".to_string(),
                        port: "50001".to_string(),
                    }],
                },
                BackendConfig {
                    name: "rw_vcore1".to_string(),
                    kind: BackendType::Server,
                    association: Association::default(),
                    connections: vec![ConnectionConfig {
                        name: "rw_vcore11".to_string(),
                        addr: "127.0.0.1".to_string(),
                        port: "50002".to_string(),
                    }],
                },
            ],
        })
        .unwrap();
        let router = AffinityHeaderRouter::new("rw_vcore_affinity", cluster.clone(), "voltha_serial_number");
        let mut registry = ProxyRegistry::new();
        registry.register_cluster(cluster.clone());
        registry.register_route_cluster("vcore", "read_write", cluster.clone());
        registry.register_router("vcore::read_write", std::sync::Arc::new(router));
        (registry, cluster)
    }

    #[tokio::test]
    async fn set_connection_rejects_invalid_port() {
        let (registry, _) = registry_with_backend();
        let service = ControlApiService::new(registry);
        let req = Request::new(Conn {
            backend_cluster: "ro_vcore".to_string(),
            backend: "ro_vcore0".to_string(),
            connection: "ro_vcore01".to_string(),
            addr: "127.0.0.1".to_string(),
            port: 0,
        });
        let result = service.set_connection(req).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn set_connection_rejects_unknown_backend() {
        let (registry, _) = registry_with_backend();
        let service = ControlApiService::new(registry);
        let req = Request::new(Conn {
            backend_cluster: "ro_vcore".to_string(),
            backend: "nonexistent".to_string(),
            connection: "ro_vcore01".to_string(),
            addr: "127.0.0.1".to_string(),
            port: 50002,
        });
        let result = service.set_connection(req).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn set_connection_updates_existing_connection() {
        let (registry, cluster) = registry_with_backend();
        let service = ControlApiService::new(registry);
        let req = Request::new(Conn {
            backend_cluster: "ro_vcore".to_string(),
            backend: "ro_vcore0".to_string(),
            connection: "ro_vcore01".to_string(),
            addr: "127.0.0.1".to_string(),
            port: 50099,
        });
        service.set_connection(req).await.unwrap();
        let backend = cluster.backend_by_name("ro_vcore0").unwrap();
        let conn = backend.connection_by_name("ro_vcore01").unwrap();
        assert_eq!(conn.state(), crate::connection::ConnectionState::Ready);
    }

    #[tokio::test]
    async fn set_affinity_overwrites_the_routers_affinity_map() {
        let (registry, _) = registry_with_affinity_router();
        let router = registry.router_for_route("vcore", "read_write").unwrap();
        let service = ControlApiService::new(registry);

        let req = Request::new(Affinity {
            router: "vcore".to_string(),
            route: "read_write".to_string(),
            key: "abc".to_string(),
            backend: "rw_vcore1".to_string(),
        });
        service.set_affinity(req).await.unwrap();

        let mut frame = RequestFrame::new(MethodDetails::parse("/voltha.VolthaService/EnableDevice"), Bytes::new(), MetadataMap::new());
        frame.metadata.insert("voltha_serial_number", "abc".parse().unwrap());
        let decision = router.route(&mut frame).unwrap();
        assert_eq!(decision.backend.name, "rw_vcore1");

        // A second call overwrites the prior binding instead of being rejected.
        let req = Request::new(Affinity {
            router: "vcore".to_string(),
            route: "read_write".to_string(),
            key: "abc".to_string(),
            backend: "rw_vcore0".to_string(),
        });
        service.set_affinity(req).await.unwrap();
        let decision = router.route(&mut frame).unwrap();
        assert_eq!(decision.backend.name, "rw_vcore0");
    }

    #[tokio::test]
    async fn set_affinity_rejects_unknown_router_route() {
        let (registry, _) = registry_with_backend();
        let service = ControlApiService::new(registry);
        let req = Request::new(Affinity {
            router: "vcore".to_string(),
            route: "read_write".to_string(),
            key: "abc".to_string(),
            backend: "ro_vcore0".to_string(),
        });
        assert!(service.set_affinity(req).await.is_err());
    }

    #[tokio::test]
    async fn set_affinity_rejects_unknown_backend() {
        let (registry, _) = registry_with_affinity_router();
        let service = ControlApiService::new(registry);
        let req = Request::new(Affinity {
            router: "vcore".to_string(),
            route: "read_write".to_string(),
            key: "abc".to_string(),
            backend: "nonexistent".to_string(),
        });
        assert!(service.set_affinity(req).await.is_err());
    }
}
