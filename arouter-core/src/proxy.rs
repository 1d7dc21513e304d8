//! The proxy root (C10): assembles clusters, routers, and servers from a
//! `Configuration`, and runs them until a shutdown signal arrives.
//!
//! `ProxyRegistry` plays the role of the original's process-wide `clusters`
//! and `allRouters` maps, but as an explicit, constructor-injected struct
//! rather than true globals — tests build their own registry instead of
//! resetting shared mutable state between runs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use prost_reflect::DescriptorPool;
use tokio_util::sync::CancellationToken;

use crate::cluster::Cluster;
use crate::config::{Configuration, RouteType};
use crate::control_api::{ControlApiService, ControlApiTower};
use crate::error::{ArouterError, Result};
use crate::forwarder::Forwarder;
use crate::router::{
    AffinityHeaderRouter, AffinityMessageRouter, BindingRouter, Router, RoundRobinRouter, SourceRouter,
};

#[derive(Clone, Default)]
pub struct ProxyRegistry {
    clusters: Arc<DashMap<String, Arc<Cluster>>>,
    routers: Arc<DashMap<String, Arc<dyn Router>>>,
    /// `(router name, route name) -> cluster`, used by the control API to
    /// resolve `SetAffinity` requests that only name a router/route pair.
    route_clusters: Arc<DashMap<(String, String), Arc<Cluster>>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        ProxyRegistry::default()
    }

    pub fn register_cluster(&mut self, cluster: Arc<Cluster>) {
        self.clusters.insert(cluster.name.clone(), cluster);
    }

    pub fn register_router(&mut self, name: impl Into<String>, router: Arc<dyn Router>) {
        self.routers.insert(name.into(), router);
    }

    pub fn register_route_cluster(&mut self, router: impl Into<String>, route: impl Into<String>, cluster: Arc<Cluster>) {
        self.route_clusters.insert((router.into(), route.into()), cluster);
    }

    pub fn cluster_by_name(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.get(name).map(|entry| entry.value().clone())
    }

    pub fn router_by_name(&self, name: &str) -> Option<Arc<dyn Router>> {
        self.routers.get(name).map(|entry| entry.value().clone())
    }

    pub fn cluster_for_route(&self, router: &str, route: &str) -> Option<Arc<Cluster>> {
        self.route_clusters.get(&(router.to_string(), route.to_string())).map(|e| e.value().clone())
    }

    pub fn router_for_route(&self, router: &str, route: &str) -> Option<Arc<dyn Router>> {
        self.router_by_name(&route_key(router, route))
    }
}

/// The assembled, runnable proxy: every server's forwarder plus the control
/// API, ready to bind and accept connections.
pub struct ArouterProxy {
    config: Configuration,
    registry: ProxyRegistry,
    forwarders: Vec<(SocketAddr, Forwarder)>,
}

impl ArouterProxy {
    /// Build every cluster, router, and server-side router table named by
    /// `config`, resolving each router's proto descriptors up front so a
    /// malformed `.proto` reference fails at construction, not at the first
    /// call.
    pub fn build(config: Configuration) -> Result<Self> {
        let mut registry = ProxyRegistry::new();

        for cluster_config in &config.backend_clusters {
            registry.register_cluster(Cluster::new(cluster_config)?);
        }

        for router_config in &config.routers {
            let needs_pool = router_config.routes.iter().any(|r| matches!(r.kind, RouteType::RpcAffinityMessage));
            let pool = if needs_pool { Some(load_pool_for_router(&router_config.proto_file)?) } else { None };

            for route in &router_config.routes {
                let cluster = registry
                    .cluster_by_name(&route.backend_cluster)
                    .ok_or_else(|| ArouterError::Config(format!("route {:?} references unknown cluster {:?}", route.name, route.backend_cluster)))?;
                registry.register_route_cluster(router_config.name.clone(), route.name.clone(), cluster.clone());

                let router: Arc<dyn Router> = match route.kind {
                    RouteType::RoundRobin => Arc::new(RoundRobinRouter::new(route.name.clone(), cluster)),
                    RouteType::Source => Arc::new(SourceRouter::new(route.name.clone(), cluster)),
                    RouteType::RpcAffinityHeader => {
                        Arc::new(AffinityHeaderRouter::new(route.name.clone(), cluster, route.route_field.clone()))
                    }
                    RouteType::RpcAffinityMessage => {
                        let pool = pool.as_ref().expect("pool resolved above for affinity-message routes");
                        Arc::new(AffinityMessageRouter::new(
                            route.name.clone(),
                            cluster,
                            pool,
                            &router_config.proto_package,
                            &router_config.proto_service,
                            &route.methods,
                            route.route_field.clone(),
                        )?)
                    }
                    RouteType::Binding => {
                        let binding = route.binding.as_ref().ok_or_else(|| {
                            ArouterError::Config(format!("route {:?} is type binding but has no binding config", route.name))
                        })?;
                        Arc::new(BindingRouter::new(route.name.clone(), cluster, binding.method.clone(), binding.field.clone()))
                    }
                };

                registry.register_router(route_key(&router_config.name, &route.name), router);
            }
        }

        let mut forwarders = Vec::new();
        for server in &config.servers {
            let mut router_table: HashMap<String, Arc<dyn Router>> = HashMap::new();
            for binding in &server.routers {
                let router_config = config
                    .routers
                    .iter()
                    .find(|r| r.name == binding.router)
                    .ok_or_else(|| ArouterError::Config(format!("server {:?} references unknown router {:?}", server.name, binding.router)))?;
                for route in &router_config.routes {
                    if let Some(router) = registry.router_by_name(&route_key(&router_config.name, &route.name)) {
                        router_table.insert(format!("{}.{}", router_config.proto_package, router_config.proto_service), router);
                    }
                }
            }

            let addr: SocketAddr = format!("{}:{}", server.addr, server.port)
                .parse()
                .map_err(|e| ArouterError::Config(format!("server {:?} has an invalid address: {e}", server.name)))?;
            forwarders.push((addr, Forwarder::new(router_table)));
        }

        Ok(ArouterProxy { config, registry, forwarders })
    }

    pub fn registry(&self) -> ProxyRegistry {
        self.registry.clone()
    }

    /// Dial out to every connection in every configured cluster.
    pub async fn connect_backends(&self) -> Result<()> {
        for (_, cluster) in self.registry.clusters.iter().map(|e| (e.key().clone(), e.value().clone())) {
            cluster.connect_all().await?;
        }
        Ok(())
    }

    /// Run all servers plus the control API until `shutdown` is cancelled,
    /// or until `ctrl_c`/`SIGTERM` if no token is supplied.
    pub async fn listen_and_serve(&self, shutdown: Option<CancellationToken>) -> Result<()> {
        let shutdown = shutdown.unwrap_or_else(default_shutdown_token);

        self.connect_backends().await?;

        let mut tasks = Vec::new();
        for (addr, forwarder) in &self.forwarders {
            let span = tracing::info_span!("server", %addr);
            let _enter = span.enter();
            let forwarder = forwarder.clone();
            let addr = *addr;
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move { forwarder.serve(addr, token).await }));
        }

        if let Some(api) = &self.config.api {
            let addr: SocketAddr = format!("{}:{}", api.addr, api.port)
                .parse()
                .map_err(|e| ArouterError::Config(format!("api has an invalid address: {e}")))?;
            let service = ControlApiTower(Arc::new(ControlApiService::new(self.registry.clone())));
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move { serve_control_api(addr, service, token).await }));
        }

        install_signal_handlers(shutdown.clone());

        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

fn route_key(router: &str, route: &str) -> String {
    format!("{router}::{route}")
}

fn load_pool_for_router(proto_file: &str) -> Result<DescriptorPool> {
    crate::field_extract::load_descriptor_pool(std::path::Path::new(proto_file))
}

async fn serve_control_api(addr: SocketAddr, service: ControlApiTower, shutdown: CancellationToken) -> std::io::Result<()> {
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::service::TowerToHyperService;
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control api listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let io = TokioIo::new(stream);
                let inner = service.clone();
                let svc = TowerToHyperService::new(tower::service_fn(move |req: http::Request<hyper::body::Incoming>| {
                    let mut inner = inner.clone();
                    tower::Service::call(&mut inner, req.map(tonic::body::Body::new))
                }));
                tokio::spawn(async move {
                    let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new()).serve_connection(io, svc).await;
                });
            }
        }
    }
}

fn default_shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    install_signal_handlers(token.clone());
    token
}

fn install_signal_handlers(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        token.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Association, BackendClusterConfig, BackendConfig, BackendType, ConnectionConfig, RouteConfig, RouterConfig,
    };

    fn minimal_config() -> Configuration {
        Configuration {
            instance_id: "1".to_string(),
            log_level: None,
            backend_clusters: vec![BackendClusterConfig {
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
            }],
            routers: vec![RouterConfig {
                name: "vcore".to_string(),
                proto_service: "VolthaService".to_string(),
                proto_package: "voltha".to_string(),
                proto_file: "/nonexistent.proto".to_string(),
                routes: vec![RouteConfig {
                    name: "read_only".to_string(),
                    kind: RouteType::RoundRobin,
                    association: None,
                    backend_cluster: "ro_vcore".to_string(),
                    route_field: String::new(),
                    methods: vec!["ListDevicePorts".to_string()],
                    nb_binding_methods: vec![],
                    binding: None,
                }],
            }],
            servers: vec![],
            api: None,
        }
    }

    #[test]
    fn build_succeeds_for_round_robin_routes_without_a_proto_file() {
        let proxy = ArouterProxy::build(minimal_config());
        assert!(proxy.is_ok());
    }

    #[test]
    fn registry_resolves_cluster_for_registered_route() {
        let proxy = ArouterProxy::build(minimal_config()).unwrap();
        let registry = proxy.registry();
        assert!(registry.cluster_for_route("vcore", "read_only").is_some());
        assert!(registry.cluster_for_route("vcore", "nonexistent").is_none());
    }
}
