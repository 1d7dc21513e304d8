//! The configuration schema (spec §3, §6) and its loader.
//!
//! JSON shapes mirror the original Go `Configuration` document one-to-one;
//! field names are `camelCase` on the wire via `#[serde(rename_all)]`, and
//! the small closed enumerations (`backendType`, `associationLocation`, ...)
//! use the exact wire strings recovered from the original's `enums_test.go`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    Server,
    ActiveActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationLocation {
    Header,
    Protobuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationStrategy {
    SerialNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationType {
    RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    RpcAffinityMessage,
    RpcAffinityHeader,
    Binding,
    RoundRobin,
    Source,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    pub name: String,
    pub addr: String,
    pub port: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Association {
    pub strategy: Option<AssociationStrategy>,
    pub location: Option<AssociationLocation>,
    pub field: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: BackendType,
    #[serde(default)]
    pub association: Association,
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendClusterConfig {
    pub name: String,
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub field: String,
    pub method: String,
    pub association: AssociationType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RouteType,
    #[serde(default)]
    pub association: Option<AssociationType>,
    pub backend_cluster: String,
    #[serde(default)]
    pub route_field: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub nb_binding_methods: Vec<String>,
    #[serde(default)]
    pub binding: Option<BindingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    pub name: String,
    pub proto_service: String,
    pub proto_package: String,
    pub proto_file: String,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRouterBinding {
    pub router: String,
    pub package: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub addr: String,
    pub port: u16,
    pub routers: Vec<ServerRouterBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub addr: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    pub instance_id: String,
    pub log_level: Option<String>,
    pub backend_clusters: Vec<BackendClusterConfig>,
    pub routers: Vec<RouterConfig>,
    pub servers: Vec<ServerConfig>,
    pub api: Option<ApiConfig>,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            instance_id: String::new(),
            log_level: None,
            backend_clusters: Vec::new(),
            routers: Vec::new(),
            servers: Vec::new(),
            api: None,
        }
    }
}

impl Configuration {
    /// Read and parse a configuration document from disk, then run the
    /// §4 construction-time validation rules, collecting every violation.
    pub fn load(path: &Path) -> Result<Configuration, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let config: Configuration =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        let problems = config.validate();
        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }

        Ok(config)
    }

    /// Collect every structural validation problem rather than failing on
    /// the first (spec §6: "an operator sees all problems in one run").
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let mut cluster_names = std::collections::HashSet::new();
        for cluster in &self.backend_clusters {
            if cluster.name.is_empty() {
                problems.push("backend cluster has no name".to_string());
            } else if !cluster_names.insert(cluster.name.clone()) {
                problems.push(format!("duplicate backend cluster name {:?}", cluster.name));
            }

            let mut backend_names = std::collections::HashSet::new();
            for backend in &cluster.backends {
                validate_backend(backend, &cluster.name, &mut problems);
                if !backend.name.is_empty() && !backend_names.insert(backend.name.clone()) {
                    problems.push(format!(
                        "duplicate backend name {:?} in cluster {:?}",
                        backend.name, cluster.name
                    ));
                }
            }
        }

        let mut router_names = std::collections::HashSet::new();
        for router in &self.routers {
            if router.name.is_empty() {
                problems.push("router has no name".to_string());
            } else if !router_names.insert(router.name.clone()) {
                problems.push(format!("duplicate router name {:?}", router.name));
            }
            if router.proto_package.is_empty() {
                problems.push(format!("router {:?} has no protoPackage", router.name));
            }
            if router.proto_service.is_empty() {
                problems.push(format!("router {:?} has no protoService", router.name));
            }
            if router.routes.is_empty() {
                problems.push(format!("router {:?} has no routes", router.name));
            }
            for route in &router.routes {
                if route.name.is_empty() {
                    problems.push(format!("router {:?} has a route with no name", router.name));
                }
                if !cluster_names.contains(&route.backend_cluster) {
                    problems.push(format!(
                        "route {:?} references unknown backend cluster {:?}",
                        route.name, route.backend_cluster
                    ));
                }
                if route.methods.is_empty() {
                    problems.push(format!("route {:?} has no methods", route.name));
                }
                if matches!(route.kind, RouteType::Binding) && route.binding.is_none() {
                    problems.push(format!(
                        "route {:?} is type binding but has no binding configuration",
                        route.name
                    ));
                }
            }
        }

        for server in &self.servers {
            if server.name.is_empty() {
                problems.push("server has no name".to_string());
            }
            if server.kind != "grpc" {
                problems.push(format!("server {:?} has unsupported type {:?}", server.name, server.kind));
            }
            if server.addr.parse::<std::net::IpAddr>().is_err() {
                problems.push(format!("server {:?} has an invalid addr {:?}", server.name, server.addr));
            }
            if server.port == 0 {
                problems.push(format!("server {:?} has an invalid port", server.name));
            }
            if server.routers.is_empty() {
                problems.push(format!("server {:?} declares no routers", server.name));
            }
            for binding in &server.routers {
                if !router_names.contains(&binding.router) {
                    problems.push(format!(
                        "server {:?} references unknown router {:?}",
                        server.name, binding.router
                    ));
                }
            }
        }

        if let Some(api) = &self.api {
            if api.addr.parse::<std::net::IpAddr>().is_err() {
                problems.push(format!("api has an invalid addr {:?}", api.addr));
            }
            if api.port == 0 {
                problems.push("api has an invalid port".to_string());
            }
        }

        problems
    }
}

fn validate_backend(backend: &BackendConfig, cluster_name: &str, problems: &mut Vec<String>) {
    if backend.name.is_empty() {
        problems.push(format!("a backend in cluster {cluster_name:?} has no name"));
    }
    if backend.connections.is_empty() {
        problems.push(format!("backend {:?} has no connections", backend.name));
    }

    let mut conn_names = std::collections::HashSet::new();
    for conn in &backend.connections {
        if conn.name.is_empty() {
            problems.push(format!("backend {:?} has a connection with no name", backend.name));
        } else if !conn_names.insert(conn.name.clone()) {
            problems.push(format!(
                "duplicate connection name {:?} in backend {:?}",
                conn.name, backend.name
            ));
        }
        match conn.port.parse::<u16>() {
            Ok(0) | Err(_) => problems.push(format!(
                "connection {:?} in backend {:?} has an invalid port {:?}",
                conn.name, backend.name, conn.port
            )),
            _ => {}
        }
        if conn.addr.is_empty() {
            problems.push(format!("connection {:?} in backend {:?} has no addr", conn.name, backend.name));
        }
    }

    match backend.kind {
        BackendType::Server => {
            if backend.connections.len() > 1 {
                problems.push(format!(
                    "backend {:?} is type server but declares more than one connection",
                    backend.name
                ));
            }
        }
        BackendType::ActiveActive => {
            if backend.association.strategy.is_none() {
                problems.push(format!(
                    "backend {:?} is active_active but has no association strategy",
                    backend.name
                ));
            }
            match backend.association.location {
                None => problems.push(format!(
                    "backend {:?} is active_active but has no association location",
                    backend.name
                )),
                Some(AssociationLocation::Header) => {
                    if backend.association.key.is_empty() {
                        problems.push(format!(
                            "backend {:?} has location header but no association key",
                            backend.name
                        ));
                    }
                }
                Some(AssociationLocation::Protobuf) => {
                    if backend.association.field.is_empty() {
                        problems.push(format!(
                            "backend {:?} has location protobuf but no association field",
                            backend.name
                        ));
                    }
                }
            }
        }
    }
}
