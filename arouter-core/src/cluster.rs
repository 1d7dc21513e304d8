//! A named set of backends (C5): construction validation and backend lookup.
//! Selection *among* backends (round-robin, keyed by affinity) lives in the
//! router implementations, which hold the backend-cluster reference and the
//! affinity map together.

use std::sync::Arc;

use crate::backend::Backend;
use crate::config::BackendClusterConfig;
use crate::error::{ArouterError, Result};

pub struct Cluster {
    pub name: String,
    pub backends: Vec<Arc<Backend>>,
}

impl Cluster {
    pub fn new(config: &BackendClusterConfig) -> Result<Arc<Self>> {
        if config.name.is_empty() {
            return Err(ArouterError::Config("backend cluster has no name".to_string()));
        }
        if config.backends.is_empty() {
            return Err(ArouterError::Config(format!("backend cluster {:?} has no backends", config.name)));
        }

        let mut names = std::collections::HashSet::new();
        let mut backends = Vec::with_capacity(config.backends.len());
        for backend_config in &config.backends {
            if !names.insert(backend_config.name.clone()) {
                return Err(ArouterError::Config(format!(
                    "duplicate backend name {:?} in cluster {:?}",
                    backend_config.name, config.name
                )));
            }
            backends.push(Backend::new(backend_config)?);
        }

        Ok(Arc::new(Cluster { name: config.name.clone(), backends }))
    }

    pub fn backend_by_name(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends.iter().find(|b| b.name == name).cloned()
    }

    pub async fn connect_all(&self) -> Result<()> {
        for backend in &self.backends {
            backend.connect_all().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Association, BackendConfig, BackendType, ConnectionConfig};

    fn backend_config(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            kind: BackendType::Server,
            association: Association::default(),
            connections: vec![ConnectionConfig {
                name: format!("{name}01"),
                addr: "127.0.0.1".to_string(),
                port: "50001".to_string(),
            }],
        }
    }

    #[test]
    fn construction_requires_name() {
        let config = BackendClusterConfig { name: String::new(), backends: vec![backend_config("a")] };
        assert!(Cluster::new(&config).is_err());
    }

    #[test]
    fn construction_requires_at_least_one_backend() {
        let config = BackendClusterConfig { name: "ro_vcore".to_string(), backends: vec![] };
        assert!(Cluster::new(&config).is_err());
    }

    #[test]
    fn construction_rejects_duplicate_backend_names() {
        let config = BackendClusterConfig {
            name: "ro_vcore".to_string(),
            backends: vec![backend_config("ro_vcore0"), backend_config("ro_vcore0")],
        };
        assert!(Cluster::new(&config).is_err());
    }

    #[test]
    fn backend_by_name_finds_member() {
        let config = BackendClusterConfig {
            name: "ro_vcore".to_string(),
            backends: vec![backend_config("ro_vcore0"), backend_config("ro_vcore1")],
        };
        let cluster = Cluster::new(&config).unwrap();
        assert!(cluster.backend_by_name("ro_vcore1").is_some());
        assert!(cluster.backend_by_name("nonexistent").is_none());
    }
}
