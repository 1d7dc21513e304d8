//! A logical backend replica (C4): one or many upstream connections, the
//! per-backend concurrent bookkeeping used to pick among them, and the
//! validation rules enforced at construction.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::{Association, AssociationLocation, BackendConfig, BackendType};
use crate::connection::Connection;
use crate::error::{ArouterError, Result};

pub struct Backend {
    pub name: String,
    pub kind: BackendType,
    pub association: Association,
    pub connections: Vec<Arc<Connection>>,
    /// Open connection count per connection name — `dashmap` so routing
    /// decisions never block on a single global lock.
    pub open_conns: DashMap<String, u64>,
    /// Active association key → connection name, for `active_active`
    /// backends; consulted before falling back to round-robin.
    pub active_associations: DashMap<String, String>,
    round_robin_cursor: AtomicUsize,
}

impl Backend {
    pub fn new(config: &BackendConfig) -> Result<Arc<Self>> {
        validate(config)?;

        let connections: Vec<Arc<Connection>> = config
            .connections
            .iter()
            .map(|c| Connection::new(c.name.clone(), format!("http://{}:{}", c.addr, c.port)))
            .collect();

        let open_conns = DashMap::new();
        for conn in &connections {
            open_conns.insert(conn.name.clone(), 0);
        }

        Ok(Arc::new(Backend {
            name: config.name.clone(),
            kind: config.kind,
            association: config.association.clone(),
            connections,
            open_conns,
            active_associations: DashMap::new(),
            round_robin_cursor: AtomicUsize::new(0),
        }))
    }

    /// Bring up every connection. Called once at proxy startup.
    pub async fn connect_all(&self) -> Result<()> {
        for conn in &self.connections {
            conn.connect().await?;
        }
        Ok(())
    }

    pub fn connection_by_name(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections.iter().find(|c| c.name == name).cloned()
    }

    /// Pick a connection for a call, consulting the association key (if
    /// any) before falling back to round-robin. Records a fresh association
    /// the first time a key is seen (first-writer-wins, per the affinity
    /// invariant in spec §4/§8).
    pub fn select_connection(&self, association_key: Option<&str>) -> Result<Arc<Connection>> {
        if self.connections.is_empty() {
            return Err(ArouterError::NoOpenConnection(self.name.clone()));
        }

        if self.kind == BackendType::ActiveActive {
            if let Some(key) = association_key {
                if let Some(existing) = self.active_associations.get(key) {
                    if let Some(conn) = self.connection_by_name(existing.value()) {
                        return Ok(conn);
                    }
                }
            }
        }

        let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        let conn = self.connections[idx].clone();

        if self.kind == BackendType::ActiveActive {
            if let Some(key) = association_key {
                self.active_associations
                    .entry(key.to_string())
                    .or_insert_with(|| conn.name.clone());
            }
        }

        Ok(conn)
    }

    pub fn increment_open_conns(&self, connection_name: &str) {
        if let Some(mut count) = self.open_conns.get_mut(connection_name) {
            *count += 1;
        }
    }

    pub fn decrement_open_conns(&self, connection_name: &str) {
        if let Some(mut count) = self.open_conns.get_mut(connection_name) {
            *count = count.saturating_sub(1);
        }
    }

    /// Directly bind an association key to one of this `active_active`
    /// backend's own connections, bypassing round-robin.
    pub fn set_affinity(&self, key: impl Into<String>, connection_name: &str) -> Result<()> {
        if self.connection_by_name(connection_name).is_none() {
            return Err(ArouterError::Routing(format!(
                "backend {:?} has no connection named {:?}",
                self.name, connection_name
            )));
        }
        self.active_associations.insert(key.into(), connection_name.to_string());
        Ok(())
    }
}

fn validate(config: &BackendConfig) -> Result<()> {
    if config.name.is_empty() {
        return Err(ArouterError::Config("backend has no name".to_string()));
    }
    if config.connections.is_empty() {
        return Err(ArouterError::Config(format!("backend {:?} has no connections", config.name)));
    }
    for conn in &config.connections {
        if conn.name.is_empty() {
            return Err(ArouterError::Config(format!(
                "backend {:?} has a connection with no name",
                config.name
            )));
        }
    }

    match config.kind {
        BackendType::Server => {
            if config.connections.len() > 1 {
                return Err(ArouterError::Config(format!(
                    "backend {:?} is type server but declares more than one connection",
                    config.name
                )));
            }
        }
        BackendType::ActiveActive => {
            if config.association.strategy.is_none() {
                return Err(ArouterError::Config(format!(
                    "backend {:?} is active_active but has no association strategy",
                    config.name
                )));
            }
            match config.association.location {
                None => {
                    return Err(ArouterError::Config(format!(
                        "backend {:?} is active_active but has no association location",
                        config.name
                    )))
                }
                Some(AssociationLocation::Header) if config.association.key.is_empty() => {
                    return Err(ArouterError::Config(format!(
                        "backend {:?} has location header but no association key",
                        config.name
                    )))
                }
                Some(AssociationLocation::Protobuf) if config.association.field.is_empty() => {
                    return Err(ArouterError::Config(format!(
                        "backend {:?} has location protobuf but no association field",
                        config.name
                    )))
                }
                _ => {}
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssociationStrategy, ConnectionConfig};

    fn conn(name: &str) -> ConnectionConfig {
        ConnectionConfig {
            name: name.to_string(),
            addr: "127.0.0.1".to_string(),
            port: "50001".to_string(),
        }
    }

    fn server_backend() -> BackendConfig {
        BackendConfig {
            name: "ro_vcore0".to_string(),
            kind: BackendType::Server,
            association: Association::default(),
            connections: vec![conn("ro_vcore01")],
        }
    }

    fn active_active_backend() -> BackendConfig {
        BackendConfig {
            name: "rw_vcore0".to_string(),
            kind: BackendType::ActiveActive,
            association: Association {
                strategy: Some(AssociationStrategy::SerialNumber),
                location: Some(AssociationLocation::Header),
                field: String::new(),
                key: "voltha_backend_name".to_string(),
            },
            connections: vec![conn("rw_vcore01"), conn("rw_vcore02")],
        }
    }

    #[test]
    fn construction_rejects_server_with_multiple_connections() {
        let mut config = server_backend();
        config.connections.push(conn("ro_vcore02"));
        assert!(Backend::new(&config).is_err());
    }

    #[test]
    fn construction_rejects_active_active_without_strategy() {
        let mut config = active_active_backend();
        config.association.strategy = None;
        assert!(Backend::new(&config).is_err());
    }

    #[test]
    fn select_connection_round_robins_without_association() {
        let config = active_active_backend();
        let backend = Backend::new(&config).unwrap();
        let first = backend.select_connection(None).unwrap();
        let second = backend.select_connection(None).unwrap();
        assert_ne!(first.name, second.name);
    }

    #[test]
    fn select_connection_pins_to_first_choice_for_key() {
        let config = active_active_backend();
        let backend = Backend::new(&config).unwrap();
        let first = backend.select_connection(Some("serial-1")).unwrap();
        let second = backend.select_connection(Some("serial-1")).unwrap();
        assert_eq!(first.name, second.name);
    }

    #[test]
    fn set_affinity_rejects_unknown_connection() {
        let config = active_active_backend();
        let backend = Backend::new(&config).unwrap();
        assert!(backend.set_affinity("serial-1", "nonexistent").is_err());
    }

    #[test]
    fn set_affinity_overrides_future_selection() {
        let config = active_active_backend();
        let backend = Backend::new(&config).unwrap();
        backend.set_affinity("serial-1", "rw_vcore02").unwrap();
        let selected = backend.select_connection(Some("serial-1")).unwrap();
        assert_eq!(selected.name, "rw_vcore02");
    }
}
