//! Core library for arouter: affinity-aware transparent gRPC routing.
//!
//! See [`config::Configuration`] for the schema, [`proxy::ArouterProxy`] for
//! the assembled runtime, and [`router`] for the routing strategies.

pub mod backend;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod connection;
pub mod control_api;
pub mod error;
pub mod field_extract;
pub mod forwarder;
pub mod method;
pub mod proxy;
pub mod router;

pub use config::Configuration;
pub use error::{ArouterError, ConfigError, Result};
pub use proxy::ArouterProxy;
