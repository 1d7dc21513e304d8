//! Dynamic protobuf field extraction (C6).
//!
//! Affinity-by-message and binding routes need to pull a single named scalar
//! field out of a serialized request or response payload without the router
//! knowing the message type at compile time. Rather than scanning the wire
//! format by hand, we load the router's `.proto` (or a precompiled
//! `FileDescriptorSet`) into a `prost_reflect::DescriptorPool`, resolve the
//! request/response `MessageDescriptor`s once, and decode into a
//! `DynamicMessage` per call.

use std::path::Path;

use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, Value};

use crate::error::{ArouterError, Result};

/// Loads a `DescriptorPool` from either a `.proto` source file or a
/// precompiled `FileDescriptorSet` (detected by trying the latter first,
/// since a `FileDescriptorSet` is the format `protoc --descriptor_set_out`
/// produces and is cheap to attempt-decode).
pub fn load_descriptor_pool(proto_file: &Path) -> Result<DescriptorPool> {
    let bytes = std::fs::read(proto_file)?;

    if let Ok(fds) = prost_types::FileDescriptorSet::decode(bytes.as_slice()) {
        if let Ok(pool) = DescriptorPool::from_file_descriptor_set(fds) {
            return Ok(pool);
        }
    }

    let include_dir = proto_file
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let fds = protox::compile([proto_file], [include_dir])
        .map_err(|e| ArouterError::Config(format!("failed to compile {proto_file:?}: {e}")))?;
    DescriptorPool::from_file_descriptor_set(fds)
        .map_err(|e| ArouterError::Config(format!("invalid descriptor set from {proto_file:?}: {e}")))
}

/// Resolves the input and output message descriptors for a single RPC
/// method, for use by routers that need to decode one or the other.
pub struct MethodSchema {
    pub input: MessageDescriptor,
    pub output: MessageDescriptor,
}

impl MethodSchema {
    pub fn resolve(pool: &DescriptorPool, package: &str, service: &str, method: &str) -> Result<Self> {
        let full_service = format!("{package}.{service}");
        let svc = pool.get_service_by_name(&full_service).ok_or_else(|| {
            ArouterError::Config(format!("service {full_service:?} not found in proto descriptors"))
        })?;
        let method_desc = svc
            .methods()
            .find(|m| m.name() == method)
            .ok_or_else(|| ArouterError::Config(format!("method {method:?} not found on service {full_service:?}")))?;

        Ok(MethodSchema {
            input: method_desc.input(),
            output: method_desc.output(),
        })
    }
}

/// Decode `payload` against `descriptor` and return the named field's value
/// formatted as a string, the representation every affinity key is compared
/// and stored as.
pub fn extract_field(descriptor: &MessageDescriptor, payload: &[u8], field_name: &str) -> Result<String> {
    let message = DynamicMessage::decode(descriptor.clone(), payload)
        .map_err(|e| ArouterError::Routing(format!("failed to decode message for field extraction: {e}")))?;

    let field = descriptor
        .get_field_by_name(field_name)
        .ok_or_else(|| ArouterError::Routing(format!("field {field_name:?} not found on message {}", descriptor.full_name())))?;

    let value = message.get_field(&field);
    format_value(&value).ok_or_else(|| {
        ArouterError::Routing(format!(
            "field {field_name:?} on message {} is not a scalar affinity key",
            descriptor.full_name()
        ))
    })
}

fn format_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::I32(v) => Some(v.to_string()),
        Value::I64(v) => Some(v.to_string()),
        Value::U32(v) => Some(v.to_string()),
        Value::U64(v) => Some(v.to_string()),
        Value::Bool(v) => Some(v.to_string()),
        Value::Bytes(b) => Some(b.iter().map(|byte| format!("{byte:02x}")).collect()),
        Value::EnumNumber(n) => Some(n.to_string()),
        _ => None,
    }
}
