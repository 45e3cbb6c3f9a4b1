//! Protocols every agent speaks out of the box.

pub mod connections;
pub mod discovery;
pub mod problem_report;
pub mod trust_ping;

use std::sync::Arc;

use dcomm_core::message::SOV_DOC_URI;
use dcomm_core::{HandlerRegistry, ProtocolIdentifierUri, Semver};

pub use connections::ConnectionsHandler;
pub use discovery::DiscoveryHandler;
pub use problem_report::ProblemReportHandler;
pub use trust_ping::TrustPingHandler;

/// `did:sov:...;spec/<name>/<major>.<minor>`.
pub(crate) fn sov_protocol(name: &str, major: u64, minor: u64) -> ProtocolIdentifierUri {
    ProtocolIdentifierUri::new(SOV_DOC_URI, name, Semver::major_minor(major, minor))
}

/// Full message type string for a message of a Sovrin family protocol.
pub(crate) fn sov_type(protocol: &ProtocolIdentifierUri, message: &str) -> String {
    protocol.message_type(message).to_string()
}

/// Registry holding every built-in handler.
pub fn builtin_registry() -> HandlerRegistry {
    HandlerRegistry::builder()
        .register(Arc::new(TrustPingHandler))
        .register(Arc::new(ConnectionsHandler))
        .register(Arc::new(DiscoveryHandler))
        .register(Arc::new(ProblemReportHandler))
        .build()
}
