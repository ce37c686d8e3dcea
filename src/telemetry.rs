//! Tracing setup and span constructors.

use crate::config::LogFormat;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Standardized span constructors for overlay observability.
pub mod spans {
    use lace_proto::NodeId;
    use std::net::SocketAddr;
    use tracing::{Span, debug_span, info_span};

    /// Span covering the tasks of one running node.
    pub fn node(id: &NodeId, addr: SocketAddr) -> Span {
        info_span!("node", id = %id.short(), addr = %addr)
    }

    /// Span for handling one inbound envelope.
    pub fn message(kind: &str, from: SocketAddr) -> Span {
        debug_span!("message", kind = %kind, from = %from)
    }
}
