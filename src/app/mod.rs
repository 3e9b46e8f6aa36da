//! Application layer: the tunnel runtime driving the transport layer

mod runtime;

pub use runtime::Runtime;
