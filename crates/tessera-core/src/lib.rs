//! tessera-core: shared types, wire format, and identity primitives.
//! All other Tessera crates depend on this one.

pub mod config;
pub mod digest;
pub mod headers;
pub mod nonce;
pub mod wire;

pub use headers::SystemHeaders;
pub use nonce::Nonce;
