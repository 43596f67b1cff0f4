//! MCP provider clients for the codebroker tool server.
//!
//! A *provider* is an external MCP server that exposes a catalog of tools.
//! This crate parses provider connection params, substitutes environment
//! placeholders in them, and drives the MCP protocol over one of three
//! transports (stdio child process, SSE, streamable HTTP).

pub mod client;
pub mod error;
pub mod params;
pub mod vars;

pub use client::ProviderClient;
pub use error::{ProviderError, ProviderResult};
pub use params::{detect_transport, ProviderParams, TransportKind};
pub use vars::{replace_variables, Substitution};
