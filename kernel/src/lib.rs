//! Kernel gateway lifecycle and kernel client.
//!
//! The gateway is an external Jupyter-protocol service that owns interpreter
//! kernels; this crate supervises its process, creates kernels over its HTTP
//! admin surface, and drives the per-kernel message channel to execute code
//! and reconstruct streamed results.

pub mod client;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod wire;

pub use client::{KernelClient, KernelClientConfig};
pub use error::{KernelError, KernelResult};
pub use execution::{Execution, ExecutionResult, Interrupter, OutputEvent};
pub use gateway::{KernelGateway, KernelGatewayConfig};
pub use wire::KernelMessage;
