//! Kernel transport.
//!
//! Everything needed to start an interpreter process and exchange messages
//! with it. Kernels speak Jupyter-shaped messages framed as newline-delimited
//! JSON over their stdin/stdout.
//!
//! - `codec`: line framing with a frame size limit.
//! - `message`: wire envelope and the closed [`message::ExecutionMessage`] enum.
//! - `channel`: reader task, control writer, and per-request execution stream.
//! - `spawner`: subprocess spawning with environment isolation.
//! - `launcher`: the [`launcher::KernelLauncher`] seam used by the registry.

pub mod channel;
pub mod codec;
pub mod launcher;
pub mod message;
pub mod spawner;
