pub mod ipc;
pub mod queue;
pub mod runtime;
pub mod transcript;
