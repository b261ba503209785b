//! Runtime support for background tasks

pub mod shutdown;

pub use shutdown::{ShutdownListener, ShutdownSignal};
