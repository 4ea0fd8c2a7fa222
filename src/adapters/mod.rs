//! Concrete adapters for the engine's process and HTTP traits

mod http;
mod process;

pub use http::UreqTransport;
pub use process::ProcessRunner;
