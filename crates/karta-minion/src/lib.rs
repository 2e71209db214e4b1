pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;

pub use client::*;
pub use error::*;
pub use protocol::*;
pub use registry::*;
pub use server::*;
pub use service::*;
