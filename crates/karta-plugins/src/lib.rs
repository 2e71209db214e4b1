pub mod builtin;
pub mod capability;
pub mod data_merge;
pub mod error;
pub mod plugin;
pub mod registry;

pub use builtin::*;
pub use capability::*;
pub use data_merge::*;
pub use error::*;
pub use plugin::*;
pub use registry::*;
