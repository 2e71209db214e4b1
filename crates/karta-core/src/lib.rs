pub mod chaos;
pub mod config;
pub mod events;
pub mod results;
pub mod types;
pub mod validation;

pub use chaos::*;
pub use config::*;
pub use events::*;
pub use results::*;
pub use types::*;
pub use validation::*;
