pub mod config;
pub mod coordinator;
pub mod rejection;
pub mod stats;


pub use config::*;
pub use coordinator::*;
pub use rejection::*;
pub use stats::*;
