pub mod file_store;
pub mod manager;
pub mod staleness;
pub mod store;
pub mod types;


pub use file_store::*;
pub use manager::*;
pub use staleness::*;
pub use store::*;
pub use types::*;
