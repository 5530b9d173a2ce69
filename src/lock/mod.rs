pub mod keyed;
pub mod registry;


pub use keyed::*;
pub use registry::*;
