pub mod memory;
pub mod postgres;
pub mod schema_cache;
pub mod traits;

pub use memory::*;
pub use postgres::*;
pub use schema_cache::*;
pub use traits::*;
