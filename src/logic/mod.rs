pub mod assignment;
pub mod coerce;
pub mod diff;
pub mod executor;
pub mod manager;
pub mod queue;
pub mod registry;
pub mod usage_hash;
pub mod validate;
pub mod worker;

pub use assignment::*;
pub use coerce::*;
pub use diff::*;
pub use executor::*;
pub use manager::*;
pub use queue::*;
pub use registry::*;
pub use usage_hash::*;
pub use validate::*;
pub use worker::*;
