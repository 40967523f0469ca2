pub mod branch;
pub mod change;
pub mod common;
pub mod container;
pub mod event;
pub mod job;
pub mod schema;
pub mod value;

pub use branch::*;
pub use change::*;
pub use common::*;
pub use container::*;
pub use event::*;
pub use job::*;
pub use schema::*;
pub use value::*;
