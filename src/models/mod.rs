// src/models/mod.rs
pub mod driver;
pub mod events;
pub mod messages;
pub mod ride;

pub use driver::*;
pub use events::*;
pub use ride::*;
