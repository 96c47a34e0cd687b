//! Domain model module declarations.

pub mod checkpoint;
pub mod message;
pub mod session;
