pub mod chunk;
pub mod handoff;
pub mod session;
pub mod tenant;
