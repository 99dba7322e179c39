pub mod chat;
pub mod intent;
pub mod memory;
pub mod organization;
pub mod session;
pub mod tool;
