pub mod events;
pub mod hooks;
pub mod permissions;
pub mod unreads;
