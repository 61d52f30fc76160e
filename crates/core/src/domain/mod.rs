pub mod conversation;
pub mod delivery;
pub mod request;
pub mod session;
