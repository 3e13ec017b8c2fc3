pub mod api;
pub mod config;
pub mod conversations;
pub mod notices;
pub mod notify;
pub mod persist;
pub mod session;
pub mod transport;
