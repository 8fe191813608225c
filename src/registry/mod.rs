pub mod client;
pub mod message;
pub mod server;
