pub mod connection;
pub mod events;
pub mod features;
pub mod handler;
pub mod hub;
pub mod server;
