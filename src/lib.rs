pub mod calls;
pub mod client;
pub mod config;
pub mod handlers;
pub mod socket;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use client::{Client, ClientError, ClientEvents};
pub use config::ClientConfig;
