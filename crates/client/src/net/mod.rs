pub mod client;
pub mod config;
pub mod input;

pub use client::NetworkClient;
pub use config::ClientConfig;
pub use input::{ScriptedInput, WalkPattern};
