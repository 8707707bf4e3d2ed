pub mod client;
pub mod config;
pub mod gateway;
pub mod hooks;

pub use client::*;
pub use config::*;
pub use gateway::*;
pub use hooks::*;
