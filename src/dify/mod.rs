pub mod client;
pub mod types;

pub use client::DifyClient;
pub use types::*;
