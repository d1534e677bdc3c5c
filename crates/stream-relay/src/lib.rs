pub mod config;
pub mod mcp;
pub mod server;

pub use config::Config;
pub use server::Server;
