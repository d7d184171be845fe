pub mod cache;
pub mod server;
pub mod upstream;

pub use server::{DnsServer, DnsServerConfig};
