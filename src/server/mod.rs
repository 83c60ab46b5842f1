mod error;
mod headers;
mod http;
mod limit;
mod start;

pub use start::{HttpPolicy, ServerConfig, start_server};
