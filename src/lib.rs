pub type Result<T> = std::result::Result<T, Error>;

pub use error::Error;

pub mod config;
pub mod dialer;
pub mod ech;
pub mod error;
pub mod http;
pub mod logging;
pub mod msg;
pub mod pool;
pub mod reply;
pub mod request;
pub mod server;
pub mod socks5;
pub mod tunnel;
