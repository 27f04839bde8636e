pub mod bridge;
pub mod http;
pub mod lightning;
pub mod logging;
pub mod monero;
pub mod rate;
