pub mod campaign;
pub mod clock;
pub mod config;
pub mod http;
pub mod kv;
pub mod mail;
pub mod store;

pub use campaign::{Core, CoreHandle, CoreOptions};
pub use config::Config;
