pub mod app;
pub mod config;
pub mod config_io;
pub mod download;
pub mod logging;
pub mod single_instance;
pub mod transfer;
pub mod upload;

pub use app::TransferCore;
