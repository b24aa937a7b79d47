pub mod capture;
pub mod config;
pub mod events;
pub mod image;
pub mod logging;
pub mod utils;
