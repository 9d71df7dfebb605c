//! CLI command implementations

pub mod config;
pub mod image;
pub mod scratch;

pub use config::execute as config;
pub use image::execute as image;
pub use scratch::execute as scratch;
