pub mod config;
pub mod synthesis;

pub use config::*;
pub use synthesis::*;
