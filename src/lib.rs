pub mod budget;
pub mod config;
pub mod errors;
pub mod util;
