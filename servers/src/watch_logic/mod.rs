pub mod config;
pub mod downstream;
pub mod logger;
pub mod model;
pub mod state;
pub mod upstream;
