pub mod app;
pub mod error;
pub mod logwatch;
pub mod monitor;
pub mod relay;
pub mod sink;
