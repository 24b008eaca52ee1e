pub mod aggregator;
pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod period;
pub mod resolver;
pub mod service;
pub mod store;

pub use error::{PeakError, Result};
