pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod util;

pub use error::{Error, GraphError, Result};
