pub mod autodiff;
pub mod data;
pub mod diagnostics;
pub mod error;
pub mod graph;
pub mod model;
pub mod nuts;
pub mod predict;
pub mod progress;
pub mod sampler;

pub use error::{Error, Result};
