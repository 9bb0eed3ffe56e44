//! coedit core - block lock model, typed events, configuration and errors

pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod protocol;
pub mod types;

pub use config::*;
pub use error::{Error, Result};
pub use event::{AnalysisEvent, CoordinationEvent};
pub use model::*;
pub use protocol::*;
pub use types::*;
