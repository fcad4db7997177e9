//! Instrument status subsystems the script protocols consult.
//!
//! - [`interactive`]: show-errors/prompts settings and the execution state
//! - [`display`]: front-panel operator feedback
//! - [`version`]: identity parsing and model family classification

pub mod display;
pub mod interactive;
pub mod version;

pub use display::{NoDisplay, StatusDisplay, TspDisplay};
pub use interactive::{ExecutionState, InteractiveSubsystem};
pub use version::{InstrumentModelFamily, VersionInfo};
