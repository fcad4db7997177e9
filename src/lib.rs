//! Script deployment and session synchronization for TSP instruments.
//!
//! The crate talks to Test Script Processor instruments over a line-oriented
//! transport and deploys firmware scripts to them:
//! - [`session`]: the transport seam, the synchronized [`session::TspSession`]
//!   and the in-process simulator used by the tests
//! - [`chunk`]: line classification of script sources (comments, block
//!   comments, live syntax)
//! - [`firmware`]: the load, upload and save protocols driven by
//!   [`firmware::FirmwareManager`]
//! - [`node`] and [`script`]: TSP-Link topology, byte-code converters and
//!   per-node script state
//! - [`subsystem`]: interactive settings, identity parsing and the front panel
//! - [`config`], [`logging`], [`error`] and [`error_recovery`]: ambient plumbing
//!
//! # Example
//!
//! ```
//! use tsp_firmware::config::{ProtocolConfig, SessionConfig};
//! use tsp_firmware::firmware::FirmwareManager;
//! use tsp_firmware::session::{MockInstrument, TspSession};
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let mock = MockInstrument::new();
//!     mock.define(1, "foo");
//!     let session = TspSession::new(mock.clone(), SessionConfig::immediate());
//!     let manager = FirmwareManager::new(session, ProtocolConfig::immediate());
//!     manager.nill_object("foo").await.unwrap();
//!     assert!(!mock.is_defined(1, "foo"));
//! });
//! ```

pub mod chunk;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod firmware;
pub mod logging;
pub mod node;
pub mod script;
pub mod session;
pub mod subsystem;

pub use error::{TspError, TspResult};
