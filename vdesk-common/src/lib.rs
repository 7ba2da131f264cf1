//! # vdesk Common
//!
//! Shared utilities for the vdesk control plane components.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use vdesk_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! tracing::info!(disk_id = "disk-1", "Disk attached");
//! ```

pub mod logging;

pub use logging::{init_logging, LogFormat};
