//! winjob core - platform-independent data model for Windows process and
//! job-object management.
//!
//! This crate holds everything that does not require a live kernel handle:
//! the error taxonomy, command-line escaping, the raw job-object information
//! layouts, the typed limit/notification/accounting translators, the
//! create-process settings object, and the redirected-stream line decoder.

mod accounting;
mod config;
mod error;
mod escape;
mod limits;
mod notify;
pub mod raw;
mod reader;

pub use accounting::*;
pub use config::*;
pub use error::*;
pub use escape::*;
pub use limits::*;
pub use notify::*;
pub use reader::*;
