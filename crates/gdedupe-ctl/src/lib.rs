//! gdedupectl: control surface for gdedupe devices
//!
//! Runs a small line-oriented command language against one dedupe class,
//! either from a script (`exec`) or interactively (`shell`).

pub mod cli;
pub mod session;

pub use cli::{Cli, Command};
pub use session::{parse_size, Session};
