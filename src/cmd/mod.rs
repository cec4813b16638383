//! CLI command implementations.
//!
//! | Module   | Commands handled       |
//! |----------|------------------------|
//! | `job`    | `Serve`, `Run`         |
//! | `state`  | `Status`, `Cleanup`    |

pub mod job;
pub mod state;

pub use job::{cmd_run, cmd_serve};
pub use state::{cmd_cleanup, cmd_status};
