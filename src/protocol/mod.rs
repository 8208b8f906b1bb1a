//! Line-oriented chat protocol.
//!
//! - `framer`: splits the inbound byte stream into `\n`-terminated lines
//! - `command`: classifies a trimmed line and builds the reply

pub mod command;
pub mod framer;

pub use command::{trim, Command, Next, TIMESTAMP_FORMAT};
pub use framer::{FrameError, LineFramer};
