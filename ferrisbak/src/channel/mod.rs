//! Channel layer for pattern matching over interactive shells.
//!
//! This module implements the expect primitives automation scripts use to
//! drive a device shell: wait for a pattern, send a line, read a line.

mod buffer;
mod patterns;
mod session;

pub use buffer::SessionBuffer;
pub use patterns::Pattern;
pub use session::{InteractiveSession, SessionConfig};
