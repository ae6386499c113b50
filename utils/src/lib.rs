//! This module implements features common to the filesystem-creation tools.

pub mod disk;
pub mod util;

use std::fmt;
use std::process::exit;

/// Writes an error to stderr, then exits with status `1`.
pub fn error<M: fmt::Display>(bin: &str, msg: M) -> ! {
    eprintln!("{bin}: error: {msg}");
    exit(1);
}
