//! This module contains utilities for testing code based on the delivery core. They are used
//!  for testing the core itself, but they are also exported for application testing.

pub mod member;
pub mod recording_handler;
pub mod lossy_link;
