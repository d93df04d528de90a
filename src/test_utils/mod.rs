//! Test utilities for `camstream`
//!
//! Provides synthetic MJPEG stream generation and scripted transport and
//! credential doubles for exercising sessions and controllers without a
//! camera backend.

pub mod mock;
pub mod stream_generator;

pub use mock::*;
pub use stream_generator::*;
