//! Ambient helpers

pub mod logging;
