// ABOUTME: Library half of the reprobox binary: log setup and terminal rendering
// ABOUTME: Kept separate from the clap entry point so formatting can be unit tested

pub mod logging;
pub mod render;

pub use logging::{init_tracing, LogFormat};
