//! Conversation windows
//!
//! Messages are buffered per channel and flushed as one window when the
//! channel goes quiet, the window grows too large, or it stays open too long.

mod scheduler;

pub use scheduler::{FlushReason, FlushedWindow, WindowScheduler, WindowSink, WindowState};
