//! Operator interrupt plumbing.
//!
//! A [`CancelToken`] is a shared flag that long-running steps (child process
//! waits, model calls) poll. The CLI wires SIGINT to it so Ctrl-C stops the
//! current action instead of killing the session.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Re-arm before the next operator action.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Route SIGINT into this token for the rest of the process lifetime.
    pub fn register_interrupt(&self) -> io::Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.flag))?;
        Ok(())
    }
}
