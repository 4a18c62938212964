//! Per-invocation bootstrap context: where progress goes and how the user
//! interrupts.

use std::{
    fmt,
    io::{self, Write},
    sync::{Arc, Mutex},
};

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Shared sink for user-facing progress lines.
#[derive(Clone)]
pub struct Progress {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Progress {
    /// Write progress lines to `sink`.
    #[must_use]
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    /// Write one line of progress.
    ///
    /// Progress is advisory: a failed write is logged and otherwise ignored.
    pub fn line(&self, args: fmt::Arguments<'_>) {
        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(error) = writeln!(sink, "{args}").and_then(|()| sink.flush()) {
            warn!(%error, "failed to write progress");
        }
    }

    /// Copy raw text, such as remote script output, to the sink.
    pub fn text(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(error) = sink.write_all(text.as_bytes()).and_then(|()| sink.flush()) {
            warn!(%error, "failed to write progress");
        }
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("Progress") }
}

/// Context shared by every phase of one bootstrap attempt.
#[derive(Debug, Clone)]
pub struct BootstrapContext {
    progress: Progress,
    interrupt: CancellationToken,
}

impl BootstrapContext {
    /// Build a context writing progress to `progress` and observing
    /// `interrupt`.
    #[must_use]
    pub const fn new(progress: Progress, interrupt: CancellationToken) -> Self {
        Self {
            progress,
            interrupt,
        }
    }

    /// Context writing progress to standard error.
    #[must_use]
    pub fn stderr(interrupt: CancellationToken) -> Self {
        Self::new(Progress::new(io::stderr()), interrupt)
    }

    /// The progress sink.
    #[must_use]
    pub const fn progress(&self) -> &Progress { &self.progress }

    /// Token cancelled when the user interrupts the bootstrap.
    #[must_use]
    pub const fn interrupt(&self) -> &CancellationToken { &self.interrupt }
}
