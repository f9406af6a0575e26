//! Process-wide error sink.
//!
//! Some failures have nowhere to go: a demand signal that could not be
//! delivered, an error frame that could not be written to a dead connection.
//! Those are handed to a single handler with process lifetime. The default
//! handler logs them; [`set_handler`] installs a custom one once at startup.

use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;

use crate::error::StreamError;

/// Handler invoked for errors that cannot be routed through a stream.
pub type ErrorHandler = Box<dyn Fn(&StreamError) + Send + Sync + 'static>;

static HANDLER: OnceLock<ErrorHandler> = OnceLock::new();

/// Install the process-wide handler.
///
/// Returns `false` if a handler was already installed; the first one wins.
pub fn set_handler<F>(handler: F) -> bool
where
    F: Fn(&StreamError) + Send + Sync + 'static,
{
    HANDLER.set(Box::new(handler)).is_ok()
}

/// Report an error that has no stream to travel on. Never panics.
pub fn report(err: StreamError) {
    match HANDLER.get() {
        Some(handler) => report_with(handler.as_ref(), &err),
        None => tracing::error!(error = %err, "undeliverable stream error"),
    }
}

/// Run `handler` on `err`, containing any panic it raises.
fn report_with(handler: &(dyn Fn(&StreamError) + Send + Sync), err: &StreamError) {
    if panic::catch_unwind(AssertUnwindSafe(|| handler(err))).is_err() {
        tracing::error!(error = %err, "error handler panicked while reporting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    #[serial]
    fn test_report_reaches_installed_handler() {
        // The handler is process-global and other tests may report from their
        // own threads, so count per thread: the handler runs on the caller's.
        thread_local! {
            static SEEN: Cell<usize> = const { Cell::new(0) };
        }
        let _ = set_handler(|_| SEEN.with(|s| s.set(s.get() + 1)));

        let before = SEEN.with(Cell::get);
        report(StreamError::Closed);
        report(StreamError::protocol("late"));
        assert_eq!(SEEN.with(Cell::get) - before, 2);

        // Second install is refused
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        assert!(!set_handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        report(StreamError::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let calls = AtomicUsize::new(0);
        let handler = |_: &StreamError| {
            calls.fetch_add(1, Ordering::SeqCst);
            panic!("handler bug");
        };
        report_with(&handler, &StreamError::Closed);
        report_with(&handler, &StreamError::protocol("again"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
