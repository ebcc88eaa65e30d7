//! Background-thread lifecycle for long-lived and one-shot roles.
//!
//! A [`ThreadManager`] owns at most one running [`Widget`] at a time. The
//! widget is built fresh on every `start`, runs on its own named thread, and
//! is asked to wind down by `stop`.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::PeerError;

/// A role that can run on a background thread.
pub trait Widget: Send + Sync + 'static {
    /// Do the role's work. Returns when finished or after `stop`.
    fn run(&self);

    /// Ask a running `run` to return. Must be safe to call at any time,
    /// any number of times.
    fn stop(&self);
}

type Factory<W> = Box<dyn Fn() -> Result<W, PeerError> + Send + Sync>;

struct Running<W> {
    widget: Arc<W>,
    handle: JoinHandle<()>,
}

/// Starts and stops one widget on a dedicated thread.
pub struct ThreadManager<W: Widget> {
    name: String,
    factory: Factory<W>,
    running: Mutex<Option<Running<W>>>,
}

impl<W: Widget> ThreadManager<W> {
    /// A manager that builds its widget with `factory` on each start.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<W, PeerError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Box::new(factory),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build a widget and run it on a new thread. Returns immediately.
    ///
    /// Fails with [`PeerError::AlreadyStarted`] while a previous run is
    /// still alive. A finished run is reaped and replaced.
    pub fn start(&self) -> Result<Arc<W>, PeerError> {
        let mut slot = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = slot.take() {
            if !prev.handle.is_finished() {
                *slot = Some(prev);
                return Err(PeerError::AlreadyStarted(self.name.clone()));
            }
            let _ = prev.handle.join();
        }

        let widget = Arc::new((self.factory)()?);
        let worker = Arc::clone(&widget);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker.run())?;

        debug!(name = %self.name, "widget started");
        *slot = Some(Running {
            widget: Arc::clone(&widget),
            handle,
        });
        Ok(widget)
    }

    /// Stop the widget and wait for its thread.
    ///
    /// A no-op if nothing was started or the previous run already ended.
    pub fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { widget, handle }) = running else {
            return;
        };

        widget.stop();
        if handle.thread().id() == thread::current().id() {
            // Called from inside run(); the thread ends when run returns.
            return;
        }
        if handle.join().is_err() {
            warn!(name = %self.name, "widget thread panicked");
        }
        debug!(name = %self.name, "widget stopped");
    }

    /// Whether a started widget is still running.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// The current widget, if one was started and not yet stopped.
    pub fn widget(&self) -> Option<Arc<W>> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| Arc::clone(&r.widget))
    }

    /// Wait for the current run to finish on its own.
    pub fn join(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Running { handle, .. }) = running {
            if handle.join().is_err() {
                warn!(name = %self.name, "widget thread panicked");
            }
        }
    }
}

impl<W: Widget> Drop for ThreadManager<W> {
    fn drop(&mut self) {
        // Detach rather than block; the widget keeps its own Arc.
        if let Some(running) = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            running.widget.stop();
        }
    }
}
