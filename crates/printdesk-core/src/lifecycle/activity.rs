//! Debounced user-activity signal.
//!
//! Raw interaction events (pointer, key, scroll) arrive far faster than the
//! session needs to hear about them. `ActivityMonitor` collapses a burst into
//! one callback fired after the window has passed with no further events
//! (trailing edge): every new event inside the window cancels the pending
//! call and restarts the wait.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Kind of raw interaction observed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySignal {
    Pointer,
    Key,
    Scroll,
    Touch,
}

#[derive(Debug, Clone, Copy)]
pub struct ActivityMonitor {
    window: Duration,
}

impl ActivityMonitor {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Start listening. `on_active` runs on the tokio runtime after each
    /// quiet period that followed at least one event.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(&self, on_active: F) -> ActivityHandle
    where
        F: Fn() + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<ActivitySignal>();
        let window = self.window;

        let task = tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut last = first;
                let mut burst = 1usize;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(window) => {
                            debug!(burst, last = ?last, "Activity tick");
                            on_active();
                            break;
                        }
                        next = rx.recv() => match next {
                            Some(signal) => {
                                last = signal;
                                burst += 1;
                            }
                            // Sender dropped mid-burst: the pending tick is cancelled.
                            None => return,
                        },
                    }
                }
            }
        });

        ActivityHandle {
            tx: Some(tx),
            task: Some(task),
        }
    }
}

/// Live listener registration. Dropping it detaches the listener.
#[derive(Debug)]
pub struct ActivityHandle {
    tx: Option<mpsc::UnboundedSender<ActivitySignal>>,
    task: Option<JoinHandle<()>>,
}

impl ActivityHandle {
    /// Feed one raw event. Ignored after `stop`.
    pub fn notify(&self, signal: ActivitySignal) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(signal);
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Detach: no callback fires after this returns, including one that was
    /// pending for the current burst.
    pub fn stop(&mut self) {
        self.tx.take();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ActivityHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
