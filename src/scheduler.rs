//! Scan Scheduling
//!
//! A single timer thread owns the lazy-write clock. While no dirty data
//! exists it blocks on its command channel and costs nothing; arming it sets
//! a deadline, and when the deadline passes it notifies the scan target (the
//! cache core, which posts a scan pass to the worker pool) and disarms.
//! Competing arms keep the earliest deadline. The thread holds only a weak
//! reference to its target, so a dropped cache retires the clock.

use std::sync::Weak;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::trace;

/// Receives the tick when an armed deadline expires.
pub trait ScanTarget: Send + Sync {
    fn scan_due(&self);
}

enum Command {
    Arm(Duration),
    Cancel,
    Shutdown,
}

/// Handle to the timer thread.
pub struct Scheduler {
    tx: Sender<Command>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn spawn(target: Weak<dyn ScanTarget>) -> Self {
        let (tx, rx) = unbounded::<Command>();
        let handle = thread::Builder::new()
            .name("cache-scan-timer".into())
            .spawn(move || {
                let mut deadline: Option<Instant> = None;
                loop {
                    let received = match deadline {
                        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                        Some(when) => {
                            rx.recv_timeout(when.saturating_duration_since(Instant::now()))
                        }
                    };
                    match received {
                        Ok(Command::Arm(delay)) => {
                            let proposed = Instant::now() + delay;
                            deadline = Some(match deadline {
                                Some(current) => current.min(proposed),
                                None => proposed,
                            });
                        }
                        Ok(Command::Cancel) => deadline = None,
                        Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
                        Err(RecvTimeoutError::Timeout) => {
                            deadline = None;
                            let Some(target) = target.upgrade() else {
                                return;
                            };
                            trace!("scan deadline fired");
                            target.scan_due();
                        }
                    }
                }
            })
            .expect("spawn scan timer");
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Arm the clock `delay` from now. If already armed, the earlier deadline
    /// wins.
    pub fn schedule(&self, delay: Duration) {
        let _ = self.tx.send(Command::Arm(delay));
    }

    /// Disarm without firing.
    pub fn cancel(&self) {
        let _ = self.tx.send(Command::Cancel);
    }

    /// Stop the clock and join the thread.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
