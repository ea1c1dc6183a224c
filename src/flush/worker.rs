//! Background flush worker
//!
//! One long-lived thread that runs a flush cycle on every tick until stopped.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use crossbeam::select;
use tracing::debug;

use crate::error::Result;
use super::FlushCoordinator;

/// Handle to the timer-driven flush thread
///
/// Ticks that arrive while a cycle is still running are dropped, so cycles
/// never queue up behind a slow database.
pub struct FlushWorker {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FlushWorker {
    pub fn spawn<V>(coordinator: Arc<FlushCoordinator<V>>, interval: Duration) -> Result<Self>
    where
        V: Clone + Send + Sync + 'static,
    {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let ticker = channel::tick(interval);

        let handle = thread::Builder::new()
            .name("deferkv-flush".to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "Flush worker started");
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            coordinator.run_cycle();
                        }
                        // Sender dropped
                        recv(stop_rx) -> _ => break,
                    }
                }
                debug!("Flush worker stopped");
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread, waiting for an in-progress cycle to finish
    pub fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
