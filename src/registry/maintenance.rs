use crate::core::{Result, StageError};
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{Level, event};

/// Cancellable periodic task driving registry maintenance.
///
/// The tick closure returns `false` once there is nothing left to maintain,
/// which ends the task without a stop signal.
pub struct MaintenanceWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    /// Spawns the task on the current tokio runtime. The first tick fires one
    /// full `period` after spawning.
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            let Some(first_tick) = Instant::now().checked_add(period) else {
                event!(Level::ERROR, period = ?period, "maintenance period out of range, no ticks scheduled");
                let _ = stop_rx.await;
                return;
            };
            let mut ticker = interval_at(first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = ticker.tick() => {
                        if !tick().await {
                            break;
                        }
                    }
                }
            }
            event!(Level::DEBUG, "maintenance worker stopped");
        });

        Self {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_none_or(|join_handle| join_handle.is_finished())
    }

    /// Signals the worker to stop and waits for the current tick to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| StageError::Lock(format!("maintenance worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
