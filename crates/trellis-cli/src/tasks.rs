//! Promise work on the tokio `LocalSet` the CLI runs inside.

use futures::future::LocalBoxFuture;
use std::cell::RefCell;
use tokio::task::JoinHandle;
use trellis::services::TaskSpawner;

#[derive(Debug, Default)]
pub struct LocalTasks {
    pending: RefCell<Vec<JoinHandle<()>>>,
}

impl LocalTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for every spawned task, including tasks spawned while waiting.
    /// Must be called from inside the `LocalSet`.
    pub async fn idle(&self) {
        loop {
            let pending = std::mem::take(&mut *self.pending.borrow_mut());
            if pending.is_empty() {
                return;
            }
            for task in pending {
                if let Err(error) = task.await {
                    log::error!("task failed: {error}");
                }
            }
        }
    }
}

impl TaskSpawner for LocalTasks {
    fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        self.pending.borrow_mut().push(tokio::task::spawn_local(task));
    }
}
