//! Recurring background tasks. The scheduler only owns timers; the task
//! bodies are free functions so tests can invoke them directly, without
//! waiting on a clock.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::broadcast::Broadcaster;
use crate::fraud::flags::FlaggedStore;
use crate::registry::connections::ConnectionRegistry;

pub struct Scheduler {
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { tasks: Mutex::new(Vec::new()) }
    }

    /// Runs `task` every `period` until shutdown. The first run happens one
    /// full period after spawn.
    pub fn spawn_recurring<F, Fut>(&self, name: &'static str, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // consume immediate first tick
            loop {
                interval.tick().await;
                task().await;
            }
        });
        debug!(task = name, period_secs = period.as_secs(), "recurring task armed");
        self.tasks.lock().unwrap().push((name, handle));
    }

    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (name, handle) in tasks.drain(..) {
            debug!(task = name, "recurring task cancelled");
            handle.abort();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Heartbeat sweep body: evicts connections silent past `timeout` and runs
/// full disconnect cleanup (rooms, viewer_left to remaining members) for
/// each. Returns how many were evicted.
pub fn sweep_stale_connections(
    connections: &ConnectionRegistry,
    broadcaster: &Broadcaster,
    timeout: Duration,
) -> usize {
    let evicted = connections.sweep_stale(timeout);
    for conn_id in &evicted {
        broadcaster.drop_connection(*conn_id);
    }
    if !evicted.is_empty() {
        info!(count = evicted.len(), "evicted stale connections");
    }
    evicted.len()
}

/// Flag purge body.
pub fn purge_expired_flags(flags: &FlaggedStore) -> usize {
    let purged = flags.purge_expired();
    if purged > 0 {
        info!(count = purged, "purged expired flags");
    }
    purged
}
