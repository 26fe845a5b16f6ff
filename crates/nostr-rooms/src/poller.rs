//! Fixed-interval polling tasks with explicit start/stop handles.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Result, DEFAULT_FETCH_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_PUBLISH_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub fetch_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

/// Handle to a running poll task. Dropping it aborts the task.
pub struct PollHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Signals the task and waits for it to exit. An in-flight job is dropped.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Runs `job` on every tick of `interval`, starting immediately. Ticks are
/// serialized; a failed job is logged and retried on the next tick.
pub fn spawn_poll<F, Fut>(name: impl Into<String>, interval: Duration, mut job: F) -> PollHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.into();
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let task_name = name.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(subscription = %task_name, ?interval, "poll subscription started");

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                result = job() => match result {
                    Ok(()) => debug!(subscription = %task_name, "poll tick done"),
                    Err(e) => warn!(subscription = %task_name, error = %e, "poll tick failed"),
                },
            }
        }

        info!(subscription = %task_name, "poll subscription stopped");
    });

    PollHandle {
        name,
        stop_tx,
        task: Some(task),
    }
}

/// Named poll subscriptions. Starting a name that is already running replaces it.
#[derive(Default)]
pub struct PollRegistry {
    handles: HashMap<String, PollHandle>,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start<F, Fut>(&mut self, name: impl Into<String>, interval: Duration, job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        if let Some(previous) = self.handles.remove(&name) {
            previous.stop().await;
        }
        let handle = spawn_poll(name.clone(), interval, job);
        self.handles.insert(name, handle);
    }

    /// Adds an already spawned task under its own name.
    pub async fn insert(&mut self, handle: PollHandle) {
        if let Some(previous) = self.handles.remove(handle.name()) {
            previous.stop().await;
        }
        self.handles.insert(handle.name().to_string(), handle);
    }

    pub async fn stop(&mut self, name: &str) -> bool {
        match self.handles.remove(name) {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.stop().await;
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.handles
            .get(name)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handles
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
