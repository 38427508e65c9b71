//! Named recurring timers.
//!
//! Each running timer periodically executes one raise command. A firing only
//! evaluates the event against the extent and hands it to the instance's
//! event queue (or the event handler); the active state is only ever changed
//! by the instance worker when it processes that event.

use crate::command::{ActionCommand, Command, CommandQueue};
use crate::error::RuntimeError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Timers of one instance, keyed by timeout action name.
pub struct TimeoutManager {
    runtime: Handle,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TimeoutManager {
    /// Creates a manager that runs its timers on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a timer that executes `command` every `delay`, first after one
    /// full delay.
    pub fn start(
        &self,
        name: &str,
        delay: Duration,
        command: ActionCommand,
    ) -> Result<(), RuntimeError> {
        if !command.is_raise() {
            return Err(RuntimeError::InvalidTimer {
                name: name.to_string(),
                reason: format!("expected a raise action, got {}", command.action().kind()),
            });
        }
        if delay.is_zero() {
            return Err(RuntimeError::InvalidTimer {
                name: name.to_string(),
                reason: "delay must be positive".to_string(),
            });
        }

        let mut timers = self.timers.lock();
        if timers.contains_key(name) {
            return Err(RuntimeError::DuplicateTimer {
                name: name.to_string(),
            });
        }

        let timer_name = name.to_string();
        let handle = self.runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + delay, delay);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                tracing::trace!("Timer {} fired", timer_name);

                let mut queue = CommandQueue::new();
                queue.push_front_all(vec![Command::Action(command.clone())]);
                queue.run_detached();
            }
        });

        timers.insert(name.to_string(), handle);
        tracing::debug!("Started timer {} ({}ms)", name, delay.as_millis());
        Ok(())
    }

    /// Cancels and removes one timer.
    pub fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        let handle = self
            .timers
            .lock()
            .remove(name)
            .ok_or_else(|| RuntimeError::TimerNotFound {
                name: name.to_string(),
            })?;
        handle.abort();
        tracing::debug!("Stopped timer {}", name);
        Ok(())
    }

    /// Cancels every running timer.
    pub fn stop_all(&self) {
        let mut timers = self.timers.lock();
        if timers.is_empty() {
            return;
        }
        for (_, handle) in timers.drain() {
            handle.abort();
        }
        tracing::debug!("Stopped all timers");
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.timers.lock().contains_key(name)
    }

    /// Returns the names of the running timers.
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.timers.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Drop for TimeoutManager {
    fn drop(&mut self) {
        for (_, handle) in self.timers.get_mut().drain() {
            handle.abort();
        }
    }
}

/// Worker pool timers run on.
///
/// With a positive thread count the pool is a dedicated multi-threaded tokio
/// runtime; with zero, timers share the caller's runtime.
pub struct TimerPool {
    runtime: Option<tokio::runtime::Runtime>,
    handle: Handle,
}

impl TimerPool {
    pub fn new(worker_threads: usize) -> Result<Self, RuntimeError> {
        if worker_threads == 0 {
            let handle = Handle::try_current()
                .map_err(|e| RuntimeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            return Ok(Self {
                runtime: None,
                handle,
            });
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("csm-timer")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();

        tracing::debug!("Started timer pool with {} threads", worker_threads);
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl Drop for TimerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
