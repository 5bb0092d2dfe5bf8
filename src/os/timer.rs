//! Named software timers.
//!
//! Every timer is driven by its own tokio task which owns the deadline and
//! listens for control commands on an unbounded channel, the same shape as
//! the scheduler loop elsewhere in the crate. Callbacks run on that task, never
//! in interrupt context, and must not block; the core's callbacks only post
//! onto the control bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, trace};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::error::{MeshxError, Result};

/// Expiry callback. Receives the timer name; any other argument is captured.
pub type TimerCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerInfo {
    pub name: String,
    pub period: Duration,
    pub auto_reload: bool,
    pub armed: bool,
    pub fired: u64,
}

enum TimerCommand {
    Start,
    Stop,
    Reset,
    ChangePeriod(Duration),
    Delete,
}

type Registry = Arc<Mutex<HashMap<u64, TimerInfo>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<u64, TimerInfo>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Creates timers and keeps a snapshot of every live one.
#[derive(Clone, Default)]
pub struct TimerService {
    next_id: Arc<AtomicU64>,
    live: Registry,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a disarmed timer. Must be called from within a tokio runtime.
    pub fn create(
        &self,
        name: &str,
        period: Duration,
        auto_reload: bool,
        callback: TimerCallback,
    ) -> Result<OsTimer> {
        if period.is_zero() {
            return Err(MeshxError::invalid_arg(format!(
                "timer '{}' needs a non-zero period",
                name
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.live).insert(
            id,
            TimerInfo {
                name: name.to_string(),
                period,
                auto_reload,
                armed: false,
                fired: 0,
            },
        );

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_timer(
            id,
            name.to_string(),
            period,
            auto_reload,
            callback,
            rx,
            self.live.clone(),
        ));
        debug!(target: "meshx::timer", "created timer '{}' period={:?} reload={}", name, period, auto_reload);
        Ok(OsTimer {
            id,
            name: name.to_string(),
            tx,
            live: self.live.clone(),
        })
    }

    pub fn snapshot(&self) -> Vec<TimerInfo> {
        let mut all: Vec<(u64, TimerInfo)> = lock(&self.live)
            .iter()
            .map(|(id, info)| (*id, info.clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all.into_iter().map(|(_, info)| info).collect()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.live).len()
    }
}

/// Handle to one timer. Cloning shares the timer.
#[derive(Clone)]
pub struct OsTimer {
    id: u64,
    name: String,
    tx: mpsc::UnboundedSender<TimerCommand>,
    live: Registry,
}

impl std::fmt::Debug for OsTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsTimer")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl OsTimer {
    fn command(&self, cmd: TimerCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| MeshxError::invalid_state(format!("timer '{}' deleted", self.name)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arm the timer; an armed timer restarts its window.
    pub fn start(&self) -> Result<()> {
        self.command(TimerCommand::Start)
    }

    pub fn stop(&self) -> Result<()> {
        self.command(TimerCommand::Stop)
    }

    /// Restart the window from now, arming the timer if needed.
    pub fn reset(&self) -> Result<()> {
        self.command(TimerCommand::Reset)
    }

    /// Set a new period and arm the timer with it.
    pub fn change_period(&self, period: Duration) -> Result<()> {
        if period.is_zero() {
            return Err(MeshxError::invalid_arg("timer period must be non-zero"));
        }
        self.command(TimerCommand::ChangePeriod(period))
    }

    pub fn delete(&self) -> Result<()> {
        self.command(TimerCommand::Delete)
    }

    pub fn info(&self) -> Option<TimerInfo> {
        lock(&self.live).get(&self.id).cloned()
    }

    pub fn is_armed(&self) -> bool {
        self.info().map(|i| i.armed).unwrap_or(false)
    }
}

async fn run_timer(
    id: u64,
    name: String,
    mut period: Duration,
    auto_reload: bool,
    callback: TimerCallback,
    mut rx: mpsc::UnboundedReceiver<TimerCommand>,
    live: Registry,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(TimerCommand::Start) | Some(TimerCommand::Reset) => {
                        deadline = Some(Instant::now() + period);
                    }
                    Some(TimerCommand::Stop) => deadline = None,
                    Some(TimerCommand::ChangePeriod(p)) => {
                        period = p;
                        deadline = Some(Instant::now() + period);
                    }
                    Some(TimerCommand::Delete) | None => break,
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                trace!(target: "meshx::timer", "timer '{}' fired", name);
                callback(&name);
                deadline = match deadline {
                    Some(at) if auto_reload => Some(at + period),
                    _ => None,
                };
                if let Some(info) = lock(&live).get_mut(&id) {
                    info.fired += 1;
                }
            }
        }
        if let Some(info) = lock(&live).get_mut(&id) {
            info.armed = deadline.is_some();
            info.period = period;
        }
    }
    lock(&live).remove(&id);
    debug!(target: "meshx::timer", "timer '{}' deleted", name);
}
