use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use botgate_model::BotSummary;
use chrono::{DateTime, Utc};

use crate::error::RunnerError;

/// The bot-automation runner the control plane drives. Implementations own
/// the bots; the HTTP layer only forwards commands.
pub trait BotRunner: Send + Sync {
    fn bots(&self) -> Vec<BotSummary>;

    fn bot_count(&self) -> usize {
        self.bots().len()
    }

    fn contains(&self, id: &str) -> bool;

    fn is_running(&self) -> bool;

    /// When set, bots must not be started from the control plane.
    fn console_bot_creation_disabled(&self) -> bool;

    /// Runner-wide preparation performed before any bot starts.
    fn initialize_start(&self) -> Result<(), RunnerError>;

    fn start_bot(&self, id: &str) -> Result<(), RunnerError>;
    fn stop_bot(&self, id: &str) -> Result<(), RunnerError>;
    fn pause_bot(&self, id: &str) -> Result<(), RunnerError>;
    fn resume_bot(&self, id: &str) -> Result<(), RunnerError>;
    fn reset_connection(&self, id: &str) -> Result<(), RunnerError>;

    fn start_all(&self) -> Result<(), RunnerError>;
    fn stop_all(&self) -> Result<(), RunnerError>;
}

#[derive(Debug, Clone)]
struct LocalBot {
    running: bool,
    paused: bool,
    routine: &'static str,
    last_time: DateTime<Utc>,
    last_logged: String,
    connection_resets: u32,
}

impl LocalBot {
    fn new() -> Self {
        Self {
            running: false,
            paused: false,
            routine: "Idle",
            last_time: Utc::now(),
            last_logged: String::new(),
            connection_resets: 0,
        }
    }

    fn touch(&mut self, what: &str) {
        self.last_time = Utc::now();
        self.last_logged = what.to_string();
    }
}

#[derive(Debug, Default)]
struct LocalState {
    initialized: bool,
    bots: BTreeMap<String, LocalBot>,
}

/// In-process runner that tracks bot state without driving any hardware.
#[derive(Debug, Default)]
pub struct LocalRunner {
    skip_console_bot_creation: bool,
    state: Mutex<LocalState>,
}

impl LocalRunner {
    pub fn new<I, S>(names: I, skip_console_bot_creation: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bots = names
            .into_iter()
            .map(|n| (n.into(), LocalBot::new()))
            .collect();
        Self {
            skip_console_bot_creation,
            state: Mutex::new(LocalState {
                initialized: false,
                bots,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_bot<F>(&self, id: &str, f: F) -> Result<(), RunnerError>
    where
        F: FnOnce(&mut LocalBot),
    {
        let mut state = self.lock();
        let bot = state
            .bots
            .get_mut(id)
            .ok_or_else(|| RunnerError::NotFound(id.to_string()))?;
        f(bot);
        Ok(())
    }

    pub fn connection_resets(&self, id: &str) -> Option<u32> {
        self.lock().bots.get(id).map(|b| b.connection_resets)
    }
}

impl BotRunner for LocalRunner {
    fn bots(&self) -> Vec<BotSummary> {
        self.lock()
            .bots
            .iter()
            .map(|(id, b)| BotSummary {
                id: id.clone(),
                name: id.clone(),
                running: b.running,
                paused: b.paused,
                routine: b.routine.to_string(),
                last_time: b.last_time.format("%H:%M:%S").to_string(),
                last_logged: b.last_logged.clone(),
            })
            .collect()
    }

    fn bot_count(&self) -> usize {
        self.lock().bots.len()
    }

    fn contains(&self, id: &str) -> bool {
        self.lock().bots.contains_key(id)
    }

    fn is_running(&self) -> bool {
        self.lock().bots.values().any(|b| b.running)
    }

    fn console_bot_creation_disabled(&self) -> bool {
        self.skip_console_bot_creation
    }

    fn initialize_start(&self) -> Result<(), RunnerError> {
        let mut state = self.lock();
        if !state.initialized {
            state.initialized = true;
            tracing::debug!(bots = state.bots.len(), "runner initialized");
        }
        Ok(())
    }

    fn start_bot(&self, id: &str) -> Result<(), RunnerError> {
        if !self.lock().initialized {
            return Err(RunnerError::Failed("runner not initialized".to_string()));
        }
        self.with_bot(id, |b| {
            b.running = true;
            b.paused = false;
            b.routine = "Running";
            b.touch("started");
        })?;
        tracing::info!(bot = id, "bot started");
        Ok(())
    }

    fn stop_bot(&self, id: &str) -> Result<(), RunnerError> {
        self.with_bot(id, |b| {
            b.running = false;
            b.paused = false;
            b.routine = "Idle";
            b.touch("stopped");
        })?;
        tracing::info!(bot = id, "bot stopped");
        Ok(())
    }

    fn pause_bot(&self, id: &str) -> Result<(), RunnerError> {
        self.with_bot(id, |b| {
            if b.running {
                b.paused = true;
                b.touch("paused");
            }
        })
    }

    fn resume_bot(&self, id: &str) -> Result<(), RunnerError> {
        self.with_bot(id, |b| {
            if b.paused {
                b.paused = false;
                b.touch("resumed");
            }
        })
    }

    fn reset_connection(&self, id: &str) -> Result<(), RunnerError> {
        self.with_bot(id, |b| {
            b.connection_resets = b.connection_resets.saturating_add(1);
            b.touch("connection reset");
        })
    }

    fn start_all(&self) -> Result<(), RunnerError> {
        let ids: Vec<String> = self.lock().bots.keys().cloned().collect();
        for id in ids {
            self.start_bot(&id)?;
        }
        Ok(())
    }

    fn stop_all(&self) -> Result<(), RunnerError> {
        let ids: Vec<String> = self.lock().bots.keys().cloned().collect();
        for id in ids {
            self.stop_bot(&id)?;
        }
        Ok(())
    }
}
