//! Line-oriented calculator engine.
//!
//! Each call to [`Engine::step`] executes at most one queued line, or one
//! iteration of a running `count` job. Console text accumulates in a drain
//! buffer; diagnostics and control notifications go through the
//! subscription table.
//!
//! Interrupts are acknowledged asynchronously: `interrupt()` only schedules
//! the escape, and the next `step()` after it lands cancels whatever is
//! running. This mirrors an engine whose escape is serviced by its own event
//! loop rather than by the caller.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::ast::Command;
use super::parser::parse_line;
use super::Result;
use crate::runtime::engine::{Engine, EngineEvent, EngineFactory, EventHandler, EventHub, EventKind};
use crate::runtime::error::{EngineError, EngineResult};

/// Debug level of evaluation errors
pub const ERROR_LEVEL: u8 = 1;

/// Debug level of the interrupt acknowledgement
pub const INTERRUPT_LEVEL: u8 = 2;

/// Debug level of `log` output
pub const LOG_LEVEL: u8 = 0;

const BANNER: &str = concat!("revive calc ", env!("CARGO_PKG_VERSION"), "\n");

#[derive(Debug, Serialize, Deserialize)]
struct CalcState {
    vars: BTreeMap<String, i64>,
}

#[derive(Debug)]
struct CountJob {
    next: i64,
    end: i64,
}

/// Reference [`Engine`] implementation
pub struct CalcEngine {
    vars: BTreeMap<String, i64>,
    pending: VecDeque<(String, bool)>,
    job: Option<CountJob>,
    output: String,
    hub: Arc<Mutex<EventHub>>,
    escape: Arc<AtomicBool>,
    completions: Arc<Mutex<VecDeque<String>>>,
    timers: Vec<JoinHandle<()>>,
}

impl CalcEngine {
    /// Create an engine with no variables
    pub fn new() -> Self {
        Self {
            vars: BTreeMap::new(),
            pending: VecDeque::new(),
            job: None,
            output: String::new(),
            hub: Arc::new(Mutex::new(EventHub::new())),
            escape: Arc::new(AtomicBool::new(false)),
            completions: Arc::new(Mutex::new(VecDeque::new())),
            timers: Vec::new(),
        }
    }

    /// Current value of a variable
    pub fn var(&self, name: &str) -> Option<i64> {
        self.vars.get(name).copied()
    }

    /// Number of `after` timers still outstanding
    pub fn pending_timers(&self) -> usize {
        self.timers.iter().filter(|t| !t.is_finished()).count()
    }

    fn emit(&self, event: EngineEvent) {
        self.hub.lock().emit(event);
    }

    fn has_work(&self) -> bool {
        self.job.is_some() || !self.pending.is_empty() || !self.completions.lock().is_empty()
    }

    fn cancel(&mut self) {
        self.job = None;
        self.pending.clear();
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }

    fn execute(&mut self, line: &str, interactive: bool) -> Result<()> {
        match parse_line(line)? {
            Command::Nop => {}
            Command::Let(name, expr) => {
                let value = expr.eval(&self.vars)?;
                self.vars.insert(name, value);
            }
            Command::Eval(expr) => {
                let value = expr.eval(&self.vars)?;
                if interactive {
                    self.output.push_str(&format!("{}\n", value));
                }
            }
            Command::Print(expr) => {
                let value = expr.eval(&self.vars)?;
                self.output.push_str(&format!("{}\n", value));
            }
            Command::Save(save) => self.emit(EngineEvent::SaveRequested(save)),
            Command::Count(expr) => {
                let end = expr.eval(&self.vars)?;
                if end >= 1 {
                    self.job = Some(CountJob { next: 1, end });
                }
            }
            Command::After(delay, expr) => {
                let value = expr.eval(&self.vars)?;
                self.schedule(Duration::from_millis(delay), value);
            }
            Command::Vars => {
                for (name, value) in &self.vars {
                    self.output.push_str(&format!("{} = {}\n", name, value));
                }
            }
            Command::Log(text) => self.emit(EngineEvent::Debug {
                text,
                level: LOG_LEVEL,
            }),
        }
        Ok(())
    }

    fn schedule(&mut self, delay: Duration, value: i64) {
        let completions = self.completions.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.timers.retain(|t| !t.is_finished());
                self.timers.push(handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    completions.lock().push_back(format!("{}\n", value));
                }));
            }
            // No event loop to wait on; complete immediately.
            Err(_) => completions.lock().push_back(format!("{}\n", value)),
        }
    }
}

impl Default for CalcEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for CalcEngine {
    fn step(&mut self) -> bool {
        if self.escape.swap(false, Ordering::SeqCst) {
            debug!(
                pending = self.pending.len(),
                job = self.job.is_some(),
                "escape taken"
            );
            self.cancel();
            self.emit(EngineEvent::Debug {
                text: "interrupted".to_string(),
                level: INTERRUPT_LEVEL,
            });
            return false;
        }

        let finished: Vec<String> = self.completions.lock().drain(..).collect();
        for text in finished {
            self.output.push_str(&text);
        }

        if let Some(job) = self.job.as_mut() {
            self.output.push_str(&format!("{}\n", job.next));
            if job.next >= job.end {
                self.job = None;
            } else {
                job.next += 1;
            }
        } else if let Some((line, interactive)) = self.pending.pop_front() {
            trace!(line = %line, "execute");
            if let Err(err) = self.execute(&line, interactive) {
                self.emit(EngineEvent::Debug {
                    text: format!("error: {}\n", err),
                    level: ERROR_LEVEL,
                });
            }
        }

        self.has_work()
    }

    fn drain_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    fn feed_input(&mut self, text: &str, interactive: bool) {
        self.pending.extend(
            text.lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| (line.to_string(), interactive)),
        );
    }

    fn interrupt(&mut self) {
        let escape = self.escape.clone();
        let hub = self.hub.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    escape.store(true, Ordering::SeqCst);
                    hub.lock().emit(EngineEvent::Interrupted);
                });
            }
            Err(_) => {
                escape.store(true, Ordering::SeqCst);
                hub.lock().emit(EngineEvent::Interrupted);
            }
        }
    }

    fn subscribe(&mut self, kind: EventKind, handler: EventHandler) {
        self.hub.lock().subscribe(kind, handler);
    }

    fn export_state(&self) -> EngineResult<Vec<u8>> {
        let state = CalcState {
            vars: self.vars.clone(),
        };
        serde_json::to_vec(&state).map_err(|e| EngineError::Export(e.to_string()))
    }

    fn import_state(&mut self, state: &[u8]) -> EngineResult<()> {
        let state: CalcState =
            serde_json::from_slice(state).map_err(|e| EngineError::InvalidState(e.to_string()))?;
        self.cancel();
        self.vars = state.vars;
        Ok(())
    }

    fn bootstrap_default(&mut self) {
        self.cancel();
        self.vars.clear();
        self.output.clear();
        self.completions.lock().clear();
        self.escape.store(false, Ordering::SeqCst);
    }

    fn announce_startup(&mut self) {
        self.output.push_str(BANNER);
    }
}

impl Drop for CalcEngine {
    fn drop(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }
}

/// Builds [`CalcEngine`] handles
#[derive(Debug, Clone, Default)]
pub struct CalcFactory {
    init_script: Option<String>,
}

impl CalcFactory {
    /// Factory without an initialization script
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `script` as non-interactive input after every reset
    pub fn with_init_script(mut self, script: impl Into<String>) -> Self {
        self.init_script = Some(script.into());
        self
    }
}

impl EngineFactory for CalcFactory {
    fn build(&self) -> Box<dyn Engine> {
        Box::new(CalcEngine::new())
    }

    fn init_script(&self) -> Option<String> {
        self.init_script.clone()
    }
}
