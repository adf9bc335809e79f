//! Cooperative run-to-quiescence scheduler
//!
//! Drives one session's engine for the duration of an invocation:
//!
//! ```text
//! loop {
//!     1. drain output, step the engine, drain again
//!     2. more work        -> Running, yield to the host runtime
//!     3. queued typeahead -> feed it (AwaitingMoreInput), yield
//!     4. otherwise        -> Idle: wait `idle_grace` or a wake-up, re-check
//! }
//! ```
//!
//! Engine callbacks never call back into the scheduler. They enqueue output
//! or raise the session's wake-up signal, and the loop picks that up on its
//! next pass.

use std::time::Duration;
use tracing::{debug, trace};

use super::registry::Session;

/// Scheduler state after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// The engine has more work pending
    Running,
    /// Queued input was just handed to the engine
    AwaitingMoreInput,
    /// Nothing pending; waiting for the deferred re-check
    Idle,
    /// Quiescence confirmed; the invocation may finalize
    Finalizing,
}

/// Counters describing one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Ticks executed, including idle re-checks
    pub ticks: u64,
    /// Times the loop went idle and armed a re-check
    pub idle_checks: u32,
    /// Times a wake-up (e.g. an interrupt notification) re-armed the loop
    pub rearmed: u32,
}

/// Per-invocation driver for a session's engine
#[derive(Debug)]
pub struct Scheduler {
    idle_grace: Duration,
    state: SchedulerState,
}

impl Scheduler {
    /// Create a scheduler that waits `idle_grace` before confirming idleness
    pub fn new(idle_grace: Duration) -> Self {
        Self {
            idle_grace,
            state: SchedulerState::Idle,
        }
    }

    /// State after the most recent tick
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Grace period before an idle engine is considered quiescent
    pub fn idle_grace(&self) -> Duration {
        self.idle_grace
    }

    /// One scheduler iteration
    pub fn tick(&mut self, session: &mut Session) -> SchedulerState {
        session.drain_engine_output();
        let more = session.engine_mut().step();
        session.drain_engine_output();

        self.state = if more {
            SchedulerState::Running
        } else if let Some((input, interactive)) = session.take_typeahead() {
            trace!(bytes = input.len(), interactive, "feeding typeahead");
            session.engine_mut().feed_input(&input, interactive);
            SchedulerState::AwaitingMoreInput
        } else {
            SchedulerState::Idle
        };
        self.state
    }

    /// Drive the session until quiescence is confirmed
    pub async fn run(&mut self, session: &mut Session) -> RunReport {
        let wakeup = session.wakeup();
        let mut report = RunReport::default();

        loop {
            report.ticks += 1;
            match self.tick(session) {
                SchedulerState::Running | SchedulerState::AwaitingMoreInput => {
                    tokio::task::yield_now().await;
                }
                SchedulerState::Idle => {
                    report.idle_checks += 1;
                    tokio::select! {
                        _ = wakeup.notified() => {
                            report.rearmed += 1;
                            debug!("scheduler re-armed");
                            continue;
                        }
                        _ = tokio::time::sleep(self.idle_grace) => {}
                    }

                    report.ticks += 1;
                    if self.tick(session) == SchedulerState::Idle {
                        self.state = SchedulerState::Finalizing;
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                SchedulerState::Finalizing => break,
            }
        }

        debug!(
            ticks = report.ticks,
            idle_checks = report.idle_checks,
            rearmed = report.rearmed,
            "quiescent"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::engine::{Engine, EngineEvent, EngineFactory, EventHandler, EventHub, EventKind};
    use crate::runtime::error::{EngineError, EngineResult};
    use crate::runtime::message::{OutputEvent, WorkerId};
    use crate::runtime::registry::SessionRegistry;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Engine whose work and interrupts are scripted from the test
    struct ScriptedEngine {
        work: u32,
        output: String,
        hub: Arc<Mutex<EventHub>>,
        late: Option<Duration>,
    }

    impl Engine for ScriptedEngine {
        fn step(&mut self) -> bool {
            if self.work > 0 {
                self.output.push_str(&format!("w{}\n", self.work));
                self.work -= 1;
            }
            self.work > 0
        }

        fn drain_output(&mut self) -> String {
            std::mem::take(&mut self.output)
        }

        fn feed_input(&mut self, text: &str, _interactive: bool) {
            self.work += text.lines().count() as u32;
        }

        fn interrupt(&mut self) {
            // Acknowledge asynchronously, after the scheduler has gone idle.
            let hub = self.hub.clone();
            let delay = self.late.unwrap_or(Duration::from_millis(1));
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut hub = hub.lock();
                hub.emit(EngineEvent::Debug {
                    text: "interrupted".into(),
                    level: 2,
                });
                hub.emit(EngineEvent::Interrupted);
            });
        }

        fn subscribe(&mut self, kind: EventKind, handler: EventHandler) {
            self.hub.lock().subscribe(kind, handler);
        }

        fn export_state(&self) -> EngineResult<Vec<u8>> {
            Ok(Vec::new())
        }

        fn import_state(&mut self, _state: &[u8]) -> EngineResult<()> {
            Err(EngineError::InvalidState("scripted".into()))
        }

        fn bootstrap_default(&mut self) {
            self.work = 0;
        }

        fn announce_startup(&mut self) {}
    }

    struct ScriptedFactory {
        late: Option<Duration>,
    }

    impl EngineFactory for ScriptedFactory {
        fn build(&self) -> Box<dyn Engine> {
            Box::new(ScriptedEngine {
                work: 0,
                output: String::new(),
                hub: Arc::new(Mutex::new(EventHub::new())),
                late: self.late,
            })
        }
    }

    fn registry(late: Option<Duration>) -> SessionRegistry<ScriptedFactory> {
        SessionRegistry::new(ScriptedFactory { late })
    }

    #[test]
    fn test_tick_states() {
        let mut registry = registry(None);
        let session = registry.reset(WorkerId::new("W1").unwrap(), 1, None);
        let mut scheduler = Scheduler::new(Duration::from_millis(5));

        assert_eq!(scheduler.tick(session), SchedulerState::Idle);

        session.queue_input("a\nb", true);
        assert_eq!(scheduler.tick(session), SchedulerState::AwaitingMoreInput);
        assert_eq!(scheduler.tick(session), SchedulerState::Running);
        assert_eq!(scheduler.tick(session), SchedulerState::Idle);
        assert_eq!(
            session.outbox().take(),
            vec![OutputEvent::text("w2\n"), OutputEvent::text("w1\n")]
        );
    }

    #[tokio::test]
    async fn test_run_drains_all_work_in_order() {
        let mut registry = registry(None);
        let session = registry.reset(WorkerId::new("W1").unwrap(), 1, None);
        session.queue_input("1\n2\n3", true);

        let mut scheduler = Scheduler::new(Duration::from_millis(5));
        let report = scheduler.run(session).await;

        assert_eq!(scheduler.state(), SchedulerState::Finalizing);
        assert_eq!(report.idle_checks, 1);
        assert_eq!(report.rearmed, 0);
        let texts: Vec<_> = session.outbox().take();
        assert_eq!(
            texts,
            vec![
                OutputEvent::text("w3\n"),
                OutputEvent::text("w2\n"),
                OutputEvent::text("w1\n"),
            ]
        );
    }

    #[tokio::test]
    async fn test_interrupt_notification_rearms_idle_scheduler() {
        let mut registry = registry(Some(Duration::from_millis(2)));
        let session = registry.reset(WorkerId::new("W1").unwrap(), 1, None);
        session.engine_mut().interrupt();

        let mut scheduler = Scheduler::new(Duration::from_millis(200));
        let report = scheduler.run(session).await;

        assert_eq!(report.rearmed, 1);
        assert_eq!(report.idle_checks, 2);
        assert_eq!(session.outbox().take(), vec![OutputEvent::debug("interrupted", 2)]);
    }

    #[tokio::test]
    async fn test_late_reaction_after_grace_is_not_waited_for() {
        let mut registry = registry(Some(Duration::from_millis(500)));
        let session = registry.reset(WorkerId::new("W1").unwrap(), 1, None);
        session.engine_mut().interrupt();

        let mut scheduler = Scheduler::new(Duration::from_millis(5));
        let report = scheduler.run(session).await;

        assert_eq!(report.rearmed, 0);
        assert!(session.outbox().is_empty());
    }
}
