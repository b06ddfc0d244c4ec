//! Simulated execution engine.
//!
//! Runs scripted threads ([`ThreadScript`]) as tokio tasks and implements
//! [`ExecutionEngine`] over them. Used by tests and by the demo target.
//!
//! Every thread checks, before each statement, whether it must halt there:
//! 1. a line breakpoint at its location
//! 2. a pending step of this thread
//! 3. a pending pause naming this thread (or any thread)
//! 4. a programmatic breakpoint while a controller is attached
//!
//! At most one halt is outstanding. A thread that wants to halt while
//! another thread holds the halt waits for the next resume and checks
//! again; every other thread keeps running.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Poisoned locks are recovered; every critical section is short and
//!   leaves the state consistent

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use tether_core::{
    BreakpointSet, FrameId, SourceLocation, StackFrame, StopEvent, StopReason, ThreadId, ThreadInfo,
};
use tether_protocol::OutputCategory;

use crate::engine::{EngineError, EngineEvent, ExecutionEngine, SeverityCallbacks};

mod program;

pub use program::{Op, Statement, ThreadScript};

/// Event channel capacity
const EVENT_CAPACITY: usize = 1024;

/// Exit code reported when the program is terminated
pub const TERMINATED_EXIT_CODE: i32 = 1;

/// Frame ids are `thread * FRAME_STRIDE`
const FRAME_STRIDE: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseRequest {
    Any,
    Thread(ThreadId),
}

impl PauseRequest {
    fn matches(self, thread: ThreadId) -> bool {
        match self {
            Self::Any => true,
            Self::Thread(t) => t == thread,
        }
    }
}

#[derive(Debug)]
struct ThreadRecord {
    name: String,
    function: String,
    source: String,
    line: u32,
    vars: BTreeMap<String, String>,
    finished: bool,
}

impl ThreadRecord {
    fn frame(&self, id: ThreadId) -> StackFrame {
        StackFrame {
            id: frame_id(id),
            name: self.function.clone(),
            source: self.source.clone(),
            line: self.line,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    breakpoints: BreakpointSet,
    halt: Option<StopEvent>,
    pause: Option<PauseRequest>,
    step: Option<ThreadId>,
    attached: bool,
    threads: BTreeMap<ThreadId, ThreadRecord>,
    terminated: bool,
    running: usize,
}

impl SimState {
    fn live_thread(&self, id: ThreadId) -> Result<&ThreadRecord, EngineError> {
        match self.threads.get(&id) {
            Some(record) if !record.finished => Ok(record),
            _ => Err(EngineError::UnknownThread(id)),
        }
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.terminated {
            Err(EngineError::Terminated)
        } else {
            Ok(())
        }
    }

    fn halt_reason(&self, id: ThreadId, source: &str, stmt: &Statement) -> Option<StopReason> {
        if self
            .breakpoints
            .contains(&SourceLocation::new(source, stmt.line))
        {
            return Some(StopReason::Breakpoint);
        }
        if self.step == Some(id) {
            return Some(StopReason::Step);
        }
        if self.pause.is_some_and(|p| p.matches(id)) {
            return Some(StopReason::Pause);
        }
        if stmt.op == Op::Breakpoint && self.attached {
            return Some(StopReason::Breakpoint);
        }
        None
    }
}

fn frame_id(thread: ThreadId) -> FrameId {
    FrameId(thread.0 * FRAME_STRIDE)
}

struct Inner {
    state: Mutex<SimState>,
    events: broadcast::Sender<EngineEvent>,
    /// Bumped on every resume, step, and termination.
    resume: watch::Sender<u64>,
    halted: watch::Sender<Option<StopEvent>>,
    done: watch::Sender<Option<i32>>,
    next_thread: AtomicU64,
    identity_corrections: AtomicUsize,
    late_concurrency: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_halt(&self, state: &mut SimState, halt: Option<StopEvent>) {
        state.halt = halt.clone();
        self.halted.send_replace(halt);
    }

    fn release(&self) {
        self.resume.send_modify(|generation| *generation += 1);
    }
}

/// Decision taken at a statement boundary.
enum Checkpoint {
    Proceed,
    /// Halted here; wait for the resume after `generation`, then execute.
    Halted(u64),
    /// Another thread holds the halt; wait, then check again.
    Blocked(u64),
    Terminated,
}

/// Deterministic scripted program behind an [`ExecutionEngine`].
#[derive(Clone)]
pub struct SimulatedEngine {
    inner: Arc<Inner>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (resume, _) = watch::channel(0);
        let (halted, _) = watch::channel(None);
        let (done, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SimState::default()),
                events,
                resume,
                halted,
                done,
                next_thread: AtomicU64::new(1),
                identity_corrections: AtomicUsize::new(0),
                late_concurrency: AtomicBool::new(false),
            }),
        }
    }

    /// Simulates a runtime whose threading support started late, so
    /// attaching requires main-thread identity correction.
    #[must_use]
    pub fn with_late_concurrency(self) -> Self {
        self.inner.late_concurrency.store(true, Ordering::Release);
        self
    }

    /// Number of times identity correction actually ran.
    pub fn identity_corrections(&self) -> usize {
        self.inner.identity_corrections.load(Ordering::Acquire)
    }

    /// Starts a thread running `script`. Must be called inside a tokio
    /// runtime.
    pub fn spawn(&self, script: ThreadScript) -> ThreadId {
        let id = ThreadId(self.inner.next_thread.fetch_add(1, Ordering::AcqRel));
        {
            let mut state = self.inner.lock();
            state.threads.insert(
                id,
                ThreadRecord {
                    name: script.name.clone(),
                    function: script.function.clone(),
                    source: script.source.clone(),
                    line: 0,
                    vars: script.vars.clone(),
                    finished: false,
                },
            );
            state.running += 1;
        }
        debug!(thread_id = %id, name = %script.name, "Simulated thread started");
        tokio::spawn(run_thread(Arc::clone(&self.inner), id, script));
        id
    }

    /// Current value of a thread variable.
    pub fn var(&self, thread: ThreadId, name: &str) -> Option<String> {
        self.inner
            .lock()
            .threads
            .get(&thread)
            .and_then(|record| record.vars.get(name).cloned())
    }

    /// Waits for a halt. Returns `None` on timeout.
    pub async fn wait_for_halt(&self, timeout: Duration) -> Option<StopEvent> {
        let mut rx = self.inner.halted.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(halt)) => halt.clone(),
            _ => None,
        }
    }

    /// Waits for the program to end. Returns its exit code, or `None` on
    /// timeout.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<i32> {
        let mut rx = self.inner.done.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(code)) => *code,
            _ => None,
        }
    }
}

impl std::fmt::Debug for SimulatedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("SimulatedEngine")
            .field("threads", &state.threads.len())
            .field("halted", &state.halt.is_some())
            .field("terminated", &state.terminated)
            .finish()
    }
}

// ============================================================================
// Thread execution
// ============================================================================

async fn run_thread(inner: Arc<Inner>, id: ThreadId, script: ThreadScript) {
    let mut resume = inner.resume.subscribe();

    for stmt in script.statements() {
        if !checkpoint(&inner, id, &script.source, stmt, &mut resume).await {
            break;
        }
        if !execute(&inner, id, stmt).await {
            break;
        }
        tokio::task::yield_now().await;
    }

    finish(&inner, id);
}

/// Returns false once the program is terminated.
async fn checkpoint(
    inner: &Inner,
    id: ThreadId,
    source: &str,
    stmt: &Statement,
    resume: &mut watch::Receiver<u64>,
) -> bool {
    loop {
        let decision = {
            let mut state = inner.lock();
            let generation = *inner.resume.borrow();
            if state.terminated {
                Checkpoint::Terminated
            } else {
                if let Some(record) = state.threads.get_mut(&id) {
                    record.line = stmt.line;
                }
                match state.halt_reason(id, source, stmt) {
                    None => Checkpoint::Proceed,
                    Some(_) if state.halt.is_some() => Checkpoint::Blocked(generation),
                    Some(reason) => {
                        let frames = state
                            .threads
                            .get(&id)
                            .map(|record| vec![record.frame(id)])
                            .unwrap_or_default();
                        let stop = StopEvent::new(reason, id, frames);
                        state.pause = None;
                        if state.step == Some(id) {
                            state.step = None;
                        }
                        inner.set_halt(&mut state, Some(stop.clone()));
                        debug!(thread_id = %id, reason = %reason, line = stmt.line, "Simulated thread halted");
                        inner.emit(EngineEvent::Stopped(stop));
                        Checkpoint::Halted(generation)
                    }
                }
            }
        };

        match decision {
            Checkpoint::Proceed => return true,
            Checkpoint::Terminated => return false,
            Checkpoint::Halted(generation) => {
                if resume.wait_for(|g| *g > generation).await.is_err() {
                    return false;
                }
                return !inner.lock().terminated;
            }
            Checkpoint::Blocked(generation) => {
                if resume.wait_for(|g| *g > generation).await.is_err() {
                    return false;
                }
            }
        }
    }
}

/// Runs one statement. Returns false when the thread should end.
async fn execute(inner: &Inner, id: ThreadId, stmt: &Statement) -> bool {
    match &stmt.op {
        Op::Nop | Op::Breakpoint => true,
        Op::Print(text) => {
            inner.emit(EngineEvent::Output {
                category: OutputCategory::Stdout,
                text: format!("{text}\n"),
            });
            true
        }
        Op::Sleep(duration) => {
            tokio::time::sleep(*duration).await;
            true
        }
        Op::Set { name, value } => {
            if let Some(record) = inner.lock().threads.get_mut(&id) {
                record.vars.insert(name.clone(), value.clone());
            }
            true
        }
        Op::ExitIf { name, equals } => {
            let state = inner.lock();
            let hit = state
                .threads
                .get(&id)
                .and_then(|record| record.vars.get(name))
                .is_some_and(|v| v == equals);
            !hit
        }
    }
}

fn finish(inner: &Inner, id: ThreadId) {
    let mut state = inner.lock();
    if let Some(record) = state.threads.get_mut(&id) {
        record.finished = true;
    }
    if state.step == Some(id) {
        state.step = None;
    }
    state.running = state.running.saturating_sub(1);
    debug!(thread_id = %id, "Simulated thread finished");

    if state.running == 0 && !state.terminated {
        state.terminated = true;
        info!("Simulated program finished");
        inner.emit(EngineEvent::Exited { exit_code: 0 });
        inner.done.send_replace(Some(0));
    }
}

// ============================================================================
// ExecutionEngine
// ============================================================================

#[async_trait]
impl ExecutionEngine for SimulatedEngine {
    async fn pause(&self, thread: Option<ThreadId>) -> Result<(), EngineError> {
        let mut state = self.inner.lock();
        state.ensure_live()?;
        if state.halt.is_some() {
            return Ok(());
        }
        let request = match thread {
            Some(id) => {
                state.live_thread(id)?;
                PauseRequest::Thread(id)
            }
            None => PauseRequest::Any,
        };
        state.pause = Some(request);
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        let mut state = self.inner.lock();
        state.ensure_live()?;
        if state.halt.is_none() {
            return Err(EngineError::NotHalted);
        }
        state.step = None;
        self.inner.set_halt(&mut state, None);
        self.inner.release();
        self.inner.emit(EngineEvent::Continued { thread_id: None });
        Ok(())
    }

    async fn step(&self, thread: ThreadId) -> Result<(), EngineError> {
        let mut state = self.inner.lock();
        state.ensure_live()?;
        match &state.halt {
            None => return Err(EngineError::NotHalted),
            Some(halt) if halt.thread_id != thread => {
                state.live_thread(thread)?;
                return Err(EngineError::ThreadNotHalted(thread));
            }
            Some(_) => {}
        }
        state.step = Some(thread);
        self.inner.set_halt(&mut state, None);
        self.inner.release();
        self.inner.emit(EngineEvent::Continued {
            thread_id: Some(thread),
        });
        Ok(())
    }

    async fn add_breakpoint(&self, location: SourceLocation) -> Result<bool, EngineError> {
        let mut state = self.inner.lock();
        state.ensure_live()?;
        Ok(state.breakpoints.add(location))
    }

    async fn remove_breakpoint(&self, location: &SourceLocation) -> Result<bool, EngineError> {
        let mut state = self.inner.lock();
        state.ensure_live()?;
        Ok(state.breakpoints.remove(location))
    }

    async fn clear_breakpoints(&self) -> Result<(), EngineError> {
        let mut state = self.inner.lock();
        state.ensure_live()?;
        state.breakpoints.clear();
        Ok(())
    }

    async fn breakpoints(&self) -> BreakpointSet {
        self.inner.lock().breakpoints.clone()
    }

    async fn set_expression(
        &self,
        thread: ThreadId,
        frame: FrameId,
        expression: &str,
        value: &str,
    ) -> Result<String, EngineError> {
        let mut state = self.inner.lock();
        state.ensure_live()?;
        match &state.halt {
            None => return Err(EngineError::NotHalted),
            Some(halt) if halt.thread_id != thread => {
                state.live_thread(thread)?;
                return Err(EngineError::ThreadNotHalted(thread));
            }
            Some(_) => {}
        }
        if frame != frame_id(thread) {
            return Err(EngineError::UnknownFrame(frame));
        }
        let is_identifier = !expression.is_empty()
            && expression
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !is_identifier {
            return Err(EngineError::InvalidExpression(expression.to_string()));
        }

        let record = state
            .threads
            .get_mut(&thread)
            .ok_or(EngineError::UnknownThread(thread))?;
        record.vars.insert(expression.to_string(), value.to_string());
        Ok(value.to_string())
    }

    async fn threads(&self) -> Vec<ThreadInfo> {
        self.inner
            .lock()
            .threads
            .iter()
            .filter(|(_, record)| !record.finished)
            .map(|(id, record)| ThreadInfo {
                id: *id,
                name: record.name.clone(),
            })
            .collect()
    }

    async fn stack_trace(&self, thread: ThreadId) -> Result<Vec<StackFrame>, EngineError> {
        let state = self.inner.lock();
        if let Some(halt) = state.halt.as_ref().filter(|h| h.thread_id == thread) {
            return Ok(halt.frames.clone());
        }
        Ok(vec![state.live_thread(thread)?.frame(thread)])
    }

    async fn current_stop(&self) -> Option<StopEvent> {
        self.inner.lock().halt.clone()
    }

    async fn terminate(&self) -> Result<(), EngineError> {
        let mut state = self.inner.lock();
        if state.terminated {
            return Ok(());
        }
        state.terminated = true;
        state.pause = None;
        state.step = None;
        self.inner.set_halt(&mut state, None);
        self.inner.release();
        info!("Simulated program terminated");
        self.inner.emit(EngineEvent::Exited {
            exit_code: TERMINATED_EXIT_CODE,
        });
        self.inner.done.send_replace(Some(TERMINATED_EXIT_CODE));
        Ok(())
    }

    async fn controller_attached(&self, attached: bool) {
        self.inner.lock().attached = attached;
    }

    fn needs_identity_correction(&self) -> bool {
        self.inner.late_concurrency.load(Ordering::Acquire)
    }

    async fn correct_main_thread_identity(
        &self,
        callbacks: &SeverityCallbacks,
    ) -> Result<(), EngineError> {
        if self.inner.lock().terminated {
            return Err(EngineError::Terminated);
        }
        callbacks.warning("main thread re-identified after late concurrency start");
        self.inner.identity_corrections.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    async fn subscribe_with_halt(&self) -> (broadcast::Receiver<EngineEvent>, Option<StopEvent>) {
        // Halt events are emitted with the state lock held.
        let state = self.inner.lock();
        (self.inner.events.subscribe(), state.halt.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn looping(name: &str, source: &str) -> ThreadScript {
        ThreadScript::new(name, source)
            .body(vec![
                Statement::print(1, format!("{name} tick")),
                Statement::sleep(2, Duration::from_millis(2)),
            ])
            .forever()
    }

    #[tokio::test]
    async fn test_breakpoint_halts_and_resumes() {
        let engine = SimulatedEngine::new();
        engine
            .add_breakpoint(SourceLocation::new("a.rs", 2))
            .await
            .unwrap();
        let thread = engine.spawn(looping("a", "a.rs"));

        let stop = engine.wait_for_halt(WAIT).await.unwrap();
        assert_eq!(stop.reason, StopReason::Breakpoint);
        assert_eq!(stop.thread_id, thread);
        assert_eq!(stop.location(), Some(SourceLocation::new("a.rs", 2)));

        engine.clear_breakpoints().await.unwrap();
        engine.resume().await.unwrap();
        assert!(engine.current_stop().await.is_none());
        engine.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_step_halts_on_next_statement() {
        let engine = SimulatedEngine::new();
        let thread = engine.spawn(looping("a", "a.rs"));
        engine.pause(Some(thread)).await.unwrap();
        let first = engine.wait_for_halt(WAIT).await.unwrap();

        let mut events = engine.subscribe();
        engine.step(thread).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::Continued {
                thread_id: Some(thread)
            }
        );
        let stepped = loop {
            if let EngineEvent::Stopped(stop) = events.recv().await.unwrap() {
                break stop;
            }
        };
        assert_eq!(stepped.reason, StopReason::Step);
        assert_ne!(stepped.location(), first.location());
        engine.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_program_exit_is_reported() {
        let engine = SimulatedEngine::new();
        let mut events = engine.subscribe();
        engine.spawn(
            ThreadScript::new("once", "once.rs").body(vec![Statement::print(1, "hello")]),
        );

        assert_eq!(engine.wait_for_exit(WAIT).await, Some(0));
        let mut saw_output = false;
        loop {
            match events.recv().await.unwrap() {
                EngineEvent::Output { text, .. } => {
                    assert_eq!(text, "hello\n");
                    saw_output = true;
                }
                EngineEvent::Exited { exit_code } => {
                    assert_eq!(exit_code, 0);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_output);
        assert_eq!(engine.pause(None).await, Err(EngineError::Terminated));
    }

    #[tokio::test]
    async fn test_set_expression_ends_loop() {
        let engine = SimulatedEngine::new();
        engine
            .add_breakpoint(SourceLocation::new("w.rs", 1))
            .await
            .unwrap();
        let thread = engine.spawn(
            ThreadScript::new("worker", "w.rs")
                .var("done", "false")
                .body(vec![Statement::nop(1), Statement::exit_if(2, "done", "true")])
                .forever(),
        );
        engine.wait_for_halt(WAIT).await.unwrap();

        assert_eq!(
            engine
                .set_expression(thread, FrameId(99), "done", "true")
                .await,
            Err(EngineError::UnknownFrame(FrameId(99)))
        );
        assert_eq!(
            engine
                .set_expression(thread, frame_id(thread), "a + b", "1")
                .await,
            Err(EngineError::InvalidExpression("a + b".to_string()))
        );
        let value = engine
            .set_expression(thread, frame_id(thread), "done", "true")
            .await
            .unwrap();
        assert_eq!(value, "true");
        assert_eq!(engine.var(thread, "done").as_deref(), Some("true"));

        engine.clear_breakpoints().await.unwrap();
        engine.resume().await.unwrap();
        assert_eq!(engine.wait_for_exit(WAIT).await, Some(0));
    }

    #[tokio::test]
    async fn test_programmatic_breakpoint_needs_controller() {
        let engine = SimulatedEngine::new();
        engine.spawn(
            ThreadScript::new("main", "m.rs")
                .body(vec![Statement::breakpoint(1), Statement::sleep(2, Duration::from_millis(1))])
                .iterations(50),
        );
        // Detached: runs straight through.
        assert_eq!(engine.wait_for_exit(WAIT).await, Some(0));

        let engine = SimulatedEngine::new();
        engine.controller_attached(true).await;
        engine.spawn(
            ThreadScript::new("main", "m.rs")
                .body(vec![Statement::breakpoint(1)])
                .forever(),
        );
        let stop = engine.wait_for_halt(WAIT).await.unwrap();
        assert_eq!(stop.reason, StopReason::Breakpoint);
        engine.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_identity_correction_counts_and_reports() {
        let engine = SimulatedEngine::new().with_late_concurrency();
        assert!(engine.needs_identity_correction());

        let warnings = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&warnings);
        let callbacks = SeverityCallbacks::default()
            .on_warning(move |msg| sink.lock().unwrap().push(msg.to_string()));

        engine.correct_main_thread_identity(&callbacks).await.unwrap();
        assert_eq!(engine.identity_corrections(), 1);
        assert_eq!(warnings.lock().unwrap().len(), 1);
    }
}
