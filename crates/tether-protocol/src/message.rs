//! Session message types exchanged after the handshake.
//!
//! Controller → target: [`ControllerMessage`] (a command with a caller-chosen
//! `seq`). Target → controller: [`TargetMessage`], either a [`Response`]
//! echoing that `seq` as `request_seq`, or an uncorrelated [`TargetEvent`].

use serde::{Deserialize, Serialize};
use std::fmt;

use tether_core::{FrameId, SourceLocation, StackFrame, StopEvent, ThreadId, ThreadInfo};

// ============================================================================
// Controller → Target
// ============================================================================

/// Commands a controller can issue on a bound session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Liveness check
    Ping,

    /// Request a halt. Non-freezing: threads other than the paused one keep
    /// running.
    Pause {
        /// Thread to pause; the engine picks one when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<ThreadId>,
    },

    /// Resume all threads
    Continue,

    /// Resume and halt again at the next statement of `thread_id`
    Step { thread_id: ThreadId },

    /// Add one breakpoint
    AddBreakpoint { location: SourceLocation },

    /// Remove one breakpoint
    RemoveBreakpoint { location: SourceLocation },

    /// Remove every breakpoint in every source
    RemoveAllBreakpoints,

    /// Replace the breakpoints of one source with `lines`
    SetBreakpoints { source: String, lines: Vec<u32> },

    /// Read the session's breakpoint view
    ListBreakpoints,

    /// Assign a literal to an expression in a stopped frame
    SetExpression {
        thread_id: ThreadId,
        frame_id: FrameId,
        expression: String,
        value: String,
    },

    /// List live threads
    Threads,

    /// Frames of a thread
    StackTrace { thread_id: ThreadId },

    /// End the session
    Disconnect {
        /// Overrides the session's exit-on-disconnect option when present
        #[serde(default, skip_serializing_if = "Option::is_none")]
        terminate: Option<bool>,
        /// Leave the target halted instead of resuming it
        #[serde(default)]
        suspend: bool,
    },
}

impl Command {
    /// Wire name of the command, echoed in responses.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pause { .. } => "pause",
            Self::Continue => "continue",
            Self::Step { .. } => "step",
            Self::AddBreakpoint { .. } => "add_breakpoint",
            Self::RemoveBreakpoint { .. } => "remove_breakpoint",
            Self::RemoveAllBreakpoints => "remove_all_breakpoints",
            Self::SetBreakpoints { .. } => "set_breakpoints",
            Self::ListBreakpoints => "list_breakpoints",
            Self::SetExpression { .. } => "set_expression",
            Self::Threads => "threads",
            Self::StackTrace { .. } => "stack_trace",
            Self::Disconnect { .. } => "disconnect",
        }
    }

    /// True for commands that change breakpoints or execution.
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Self::Ping | Self::ListBreakpoints | Self::Threads | Self::StackTrace { .. }
        )
    }
}

/// Message sent from controller to target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerMessage {
    /// Correlation id chosen by the controller
    pub seq: u64,

    #[serde(flatten)]
    pub command: Command,
}

impl ControllerMessage {
    pub fn new(seq: u64, command: Command) -> Self {
        Self { seq, command }
    }
}

// ============================================================================
// Target → Controller
// ============================================================================

/// Machine-readable failure code carried by failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Command not allowed in the session's current state
    WrongState,
    /// Command could not be decoded
    Malformed,
    /// The execution engine refused or failed the operation
    EngineFailure,
    /// Referenced thread or frame does not exist
    UnknownReference,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WrongState => "wrong_state",
            Self::Malformed => "malformed",
            Self::EngineFailure => "engine_failure",
            Self::UnknownReference => "unknown_reference",
        };
        f.write_str(s)
    }
}

/// Payload of a successful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    Ack,
    Pong,
    Breakpoints { breakpoints: Vec<SourceLocation> },
    Expression { value: String },
    Threads { threads: Vec<ThreadInfo> },
    StackTrace { frames: Vec<StackFrame> },
}

/// Reply to exactly one [`ControllerMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// `seq` of the command this answers
    pub request_seq: u64,
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ResponseBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl Response {
    pub fn ok(request_seq: u64, command: &str, body: ResponseBody) -> Self {
        Self {
            request_seq,
            command: command.to_string(),
            success: true,
            body: Some(body),
            message: None,
            error_code: None,
        }
    }

    pub fn failure(request_seq: u64, command: &str, code: ErrorCode, message: &str) -> Self {
        Self {
            request_seq,
            command: command.to_string(),
            success: false,
            body: None,
            message: Some(message.to_string()),
            error_code: Some(code),
        }
    }
}

/// Output stream category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCategory {
    Stdout,
    Stderr,
    Console,
}

/// Asynchronous notification; carries no correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TargetEvent {
    /// Execution halted
    Stopped(StopEvent),

    /// Execution resumed
    Continued {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<ThreadId>,
        all_threads: bool,
    },

    /// Program output
    Output {
        category: OutputCategory,
        output: String,
    },

    /// The target program finished
    Exited { exit_code: i32 },
}

/// Message sent from target to controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetMessage {
    Response(Response),
    Event(TargetEvent),
}

impl TargetMessage {
    pub fn stopped(stop: StopEvent) -> Self {
        Self::Event(TargetEvent::Stopped(stop))
    }

    pub fn output(category: OutputCategory, output: impl Into<String>) -> Self {
        Self::Event(TargetEvent::Output {
            category,
            output: output.into(),
        })
    }
}

impl From<Response> for TargetMessage {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<TargetEvent> for TargetMessage {
    fn from(event: TargetEvent) -> Self {
        Self::Event(event)
    }
}
