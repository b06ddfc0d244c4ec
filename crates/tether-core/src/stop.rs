//! Stop events reported by the execution engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::breakpoint::SourceLocation;

/// Identifier of a thread inside the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a stack frame, valid only while its thread is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why execution halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Breakpoint,
    Pause,
    Step,
}

impl StopReason {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Breakpoint => "breakpoint",
            Self::Pause => "pause",
            Self::Step => "step",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub id: FrameId,
    pub name: String,
    pub source: String,
    pub line: u32,
}

impl StackFrame {
    pub fn location(&self) -> SourceLocation {
        SourceLocation::new(self.source.clone(), self.line)
    }
}

/// Summary of a live thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
}

/// Notification that target execution halted.
///
/// Immutable once emitted; sessions forward it to the controller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopEvent {
    pub reason: StopReason,
    pub thread_id: ThreadId,
    /// Innermost frame first.
    pub frames: Vec<StackFrame>,
}

impl StopEvent {
    pub fn new(reason: StopReason, thread_id: ThreadId, frames: Vec<StackFrame>) -> Self {
        Self {
            reason,
            thread_id,
            frames,
        }
    }

    /// The innermost frame, if the engine reported any.
    pub fn top_frame(&self) -> Option<&StackFrame> {
        self.frames.first()
    }

    /// Location of the innermost frame.
    pub fn location(&self) -> Option<SourceLocation> {
        self.top_frame().map(StackFrame::location)
    }
}
