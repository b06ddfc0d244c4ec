//! Scripts run by the simulated engine.

use std::collections::BTreeMap;
use std::time::Duration;

/// One operation of a simulated statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Nop,
    /// Writes a line to stdout (an `output` event).
    Print(String),
    Sleep(Duration),
    /// Assigns a thread-local variable.
    Set { name: String, value: String },
    /// Ends the thread when the variable holds `equals`.
    ExitIf { name: String, equals: String },
    /// Programmatic breakpoint; halts only while a controller is attached.
    Breakpoint,
}

/// A statement at a source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub line: u32,
    pub op: Op,
}

impl Statement {
    pub fn new(line: u32, op: Op) -> Self {
        Self { line, op }
    }

    pub fn nop(line: u32) -> Self {
        Self::new(line, Op::Nop)
    }

    pub fn print(line: u32, text: impl Into<String>) -> Self {
        Self::new(line, Op::Print(text.into()))
    }

    pub fn sleep(line: u32, duration: Duration) -> Self {
        Self::new(line, Op::Sleep(duration))
    }

    pub fn set(line: u32, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(
            line,
            Op::Set {
                name: name.into(),
                value: value.into(),
            },
        )
    }

    pub fn exit_if(line: u32, name: impl Into<String>, equals: impl Into<String>) -> Self {
        Self::new(
            line,
            Op::ExitIf {
                name: name.into(),
                equals: equals.into(),
            },
        )
    }

    pub fn breakpoint(line: u32) -> Self {
        Self::new(line, Op::Breakpoint)
    }
}

/// Program of one simulated thread: a prologue run once, then a body
/// repeated `iterations` times (forever when `None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadScript {
    pub(crate) name: String,
    pub(crate) function: String,
    pub(crate) source: String,
    pub(crate) prologue: Vec<Statement>,
    pub(crate) body: Vec<Statement>,
    pub(crate) iterations: Option<u32>,
    pub(crate) vars: BTreeMap<String, String>,
}

impl ThreadScript {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            function: name.clone(),
            name,
            source: source.into(),
            prologue: Vec::new(),
            body: Vec::new(),
            iterations: Some(1),
            vars: BTreeMap::new(),
        }
    }

    /// Function name reported in stack frames.
    #[must_use]
    pub fn function(mut self, function: impl Into<String>) -> Self {
        self.function = function.into();
        self
    }

    #[must_use]
    pub fn prologue(mut self, statements: Vec<Statement>) -> Self {
        self.prologue = statements;
        self
    }

    #[must_use]
    pub fn body(mut self, statements: Vec<Statement>) -> Self {
        self.body = statements;
        self
    }

    #[must_use]
    pub fn iterations(mut self, n: u32) -> Self {
        self.iterations = Some(n);
        self
    }

    #[must_use]
    pub fn forever(mut self) -> Self {
        self.iterations = None;
        self
    }

    /// Initial value of a thread-local variable.
    #[must_use]
    pub fn var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Statements in execution order. Endless for `forever` scripts.
    pub(crate) fn statements(&self) -> impl Iterator<Item = &Statement> + '_ {
        let rounds: Box<dyn Iterator<Item = u32> + Send> = match self.iterations {
            Some(n) => Box::new(0..n),
            None if self.body.is_empty() => Box::new(std::iter::empty()),
            None => Box::new(std::iter::repeat(0)),
        };
        self.prologue
            .iter()
            .chain(rounds.flat_map(move |_| self.body.iter()))
    }
}
