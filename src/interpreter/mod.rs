//! Sandboxed script interpreter.
//!
//! Scripts are S-expressions. Calls to names in the run's external-function
//! list suspend the run and surface as [`Progress::Paused`] with an opaque
//! [`Checkpoint`]. Any [`Engine`] can resume any checkpoint it produced: the
//! checkpoint carries the source plus a journal of answered calls, and resuming
//! replays the script against that journal up to the next unanswered call.

/// Abstract syntax tree definitions for the script language.
pub mod ast;
/// Checkpoint byte layout and continuation state.
pub mod checkpoint;
mod eval;
/// Parser for the script language.
pub mod parser;
/// Runtime values.
pub mod value;

pub use ast::{Expr, Program};
pub use checkpoint::{CHECKPOINT_MAGIC, CHECKPOINT_VERSION, Continuation, JournalEntry};
pub use parser::parse_program;
pub use value::Value;

use crate::progress::{Checkpoint, Limits, PrintEmission, Progress, ResumeInstruction};
use eval::{Evaluator, Flow};
use thiserror::Error;

/// Errors surfaced by the parser or evaluator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The script could not be parsed.
    #[error("SyntaxError: {0}")]
    Syntax(String),

    /// An exception escaped the script.
    #[error("{kind}: {message}")]
    Runtime {
        /// Exception kind, e.g. `RuntimeError`.
        kind: String,
        /// Exception message.
        message: String,
    },

    /// A step, depth or time budget was exhausted.
    #[error("limit exceeded: {0}")]
    Limit(String),

    /// The checkpoint could not be loaded or replayed.
    #[error("invalid checkpoint: {0}")]
    Checkpoint(String),

    /// Unexpected interpreter failure.
    #[error("internal interpreter error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Wire name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Syntax(_) => "syntax",
            EngineError::Runtime { .. } => "runtime",
            EngineError::Limit(_) => "limit",
            EngineError::Checkpoint(_) => "checkpoint",
            EngineError::Internal(_) => "internal",
        }
    }
}

/// Output of a single start or resume step.
#[derive(Debug)]
pub struct RunStep {
    /// Where the run stopped, or why it failed.
    pub outcome: Result<Progress, EngineError>,
    /// Print emissions produced during this step only.
    pub prints: Vec<PrintEmission>,
}

impl RunStep {
    fn failed(error: EngineError) -> Self {
        Self {
            outcome: Err(error),
            prints: Vec::new(),
        }
    }
}

/// Capability interface the worker drives.
pub trait Interpreter: Send + Sync {
    /// Begin a new run of `code`.
    fn create_run(&self, code: &str, external_functions: &[String], limits: Limits) -> RunStep;

    /// Continue a paused run with the answer to its pending call.
    fn resume_run(&self, checkpoint: &Checkpoint, instruction: &ResumeInstruction) -> RunStep;
}

/// The built-in interpreter.
#[derive(Debug, Clone, Copy, Default)]
pub struct Engine;

impl Engine {
    /// Create an engine.
    pub fn new() -> Self {
        Self
    }

    fn execute(&self, mut continuation: Continuation) -> RunStep {
        let program = match parse_program(&continuation.source) {
            Ok(program) => program,
            Err(err) => return RunStep::failed(err),
        };

        let mut evaluator = Evaluator::new(
            &continuation.external_functions,
            &continuation.journal,
            continuation.limits,
            continuation.prints_delivered,
        );
        let result = evaluator.run(&program);
        let prints_seen = evaluator.prints_seen();
        let prints = evaluator.take_prints();

        let outcome = match result {
            Ok(value) => Ok(Progress::Finished {
                output: value.to_json(),
            }),
            Err(Flow::Suspend(suspension)) => {
                continuation.pending = Some(suspension.function_name.clone());
                continuation.prints_delivered = prints_seen;
                checkpoint::dump(&continuation).map(|checkpoint| Progress::Paused {
                    function_name: suspension.function_name,
                    args: suspension.args,
                    kwargs: suspension.kwargs,
                    checkpoint,
                })
            }
            Err(Flow::Raise(info)) => Err(EngineError::Runtime {
                kind: info.kind,
                message: info.message,
            }),
            Err(Flow::Fatal(err)) => Err(err),
        };
        RunStep { outcome, prints }
    }
}

impl Interpreter for Engine {
    fn create_run(&self, code: &str, external_functions: &[String], limits: Limits) -> RunStep {
        self.execute(Continuation::fresh(code, external_functions, limits))
    }

    fn resume_run(&self, checkpoint: &Checkpoint, instruction: &ResumeInstruction) -> RunStep {
        let mut continuation = match checkpoint::load(checkpoint) {
            Ok(continuation) => continuation,
            Err(err) => return RunStep::failed(err),
        };
        if let Err(err) = continuation.answer(instruction.clone()) {
            return RunStep::failed(err);
        }
        self.execute(continuation)
    }
}
