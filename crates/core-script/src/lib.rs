//! The embedded scripting runtime: a small dynamic language whose values
//! are `core-value` values, a prototype/instance registry with live
//! mutation, reversible module loading, and the single-threaded worker that
//! owns all of it.
//!
//! Scripts declare domain and presenter objects with `prototype(name, init,
//! base?)` and `create(proto, instance?)`; re-declaring a prototype with a
//! changed init migrates live instances through the mutation queue. Module
//! loads record every registration they make so hot reload can unload
//! exactly what the previous load registered.

use thiserror::Error;

pub mod ast;
pub mod executor;
pub mod interp;
mod lex;
mod parse;
mod session;

pub use executor::{ExecError, Worker};
pub use interp::{Callable, Env, EnvRef, Interp, NativeImpl, native_fn, script_fn};
pub use session::{ModuleEntry, ModuleSource, SCRIPT_EXT, ScriptSession, VarOp, VarTarget};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("{file}:{line}: {message}")]
    Parse {
        file: String,
        line: u32,
        message: String,
    },
    #[error("{0}")]
    Runtime(String),
    #[error("undefined variable {0:?}")]
    UndefinedVariable(String),
    #[error("{0} is not callable")]
    NotCallable(&'static str),
    #[error("module {0:?} not found")]
    ModuleNotFound(String),
}
