//! netdiag tool layer: validation, command table, and streaming execution
//!
//! Every tool run goes through the same pipeline:
//! validate request → build argument vector → spawn → stream events.
//! Nothing here ever hands a string to a shell.

pub mod command;
pub mod error;
pub mod executor;
pub mod types;
pub mod validator;

pub use command::{BuiltCommand, HostOs, ToolSpec, ToolTable};
pub use error::{ExecutionError, ValidationError};
pub use executor::{Executor, Outcome};
pub use types::{CommandEvent, CommandRequest, Tool};
pub use validator::{sanitize_output, Validator};
