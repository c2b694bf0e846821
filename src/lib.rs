pub mod ast;
pub mod error;
pub mod interpreter;
pub mod types;

pub use error::{GeneratorError, RuntimeError, UnsupportedShape};
pub use interpreter::{Completion, Interpreter};
