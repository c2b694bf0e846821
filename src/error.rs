use crate::types::JsValue;
use thiserror::Error;

/// A generator body the lowering pass or the plan builder cannot represent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported generator shape: {reason}")]
pub struct UnsupportedShape {
    pub reason: String,
}

impl UnsupportedShape {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors raised by the runtime itself rather than by script code.
/// They travel as `Completion::Fatal` and are never observed by `catch`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("generator is already running")]
    GeneratorRunning,
    #[error("malformed iterator result: {0}")]
    MalformedIteratorResult(String),
    #[error("value is not a generator object")]
    NotAGenerator,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeneratorError {
    #[error("uncaught exception: {0}")]
    Thrown(JsValue),
    #[error(transparent)]
    Fatal(#[from] RuntimeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        assert_eq!(
            UnsupportedShape::new("multiple yield expressions in one expression").to_string(),
            "unsupported generator shape: multiple yield expressions in one expression"
        );
        assert_eq!(
            GeneratorError::from(RuntimeError::GeneratorRunning).to_string(),
            "generator is already running"
        );
        assert_eq!(
            GeneratorError::Thrown(JsValue::Number(3.0)).to_string(),
            "uncaught exception: 3"
        );
    }
}
