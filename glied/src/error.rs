use std::{fmt, sync::Arc};

use crate::Arity;

/// Language-level errors raised by the runtime core. These propagate to
/// user-level exception handling; they never carry control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Mutation of a frozen object.
    Frozen { class: Arc<str> },
    /// Dispatch found no method. Never cached by call sites.
    NoMethod { name: Arc<str>, class: Arc<str> },
    Argument { expected: Arity, given: usize },
    Type { message: String },
    /// Uninitialized constant.
    Name { name: Arc<str> },
    /// A break/return/retry whose target is gone or not allowed.
    LocalJump { reason: &'static str },
}

impl RuntimeError {
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    pub fn local_jump(reason: &'static str) -> Self {
        Self::LocalJump { reason }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Frozen { class } => {
                write!(f, "can't modify frozen {}", class)
            }
            RuntimeError::NoMethod { name, class } => {
                write!(f, "undefined method `{}' for {}", name, class)
            }
            RuntimeError::Argument { expected, given } => {
                write!(
                    f,
                    "wrong number of arguments ({} for {})",
                    given, expected
                )
            }
            RuntimeError::Type { message } => write!(f, "{}", message),
            RuntimeError::Name { name } => {
                write!(f, "uninitialized constant {}", name)
            }
            RuntimeError::LocalJump { reason } => write!(f, "{}", reason),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_the_language_wording() {
        let frozen = RuntimeError::Frozen {
            class: Arc::from("Object"),
        };
        assert_eq!(frozen.to_string(), "can't modify frozen Object");

        let arity = RuntimeError::Argument {
            expected: Arity::Exact(1),
            given: 3,
        };
        assert_eq!(arity.to_string(), "wrong number of arguments (3 for 1)");

        let jump = RuntimeError::local_jump("break from proc-closure");
        assert_eq!(jump.to_string(), "break from proc-closure");
    }
}
