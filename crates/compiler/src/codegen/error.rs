//! Code generation error type.

/// Errors surfaced while producing assembly text.
///
/// Logic errors indicate a malformed program that slipped past the front
/// end (they should not occur on type-checked input); format errors wrap
/// write failures from the text sink so `?` works throughout the emitter.
#[derive(Debug)]
pub enum CodegenError {
    Logic(String),
    Format(std::fmt::Error),
}

impl std::fmt::Display for CodegenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodegenError::Logic(message) => write!(f, "{}", message),
            CodegenError::Format(e) => write!(f, "assembly emission error: {}", e),
        }
    }
}

impl std::error::Error for CodegenError {}

impl From<String> for CodegenError {
    fn from(message: String) -> Self {
        CodegenError::Logic(message)
    }
}

impl From<std::fmt::Error> for CodegenError {
    fn from(e: std::fmt::Error) -> Self {
        CodegenError::Format(e)
    }
}
