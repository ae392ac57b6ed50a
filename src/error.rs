//! Error types for the netlist front end

use thiserror::Error;

/// Result type for compilation operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Compilation errors
///
/// Every variant is terminal: a pass that returns one aborts the whole
/// compilation. Messages carry the offending entity names.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Parser error: {message}")]
    ParseError { message: String },

    #[error("Derivation error: {message}")]
    DerivationError { message: String },

    #[error("Legality error [{rule}]: {message}")]
    LegalityError { rule: String, message: String },

    #[error("Program error in {program}: {message}")]
    ProgramError { program: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CompileError {
    pub fn parse_error(msg: impl Into<String>) -> Self {
        CompileError::ParseError { message: msg.into() }
    }

    pub fn derivation(msg: impl Into<String>) -> Self {
        CompileError::DerivationError { message: msg.into() }
    }

    pub fn legality(rule: impl Into<String>, msg: impl Into<String>) -> Self {
        CompileError::LegalityError {
            rule: rule.into(),
            message: msg.into(),
        }
    }

    pub fn program(program: impl Into<String>, msg: impl Into<String>) -> Self {
        CompileError::ProgramError {
            program: program.into(),
            message: msg.into(),
        }
    }

    /// The human-readable message without the category prefix
    pub fn message(&self) -> String {
        match self {
            CompileError::ParseError { message }
            | CompileError::DerivationError { message }
            | CompileError::LegalityError { message, .. }
            | CompileError::ProgramError { message, .. } => message.clone(),
            CompileError::Io(e) => e.to_string(),
            CompileError::Json(e) => e.to_string(),
        }
    }
}

/// Returns a parse error built by `msg` unless `cond` holds
pub fn ensure_parse(cond: bool, msg: impl FnOnce() -> String) -> CompileResult<()> {
    if cond {
        Ok(())
    } else {
        Err(CompileError::parse_error(msg()))
    }
}

/// Returns a derivation error built by `msg` unless `cond` holds
pub fn ensure_derived(cond: bool, msg: impl FnOnce() -> String) -> CompileResult<()> {
    if cond {
        Ok(())
    } else {
        Err(CompileError::derivation(msg()))
    }
}
