use thiserror::Error;

/// Graph invariant violations collected by the FRouter compiler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", render_problems(.problems))]
pub struct CompileError {
    pub problems: Vec<String>,
}

impl CompileError {
    pub fn new(problems: Vec<String>) -> Self {
        Self { problems }
    }
}

fn render_problems(problems: &[String]) -> String {
    if problems.is_empty() {
        return "compile error".to_string();
    }
    problems.join("; ")
}

/// Entity kinds the repository can fail to find
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    FRouter,
    Node,
    Component,
}

impl EntityKind {
    pub fn as_str(&self) -> &str {
        match self {
            EntityKind::FRouter => "frouter",
            EntityKind::Node => "node",
            EntityKind::Component => "component",
        }
    }
}

/// Error taxonomy shared by the compiler, selector, supervisor and API layer.
#[derive(Debug, Error)]
pub enum VeaError {
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("{} not found: {id}", .kind.as_str())]
    NotFound { kind: EntityKind, id: String },

    #[error("engine {engine} is not installed: {cause}")]
    EngineNotInstalled { engine: String, cause: String },

    #[error("busy: {0}")]
    Busy(String),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl VeaError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        VeaError::InvalidData(msg.into())
    }

    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        VeaError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Compile failures count as invalid data for callers that only care
    /// about "the request was wrong".
    pub fn is_invalid_data(&self) -> bool {
        matches!(self, VeaError::InvalidData(_) | VeaError::Compile(_))
    }

    pub fn compile_problems(&self) -> Option<&[String]> {
        match self {
            VeaError::Compile(err) => Some(&err.problems),
            _ => None,
        }
    }
}

pub type VeaResult<T> = std::result::Result<T, VeaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_joins_problems() {
        let err = CompileError::new(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "a; b");
        assert_eq!(CompileError::new(Vec::new()).to_string(), "compile error");
    }

    #[test]
    fn test_compile_error_is_invalid_data() {
        let err: VeaError = CompileError::new(vec!["missing default edge".to_string()]).into();
        assert!(err.is_invalid_data());
        assert_eq!(err.compile_problems().map(|p| p.len()), Some(1));

        let busy = VeaError::Busy("starting".to_string());
        assert!(!busy.is_invalid_data());
    }

    #[test]
    fn test_not_found_message() {
        let err = VeaError::not_found(EntityKind::FRouter, "fr-1");
        assert_eq!(err.to_string(), "frouter not found: fr-1");
    }
}
