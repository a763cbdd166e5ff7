use thiserror::Error;

/// Errors from repository operations (used by trait definitions in tasklane-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// A string did not name a known variant of a closed enum.
#[derive(Debug, Error)]
#[error("invalid {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        assert_eq!(RepositoryError::NotFound.to_string(), "entity not found");
        assert_eq!(
            RepositoryError::Query("syntax".into()).to_string(),
            "query error: syntax"
        );
        assert_eq!(
            RepositoryError::Conflict("dup".into()).to_string(),
            "conflict: dup"
        );
    }

    #[test]
    fn test_parse_enum_error_display() {
        let err = ParseEnumError::new("task status", "BOGUS");
        assert_eq!(err.to_string(), "invalid task status: 'BOGUS'");
    }
}
