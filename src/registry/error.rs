//! Registry error types
//!
//! Error types for subscription registry operations.

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Sid is not subscribed
    NotFound(String),
    /// Sid is already subscribed
    Exists(String),
    /// Route would exceed the packed sid list limit
    TooMany { size: usize },
    /// Wildcard pattern failed to compile
    BadPattern(String),
    /// Subject or sid is empty
    InvalidSubject(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotFound(sid) => write!(f, "Sid not found: {}", sid),
            RegistryError::Exists(sid) => write!(f, "Sid already subscribed: {}", sid),
            RegistryError::TooMany { size } => {
                write!(f, "Too many sids on route ({} bytes)", size)
            }
            RegistryError::BadPattern(p) => write!(f, "Bad wildcard pattern: {}", p),
            RegistryError::InvalidSubject(s) => write!(f, "Invalid subject: {:?}", s),
        }
    }
}

impl std::error::Error for RegistryError {}
