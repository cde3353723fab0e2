use thiserror::Error;

/// Failure kinds surfaced by the crate. Public APIs return `anyhow::Result`;
/// callers that need to distinguish kinds (e.g. the CLI picking an exit
/// code) downcast to this enum.
#[derive(Error, Debug)]
pub enum ScoalError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("parse error at byte {position}: {msg}")]
    Parse { position: usize, msg: String },
    #[error("unresolved identifier: {ident}")]
    Name { ident: String },
    #[error("model error: {0}")]
    Model(String),
    #[error("integration error: {0}")]
    Integration(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl ScoalError {
    /// True for the error kinds that indicate a bad input document rather
    /// than a runtime numerical failure.
    pub fn is_config_class(&self) -> bool {
        matches!(
            self,
            ScoalError::Config(_)
                | ScoalError::Parse { .. }
                | ScoalError::Name { .. }
                | ScoalError::Model(_)
        )
    }
}
