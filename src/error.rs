use std::path::PathBuf;

use thiserror::Error;

/// Failure modes of the analysis core.
///
/// Most of the pipeline prefers degrading over failing: an unparseable
/// subtree becomes a no-op, an unresolvable import becomes an unknown
/// module object. The variants here cover the cases a caller genuinely
/// has to handle.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// A fuzzy value was asked for its single concrete value while holding
    /// zero or more than one member. Recoverable: callers typically fall
    /// back to treating the value as unknown.
    #[error("ambiguous value: {0}")]
    AmbiguousValue(String),

    /// A name lookup missed every namespace in the frame chain. The
    /// missing-symbol scanner treats this as its primary signal, not as
    /// an error.
    #[error("undefined name: {0}")]
    UndefinedName(String),

    /// An import target could not be resolved to a file or native module.
    #[error("module unresolvable: {0}")]
    ModuleUnresolvable(String),

    /// A persisted index file failed to deserialize. Fatal for that
    /// location index only; the caller should rebuild it from scratch.
    #[error("corrupt index data at {path}")]
    IndexCorruption {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
