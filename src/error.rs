use thiserror::Error;

/// Failure taxonomy for the external-tools core. Every variant maps to a
/// structured API response; none of these are fatal to the process.
#[derive(Debug, Error)]
pub(crate) enum ToolError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("External tools not enabled")]
    NotEntitled,

    #[error("Tool not found or disabled")]
    ToolNotFound,

    #[error("{0} not configured")]
    Misconfigured(&'static str),

    #[error("Tool ID already exists")]
    DuplicateId(String),

    #[error("Maximum {0} tools allowed per user")]
    LimitExceeded(usize),

    #[error("Unknown tool type: {0}")]
    UnknownToolType(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),
}

impl ToolError {
    pub(crate) fn status_code(&self) -> u16 {
        match self {
            Self::NotAuthenticated => 401,
            Self::NotEntitled => 403,
            Self::ToolNotFound
            | Self::Misconfigured(_)
            | Self::DuplicateId(_)
            | Self::LimitExceeded(_)
            | Self::UnknownToolType(_) => 400,
            Self::Persistence(_) => 500,
        }
    }
}

impl From<rusqlite::Error> for ToolError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}
