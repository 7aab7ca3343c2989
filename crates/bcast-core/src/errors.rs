/// Structural error type for the broadcaster.
///
/// Per-send failures never surface here: they are captured as
/// [`crate::domain::SendResult`] values inside a run. This type covers
/// precondition violations and the ambient concerns (config, files).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("identity not found: {0}")]
    IdentityNotFound(String),

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("slot list is empty")]
    EmptyTemplateSet,

    #[error("invalid broadcast options: {0}")]
    InvalidOptions(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(String),

    #[error("external error: {0}")]
    External(String),
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Yaml(err.to_string())
    }
}

impl Error {
    /// True for errors caused by a bad request rather than by the environment.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::IdentityNotFound(_)
                | Error::TargetNotFound(_)
                | Error::EmptyTemplateSet
                | Error::InvalidOptions(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
