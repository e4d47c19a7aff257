use thiserror::Error;

/// Errors surfaced through the administrative interfaces.
///
/// The packet path does not use this type; packet-path failures become a
/// [`crate::types::Verdict`] plus a statistic.
#[derive(Error, Debug)]
pub enum Nat64Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0} already exists")]
    Exists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Stateless operation requested on a stateful instance: {0}")]
    StatefulOnly(&'static str),

    #[error("Malformed control message: {0}")]
    Message(String),
}

impl Nat64Error {
    /// errno-flavored status code for the control plane.
    pub fn status(&self) -> u16 {
        match self {
            Nat64Error::Io(_) => 5,
            Nat64Error::Config(_) | Nat64Error::Invalid(_) => 22,
            Nat64Error::Exists(_) => 17,
            Nat64Error::NotFound(_) => 3,
            Nat64Error::StatefulOnly(_) => 95,
            Nat64Error::Message(_) => 74,
        }
    }
}

pub type Result<T> = std::result::Result<T, Nat64Error>;
