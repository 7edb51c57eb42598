use thiserror::Error;

use crate::{dom::SelectorError, modal::ModalState};

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("required element `{0}` not found")]
    MissingElement(String),
    #[error("no modal session is active")]
    NoActiveSession,
    #[error("a submission is already in flight for this form")]
    SubmitInFlight,
    #[error("modal cannot {action} while {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: ModalState,
    },
    #[error("no post-success handler registered as `{0}`")]
    UnknownHandler(String),
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error("invalid url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
}

/// Failure at the HTTP seam. Its detail is logged, never shown to the user.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("response body unreadable: {0}")]
    Body(String),
    #[error("transport is unavailable")]
    Unavailable,
}

pub type ConsoleResult<T> = std::result::Result<T, ConsoleError>;
