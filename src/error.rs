//! Error types shared by every stage of the crawl pipeline.
//!
//! `SpiderError` is the crate-wide error. Callback argument binding failures
//! have their own `BindingError` enum because their messages are parsed by
//! external tooling and must match a fixed format.

use crate::request::Request;
use thiserror::Error;

/// The crate-wide error type.
#[derive(Debug, Error)]
pub enum SpiderError {
    /// `cb_kwargs` could not be bound against the callback's parameters.
    #[error(transparent)]
    Binding(#[from] BindingError),

    /// The fetch collaborator failed and no downloader middleware recovered.
    #[error("transport error for {url}: {reason}")]
    Transport { url: String, reason: String },

    /// A middleware hook raised.
    #[error("middleware '{middleware}' failed: {reason}")]
    Middleware { middleware: String, reason: String },

    /// A callback raised while producing its output.
    #[error("callback '{callback}' failed: {reason}")]
    Callback { callback: String, reason: String },

    /// The request names a callback the spider never registered.
    #[error("spider has no callback named '{0}'")]
    UnknownCallback(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("{0}")]
    GeneralError(String),

    #[error("invalid url: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid toml configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SpiderError {
    /// Shorthand for a middleware hook failure.
    pub fn middleware(middleware: impl Into<String>, reason: impl ToString) -> Self {
        SpiderError::Middleware {
            middleware: middleware.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a failure raised inside a callback.
    pub fn callback(callback: impl Into<String>, reason: impl ToString) -> Self {
        SpiderError::Callback {
            callback: callback.into(),
            reason: reason.to_string(),
        }
    }

    /// A short, stable name for the error kind, used in failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            SpiderError::Binding(e) => e.kind(),
            SpiderError::Transport { .. } => "TransportError",
            SpiderError::Middleware { .. } => "MiddlewareHookError",
            SpiderError::Callback { .. } => "CallbackError",
            SpiderError::UnknownCallback(_) => "UnknownCallback",
            SpiderError::ConfigurationError(_) => "ConfigurationError",
            SpiderError::GeneralError(_) => "GeneralError",
            SpiderError::UrlParse(_) => "UrlParseError",
            SpiderError::Json(_) => "JsonError",
            SpiderError::Toml(_) => "TomlError",
        }
    }
}

/// Failure to bind a keyword-argument bag to a callback signature.
///
/// The `Display` output follows the exact wording of a keyword-call type
/// error, e.g. `parse_takes_less() got an unexpected keyword argument 'number'`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("{callback}() got an unexpected keyword argument '{key}'")]
    UnexpectedArgument { callback: String, key: String },

    #[error("{callback}() missing {}", describe_missing(.missing))]
    MissingArgument {
        callback: String,
        missing: Vec<String>,
    },

    #[error("{callback}() got multiple values for argument '{name}'")]
    MultipleValues { callback: String, name: String },
}

impl BindingError {
    pub fn kind(&self) -> &'static str {
        match self {
            BindingError::UnexpectedArgument { .. } => "UnexpectedArgumentError",
            BindingError::MissingArgument { .. } => "MissingArgumentError",
            BindingError::MultipleValues { .. } => "MultipleValuesError",
        }
    }

    /// The callback the binding was attempted against.
    pub fn callback(&self) -> &str {
        match self {
            BindingError::UnexpectedArgument { callback, .. }
            | BindingError::MissingArgument { callback, .. }
            | BindingError::MultipleValues { callback, .. } => callback,
        }
    }
}

fn describe_missing(names: &[String]) -> String {
    let plural = if names.len() == 1 { "" } else { "s" };
    format!(
        "{} required positional argument{}: {}",
        names.len(),
        plural,
        quote_names(names)
    )
}

// 'a' / 'a' and 'b' / 'a', 'b', and 'c'
fn quote_names(names: &[String]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| format!("'{}'", n)).collect();
    match quoted.len() {
        0 => String::new(),
        1 => quoted[0].clone(),
        2 => format!("{} and {}", quoted[0], quoted[1]),
        n => format!("{}, and {}", quoted[..n - 1].join(", "), quoted[n - 1]),
    }
}

/// A failed fetch. Carries the request back so downloader middlewares can
/// substitute a response for it.
#[derive(Debug, Error)]
#[error("transport error for {}: {reason}", .request.url)]
pub struct TransportError {
    pub request: Box<Request>,
    pub reason: String,
}

impl TransportError {
    pub fn new(request: Request, reason: impl ToString) -> Self {
        Self {
            request: Box::new(request),
            reason: reason.to_string(),
        }
    }
}

impl From<TransportError> for SpiderError {
    fn from(err: TransportError) -> Self {
        SpiderError::Transport {
            url: err.request.url.to_string(),
            reason: err.reason,
        }
    }
}
