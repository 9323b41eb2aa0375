/// Error types for the klio coordination layer.
///
/// One enum covers both sides of the system: command handling (authorization,
/// preconditions, optimistic concurrency) and consumption (transient broker
/// failures, deserialization, fatal configuration). [`Error::class`] is what the
/// consumer runtime and the outbox relay use to decide between retry, skip and halt.
use eventstore::ClientSettingsParseError;
use std::fmt::Debug;
use thiserror::Error;
use uuid::Uuid;

use crate::{Actor, AggregateVersion};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How a failure must be treated by retrying components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Deterministic; retrying cannot change the outcome.
    Permanent,
    /// Infrastructure hiccup; retry with backoff.
    Transient,
    /// Credential/token problem; retry on the fixed authentication interval.
    Authentication,
    /// Requires operator intervention; halt.
    Fatal,
}

/// Represents errors that can occur in the klio event sourcing system
#[derive(Debug, Error)]
pub enum Error {
    /// No snapshot exists for the requested identifier
    #[error("Aggregate not found: {identifier}")]
    NotFound { identifier: Uuid },

    /// The command was issued against an outdated version of the aggregate
    #[error("Command for '{identifier}' expected version {expected}, but aggregate is at version {actual}")]
    StaleCommand {
        identifier: Uuid,
        expected: AggregateVersion,
        actual: AggregateVersion,
    },

    /// The stored version changed between load and save
    #[error("Concurrent modification of '{identifier}': {}", match actual {
        Some(a) => format!("expected stored version {expected}, but found {a}"),
        None => format!("expected stored version {expected}, but aggregate does not exist"),
    })]
    Concurrency {
        identifier: Uuid,
        expected: AggregateVersion,
        actual: Option<AggregateVersion>,
    },

    /// The actor is not permitted to execute the command
    #[error("Actor '{actor}' is not authorized: {reason}")]
    Authorization { actor: Actor, reason: String },

    /// A domain invariant would be violated; `reason` is a machine-readable code
    #[error("Precondition violated: {reason}")]
    Precondition { reason: String },

    /// Broker unavailable, schema lookup hiccup and similar recoverable failures
    #[error("Transient infrastructure failure: {message}")]
    TransientInfra {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Broker rejected our credentials, typically a token refresh race
    #[error("Authentication failure: {message}")]
    Authentication { message: String },

    /// Indicates a failure to serialize or deserialize an envelope
    #[error(transparent)]
    Deserialization(#[from] serde_json::error::Error),

    /// A listener rejected an event for good; the message is processed but not applied
    #[error("Event rejected: {message}")]
    Rejected {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A condition that only an operator can resolve, e.g. an unknown event type
    #[error("Fatal configuration error: {message}")]
    FatalConfiguration { message: String },

    /// An event arrived whose version does not follow the stored one
    #[error("Event for '{identifier}' at version {received} cannot follow stored version {stored}")]
    OutOfOrder {
        identifier: Uuid,
        stored: AggregateVersion,
        received: AggregateVersion,
    },

    /// The log has no such topic
    #[error("Topic not found: {topic}")]
    TopicNotFound { topic: String },

    /// Indicates an invalid configuration parameter
    #[error("Invalid configuration{}: {message}", parameter.as_ref().map(|p| format!(" parameter '{p}'")).unwrap_or_default())]
    InvalidConfig {
        message: String,
        parameter: Option<String>,
    },

    /// Indicates that maximum retry attempts were exceeded
    #[error("Command execution exceeded maximum retries ({max_retries}) for '{stream}'")]
    MaxRetriesExceeded { stream: String, max_retries: u32 },

    /// A bounded retry policy gave up
    #[error("Giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Indicates a failure to parse event store connection settings
    #[error(transparent)]
    KurrentSettings(#[from] ClientSettingsParseError),

    /// Indicates a general event store error
    #[error(transparent)]
    Kurrent(#[from] eventstore::Error),
}

impl Error {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientInfra {
            message: message.into(),
            source: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            source: None,
        }
    }

    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::Precondition {
            reason: reason.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::FatalConfiguration {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_config(parameter: &str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            parameter: Some(parameter.to_string()),
        }
    }

    /// Classifies the error for retry decisions.
    pub fn class(&self) -> FailureClass {
        match self {
            Error::TransientInfra { .. } => FailureClass::Transient,
            Error::Authentication { .. } => FailureClass::Authentication,
            Error::FatalConfiguration { .. } | Error::InvalidConfig { .. } => FailureClass::Fatal,
            Error::TopicNotFound { .. } => FailureClass::Fatal,
            Error::Kurrent(source) => kurrent_class(source),
            Error::RetriesExhausted { source, .. } => match source.class() {
                FailureClass::Fatal => FailureClass::Fatal,
                _ => FailureClass::Permanent,
            },
            Error::NotFound { .. }
            | Error::StaleCommand { .. }
            | Error::Concurrency { .. }
            | Error::Authorization { .. }
            | Error::Precondition { .. }
            | Error::Deserialization(_)
            | Error::Rejected { .. }
            | Error::OutOfOrder { .. }
            | Error::MaxRetriesExceeded { .. }
            | Error::KurrentSettings(_) => FailureClass::Permanent,
        }
    }

    /// `true` for version mismatches the caller resolves by reloading.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::StaleCommand { .. } | Error::Concurrency { .. })
    }
}

fn kurrent_class(error: &eventstore::Error) -> FailureClass {
    match error {
        eventstore::Error::AccessDenied => FailureClass::Authentication,
        eventstore::Error::GrpcConnectionError(_) | eventstore::Error::DeadlineExceeded => {
            FailureClass::Transient
        }
        eventstore::Error::Grpc { code, .. } => match code {
            tonic::Code::Unavailable | tonic::Code::DeadlineExceeded | tonic::Code::Aborted => {
                FailureClass::Transient
            }
            tonic::Code::Unauthenticated | tonic::Code::PermissionDenied => {
                FailureClass::Authentication
            }
            _ => FailureClass::Permanent,
        },
        _ => FailureClass::Permanent,
    }
}
