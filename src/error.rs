use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Error related to an invalid endpoint or protocol options; never retried
    Configuration,
    /// Error related to the transport (handshake, abnormal close, network); retried via backoff
    Transport,
    /// Reconnection attempts exhausted; terminal until a manual reconnect
    Exhausted,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn configuration<S: Into<String>>(reason: S) -> Self {
        Configuration {
            reason: reason.into(),
        }
        .into()
    }

    #[must_use]
    pub fn exhausted() -> Self {
        Exhausted.into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{src}"),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Bad endpoint or protocol options. Fatal: the manager moves to `Failed`
/// without scheduling a retry.
#[non_exhaustive]
#[derive(Debug)]
pub struct Configuration {
    pub reason: String,
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.reason)
    }
}

impl StdError for Configuration {}

/// The reconnect attempt limit was reached. The display string is what lands
/// in the observable `error` field.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Exhausted;

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reconnection failed after maximum attempts")
    }
}

impl StdError for Exhausted {}

/// Transient transport failures, subject to the backoff policy.
#[non_exhaustive]
#[derive(Debug)]
pub enum Transport {
    /// Error connecting to or communicating with the server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The connection closed without a normal closure signal
    ClosedAbnormally(String),
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "connection error: {e}"),
            Self::ClosedAbnormally(detail) => write!(f, "connection closed abnormally: {detail}"),
        }
    }
}

impl StdError for Transport {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::ClosedAbnormally(_) => None,
        }
    }
}

impl From<Configuration> for Error {
    fn from(err: Configuration) -> Self {
        Self::with_source(Kind::Configuration, err)
    }
}

impl From<Exhausted> for Error {
    fn from(err: Exhausted) -> Self {
        Self::with_source(Kind::Exhausted, err)
    }
}

impl From<Transport> for Error {
    fn from(err: Transport) -> Self {
        Self::with_source(Kind::Transport, err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::with_source(Kind::Transport, Transport::Connection(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::with_source(Kind::Internal, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_display_should_succeed() {
        let error = Error::configuration("unsupported scheme \"http\"");
        assert_eq!(error.kind(), Kind::Configuration);
        assert_eq!(
            error.to_string(),
            "invalid configuration: unsupported scheme \"http\""
        );
    }

    #[test]
    fn exhausted_display_matches_observable_error() {
        let error = Error::exhausted();
        assert_eq!(error.kind(), Kind::Exhausted);
        assert_eq!(error.to_string(), "Reconnection failed after maximum attempts");
    }

    #[test]
    fn transport_into_error_should_succeed() {
        let error: Error = Transport::ClosedAbnormally("code 1006".to_owned()).into();
        assert_eq!(error.kind(), Kind::Transport);
        assert!(error.to_string().contains("1006"));
    }

    #[test]
    fn downcast_recovers_source() {
        let error: Error = Configuration {
            reason: "bad endpoint".to_owned(),
        }
        .into();
        let inner = error.downcast_ref::<Configuration>().expect("source type");
        assert_eq!(inner.reason, "bad endpoint");
    }
}
