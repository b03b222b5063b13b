use std::io::ErrorKind;

use thiserror::Error;

/// Errors surfaced by the decoders.
///
/// Every error is terminal for the stream it came from: a decoder that has
/// reported one is left in an unspecified state and must be discarded.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("corrupt stream: {0}")]
    CorruptStream(String),
    #[error("unexpected end of input")]
    TruncatedInput,
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl Error {
    #[inline]
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedHeader(msg.into())
    }

    #[inline]
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptStream(msg.into())
    }

    #[inline]
    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration(msg.into())
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(inner) => inner,
            e => {
                let kind = match &e {
                    Error::MalformedHeader(_) => ErrorKind::InvalidInput,
                    Error::CorruptStream(_) => ErrorKind::InvalidData,
                    Error::TruncatedInput => ErrorKind::UnexpectedEof,
                    Error::UnsupportedConfiguration(_) => ErrorKind::Unsupported,
                    Error::Io(_) => unreachable!(),
                };
                std::io::Error::new(kind, e)
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == ErrorKind::UnexpectedEof {
            return Error::TruncatedInput;
        }
        if e.get_ref().map_or(false, |r| r.is::<Error>()) {
            if let Some(Ok(err)) = e.into_inner().map(|b| b.downcast::<Error>()) {
                return *err;
            }
            return Error::TruncatedInput;
        }
        Error::Io(e)
    }
}

/// Shorthand for corrupt-stream failures raised inside `Read` impls.
#[inline]
pub(crate) fn corrupt_io(msg: impl Into<String>) -> std::io::Error {
    Error::corrupt(msg).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_round_trip_keeps_taxonomy() {
        let io: std::io::Error = Error::corrupt("bad distance").into();
        assert_eq!(io.kind(), ErrorKind::InvalidData);
        match Error::from(io) {
            Error::CorruptStream(msg) => assert_eq!(msg, "bad distance"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn eof_classifies_as_truncated() {
        let io = std::io::Error::new(ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(Error::from(io), Error::TruncatedInput));
    }
}
