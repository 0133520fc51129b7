use std::io;

use crate::sync::EglError;

/// Errors produced by the fence backends and the test harness
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// None of the sw_sync device nodes could be opened.
    ///
    /// Subtests treat this as inconclusive and skip.
    #[error("no sw_sync device is available")]
    ResourceUnavailable,
    /// An ioctl or descriptor operation returned an error
    #[error("{operation} failed: {source}")]
    OperationFailed {
        /// Name of the failing operation
        operation: &'static str,
        /// Error reported by the kernel
        #[source]
        source: io::Error,
    },
    /// The EGL implementation rejected the call with the given error
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] EglError),
    /// A subtest was requested that is not registered
    #[error("unknown subtest `{0}`")]
    UnknownSubtest(String),
    /// libEGL or one of the required entry points could not be loaded
    #[error("EGL is unavailable: {0}")]
    EglUnavailable(String),
}

impl Error {
    pub(crate) fn last_os_error(operation: &'static str) -> Error {
        Error::OperationFailed {
            operation,
            source: io::Error::last_os_error(),
        }
    }

    /// Whether this error means the host cannot run the test at all
    pub fn is_inconclusive(&self) -> bool {
        matches!(self, Error::ResourceUnavailable | Error::EglUnavailable(_))
    }
}

/// Result type used throughout this crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod test {
    use super::*;

    fn reject() -> Result<()> {
        let rejected: Result<(), EglError> = Err(EglError::BadMatch);
        rejected?;
        Ok(())
    }

    #[test]
    fn egl_errors_convert() {
        let err = reject().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(EglError::BadMatch)));
        assert!(!err.is_inconclusive());
        assert_eq!(err.to_string(), "invalid argument: EGL_BAD_MATCH");
    }

    #[test]
    fn missing_device_is_inconclusive() {
        assert!(Error::ResourceUnavailable.is_inconclusive());
        assert!(Error::EglUnavailable("no libEGL".to_owned()).is_inconclusive());
        assert!(!Error::UnknownSubtest("x".to_owned()).is_inconclusive());
    }
}
