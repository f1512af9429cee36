//! Error primitives shared across the log shipper.
//!
//! Component-specific failures are modelled as typed errors close to where they originate. Once an error only needs to
//! be reported upwards, it is erased into a [`GenericError`], optionally wrapped with additional context.
#![deny(missing_docs)]

use std::fmt::Display;

/// A type-erased error.
pub type GenericError = anyhow::Error;

/// Constructs a [`GenericError`].
///
/// Accepts a string literal, a format string followed by its arguments, or any value that implements both `Debug` and
/// `Display`. When given an existing `std::error::Error`, its source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

/// Extension methods for attaching context to a failed `Result`.
///
/// Exists so that callers never need to import `anyhow::Context` directly, which collides with `snafu::ResultExt` in
/// modules that use both.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error with the given context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error with context that is only built when an error actually occurred.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        anyhow::Context::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        anyhow::Context::with_context(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_prepended_to_the_source() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        let error = result.error_context("Failed to append to queue segment.").unwrap_err();

        assert_eq!(error.to_string(), "Failed to append to queue segment.");
        assert_eq!(error.root_cause().to_string(), "disk full");
    }

    #[test]
    fn macro_accepts_format_arguments() {
        let error = generic_error!("destination {} is unknown", "shoot--dev--a");
        assert_eq!(error.to_string(), "destination shoot--dev--a is unknown");
    }
}
