pub use anyhow::Error;
use std::fmt::Display;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Like debug_assert, but bails instead of panicking.
///
/// Returning an error often allows us to give more context as to what we were
/// trying to do, e.g. which file / section / offset we were processing,
/// whereas a panic just gives us a function backtrace.
#[macro_export]
macro_rules! debug_assert_bail {
    ($e:expr, $($rest:tt)*) => {
        if cfg!(debug_assertions) && !$e {
            anyhow::bail!($($rest)*);
        }
    };
}

/// Prints a warning. By using our own function for this, it'll be easier to
/// find places that issue warnings if we later want a flag to suppress them.
/// Validation problems that shouldn't stop the link go through here so that we
/// surface as many of them as possible in a single run.
pub(crate) fn warning(message: &str) {
    tracing::warn!("{message}");
    eprintln!("warning: weld: {message}");
}

/// An error indicating that the operating system's entropy source failed.
/// Surfaced when a UUID build ID was requested.
#[derive(Debug, Clone, Copy)]
pub struct EntropySourceFailure;

impl Display for EntropySourceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entropy source failure")
    }
}

impl core::error::Error for EntropySourceFailure {}
