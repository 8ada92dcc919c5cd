//! Common result type for functions which may fail.
use std::error;
use std::fmt;

/// ```
/// use turfwar::result::*;
///
/// fn foo() -> TurfResult<()> {
///     let status: Result<(), &str> = Err("PROBLEM");
///     status?;
///     Ok(())
/// }
///
/// assert_eq!(foo().err().unwrap().to_string(), "PROBLEM");
/// ```
pub type TurfResult<T> = std::result::Result<T, TurfError>;

#[derive(Debug, Clone)]
pub enum TurfError {
    /// General error/failure messages.
    Message(String),

    /// Socket or filesystem failure.
    Io(String),

    /// Backing store connection or statement failure.  Always
    /// recovered locally by retrying.
    Storage(String),

    /// A static asset could not be read.
    Asset(String),
}

impl error::Error for TurfError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

impl fmt::Display for TurfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Message(ref m) => write!(f, "{m}"),
            Self::Io(ref e) => write!(f, "IO: {e}"),
            Self::Storage(ref e) => write!(f, "Storage: {e}"),
            Self::Asset(ref e) => write!(f, "Asset: {e}"),
        }
    }
}

impl From<String> for TurfError {
    fn from(msg: String) -> Self {
        TurfError::Message(msg)
    }
}

impl From<&str> for TurfError {
    fn from(msg: &str) -> Self {
        TurfError::from(msg.to_string())
    }
}

impl From<std::io::Error> for TurfError {
    fn from(err: std::io::Error) -> Self {
        TurfError::Io(err.to_string())
    }
}

/// Postgres errors can also be converted into TurfErrors, so `?`
/// works on statement results.
/// ```
/// fn connect_to_a_nonexistant_db() -> turfwar::result::TurfResult<()> {
///   postgres::Client::connect("bad-bad-connection-string", postgres::NoTls)?;
///   Ok(())
/// }
///
/// let result = connect_to_a_nonexistant_db();
/// assert!(result.err().unwrap().to_string().starts_with("Storage:"));
/// ```
impl From<postgres::Error> for TurfError {
    fn from(err: postgres::Error) -> Self {
        TurfError::Storage(err.to_string())
    }
}

/// For handing errors to mptc, which speaks String.
impl From<TurfError> for String {
    fn from(err: TurfError) -> Self {
        err.to_string()
    }
}
