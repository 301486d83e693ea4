use thiserror::Error;

/// Constructs and returns a [`std::io::Error`] with a formatted message.
/// Used throughout the wire codec, where everything is an `io::Result`.
#[macro_export]
macro_rules! bail {
    ($kind:ident, $($arg:tt)*) => {
        // Construct the I/O error.
        return Err(
            ::std::io::Error::new(::std::io::ErrorKind::$kind, format!($($arg)*))
        )
    };
}

/// Errors surfaced outside the wire codec: configuration, startup and the
/// Redis logging side-channel.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("failed to create backend pool: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),

    #[error("failed to acquire backend connection: {0}")]
    AcquireConn(#[from] deadpool_redis::PoolError),

    #[error(transparent)]
    Backend(#[from] redis::RedisError),

    /// A backend command did not complete within the configured read timeout.
    #[error("backend command timed out")]
    BackendTimeout,
}
