use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a driver operation.
pub type HardlinksResult<T> = Result<T, HardlinksError>;

/// An error that occurred during a driver operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum HardlinksError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The layer directory or its `root/` does not exist.
    #[error("layer directory is not present: {0}")]
    LayerNotFound(PathBuf),

    /// The parent layer directory or its `root/` does not exist.
    #[error("parent layer directory is not present: {0}")]
    ParentNotFound(PathBuf),

    /// A layer with the same id already exists.
    #[error("layer already exists: {0}")]
    LayerAlreadyExists(String),

    /// A filesystem operation failed while copying a tree.
    #[error("failed to copy {path}: {source}")]
    Copy {
        /// The path being copied when the failure happened.
        path: PathBuf,

        /// The underlying error.
        source: io::Error,
    },

    /// A diff archive could not be applied.
    #[error("failed to extract diff: {0}")]
    Extract(String),

    /// A bind mount could not be established.
    #[error("failed to bind mount {source_path} on {target}: {errno}")]
    Mount {
        /// The directory being exposed.
        source_path: PathBuf,

        /// The mount point.
        target: PathBuf,

        /// The error returned by the mount call.
        errno: nix::Error,
    },

    /// A mount point could not be unmounted.
    #[error("failed to unmount {target}: {errno}")]
    Unmount {
        /// The mount point.
        target: PathBuf,

        /// The error returned by the unmount call.
        errno: nix::Error,
    },

    /// Mounting is not available on this platform.
    #[error("mounting is not supported on this platform")]
    MountUnsupported,

    /// An invalid driver option was supplied.
    #[error("invalid driver option: {0}")]
    InvalidOption(String),

    /// An invalid or unsatisfiable ID mapping was used.
    #[error("invalid id mapping: {0}")]
    InvalidIdMapping(String),

    /// No driver is registered under the requested name.
    #[error("driver not registered: {0}")]
    DriverNotRegistered(String),

    /// A driver is already registered under the requested name.
    #[error("driver already registered: {0}")]
    DriverAlreadyRegistered(String),

    /// A blocking task panicked or was cancelled.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HardlinksError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> HardlinksError {
        HardlinksError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Wraps an I/O error with the path that was being copied.
    pub(crate) fn copy(path: impl Into<PathBuf>, source: io::Error) -> HardlinksError {
        HardlinksError::Copy {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` if the error means a layer or its parent is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HardlinksError::LayerNotFound(_) | HardlinksError::ParentNotFound(_)
        )
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `HardlinksResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> HardlinksResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
