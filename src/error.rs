use std::{
    any::Any,
    borrow::Cow,
    fmt::{self, Debug, Display},
    rc::Rc,
    time::Duration,
};

/// Reason a promise was rejected.
///
/// Every rejection carries one of these. User code reports failures by
/// returning `Err` from executors and transforms; the value is wrapped in
/// [`Error::Thrown`] (or [`Error::custom`] for `std` errors) and travels down
/// the chain until something handles it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cancelled(#[from] CancellationError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error("type mismatch: {0}")]
    TypeMismatch(Cow<'static, str>),
    #[error("{0}")]
    Thrown(Thrown),
}

impl Error {
    pub fn cancelled() -> Self {
        Error::Cancelled(CancellationError)
    }

    pub fn type_mismatch(message: impl Into<Cow<'static, str>>) -> Self {
        Error::TypeMismatch(message.into())
    }

    /// Wraps an arbitrary value, the way a script would `throw` it.
    pub fn thrown<V: Any + Debug>(value: V) -> Self {
        Error::Thrown(Thrown::new(value))
    }

    /// Wraps a `std` error. It can be recovered with [`Error::downcast_ref`].
    pub fn custom<E: std::error::Error + 'static>(error: E) -> Self {
        let description = error.to_string();
        Error::Thrown(Thrown {
            value: Rc::new(error),
            description,
        })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Returns the thrown value if it has type `V`.
    pub fn downcast_ref<V: Any>(&self) -> Option<&V> {
        match self {
            Error::Thrown(thrown) => thrown.downcast_ref(),
            _ => None,
        }
    }
}

/// Raised when a pending promise is cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, thiserror::Error)]
#[error("promise was cancelled")]
pub struct CancellationError;

/// Raised by [`timeout`](crate::timeout) when the guarded promise loses the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("promise timed out after {after:?}")]
pub struct TimeoutError {
    pub after: Duration,
}

/// An opaque user value carried as a rejection reason.
#[derive(Clone)]
pub struct Thrown {
    value: Rc<dyn Any>,
    description: String,
}

impl Thrown {
    pub fn new<V: Any + Debug>(value: V) -> Self {
        let description = format!("{value:?}");
        Self {
            value: Rc::new(value),
            description,
        }
    }

    pub(crate) fn opaque<V: Any>(value: V, description: impl Into<String>) -> Self {
        Self {
            value: Rc::new(value),
            description: description.into(),
        }
    }

    pub fn downcast_ref<V: Any>(&self) -> Option<&V> {
        self.value.downcast_ref()
    }

    /// Whether both handles carry the very same thrown value.
    pub fn same_value(&self, other: &Thrown) -> bool {
        Rc::ptr_eq(&self.value, &other.value)
    }
}

impl Debug for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Thrown").field(&self.description).finish()
    }
}

impl Display for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct DiskError;

    #[test]
    fn test_thrown_downcast() {
        let err = Error::thrown(42u32);
        assert_eq!(err.downcast_ref::<u32>(), Some(&42));
        assert_eq!(err.downcast_ref::<i64>(), None);
        assert_eq!(err.to_string(), "42");
    }

    #[test]
    fn test_custom_keeps_message() {
        let err = Error::custom(DiskError);
        assert_eq!(err.to_string(), "disk on fire");
        assert!(err.downcast_ref::<DiskError>().is_some());
    }

    #[test]
    fn test_kinds() {
        assert!(Error::cancelled().is_cancelled());
        let timeout = Error::from(TimeoutError {
            after: Duration::from_millis(5),
        });
        assert!(timeout.is_timeout());
        assert_eq!(timeout.to_string(), "promise timed out after 5ms");
        assert_eq!(
            Error::type_mismatch("bad bound").to_string(),
            "type mismatch: bad bound"
        );
    }
}
