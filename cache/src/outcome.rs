use std::sync::Arc;

/// Why a `get()` did not produce a value.
///
/// Every waiter attached to a failed invocation gets its own clone of the same error,
/// so the producer's error is shared behind an [`Arc`] instead of being required to be `Clone`.
#[derive(Debug, thiserror::Error)]
pub enum CacheError<E> {
    #[error("producer failed: {0}")]
    Producer(Arc<E>),
    #[error("producer panicked: {0}")]
    Panicked(String),
    #[error("in-flight request died before publishing a result")]
    Abandoned,
    #[error("no Tokio runtime available to run the producer")]
    NoRuntime,
}

impl<E> CacheError<E> {
    /// The producer's own error, if that is what this is.
    pub fn producer_error(&self) -> Option<&E> {
        match self {
            CacheError::Producer(e) => Some(e),
            CacheError::Panicked(_) | CacheError::Abandoned | CacheError::NoRuntime => None,
        }
    }
}

// derive(Clone) would demand `E: Clone`
impl<E> Clone for CacheError<E> {
    fn clone(&self) -> Self {
        match self {
            CacheError::Producer(e) => CacheError::Producer(e.clone()),
            CacheError::Panicked(msg) => CacheError::Panicked(msg.clone()),
            CacheError::Abandoned => CacheError::Abandoned,
            CacheError::NoRuntime => CacheError::NoRuntime,
        }
    }
}

/// What the cache currently holds.
#[derive(Debug)]
pub enum Outcome<T, E> {
    /// Nothing has completed since construction or the last `clear()`.
    Empty,
    Value(T),
    Error(CacheError<E>),
}

impl<T, E> Outcome<T, E> {
    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Outcome::Empty)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(v) => Some(v),
            Outcome::Empty | Outcome::Error(_) => None,
        }
    }

    /// Converts a finished outcome back into what a waiter sees.
    ///
    /// Returns `None` for [`Outcome::Empty`].
    pub fn into_result(self) -> Option<Result<T, CacheError<E>>> {
        match self {
            Outcome::Empty => None,
            Outcome::Value(v) => Some(Ok(v)),
            Outcome::Error(e) => Some(Err(e)),
        }
    }
}

impl<T, E> From<Result<T, CacheError<E>>> for Outcome<T, E> {
    fn from(res: Result<T, CacheError<E>>) -> Self {
        match res {
            Ok(v) => Outcome::Value(v),
            Err(e) => Outcome::Error(e),
        }
    }
}

impl<T: Clone, E> Clone for Outcome<T, E> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Empty => Outcome::Empty,
            Outcome::Value(v) => Outcome::Value(v.clone()),
            Outcome::Error(e) => Outcome::Error(e.clone()),
        }
    }
}

impl<T, E> Default for Outcome<T, E> {
    fn default() -> Self {
        Outcome::Empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, thiserror::Error)]
    #[error("not cloneable")]
    struct NotClone;

    #[test]
    fn errors_clone_without_cloning_the_producer_error() {
        let err: CacheError<NotClone> = CacheError::Producer(Arc::new(NotClone));
        let copy = err.clone();
        match (&err, &copy) {
            (CacheError::Producer(a), CacheError::Producer(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("Expected producer errors, got: {err:?} / {copy:?}"),
        }
        assert_eq!(copy.producer_error(), Some(&NotClone));
        assert_eq!(err.to_string(), "producer failed: not cloneable");
    }

    #[test]
    fn empty_has_no_result() {
        let empty: Outcome<u32, NotClone> = Outcome::default();
        assert!(empty.is_empty());
        assert!(!empty.is_value());
        assert!(empty.into_result().is_none());

        let value: Outcome<u32, NotClone> = Ok(7).into();
        assert_eq!(value.value(), Some(&7));
        assert!(matches!(value.into_result(), Some(Ok(7))));
    }
}
