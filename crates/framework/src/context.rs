//! Immutable context threaded through environment hooks and feature steps.
//!
//! A [`Context`] is a persistent key/value store. "Changing" a context always
//! produces a new value and leaves the original untouched, so every hook and
//! step hands its successor a fresh snapshot:
//!
//! ```rust
//! use e2e_framework::context::{Context, ContextKey};
//!
//! const REPLICAS: ContextKey<u32> = ContextKey::new("replicas");
//!
//! let before = Context::new();
//! let after = before.with_value(&REPLICAS, 3);
//!
//! assert!(before.value(&REPLICAS).is_err());
//! assert_eq!(*after.value(&REPLICAS).unwrap(), 3);
//! ```
//!
//! Values are looked up through typed [`ContextKey`]s. A missing key or a
//! value stored under the same name with another type is reported as a
//! [`ContextError`] instead of a panic.
//!
//! The context may also carry a cancellation token and a deadline. The engine
//! only passes them along; honoring them is up to individual hooks and steps.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Context lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("Missing context value for key '{key}'")]
    Missing { key: String },

    #[error("Context value for key '{key}' is not of type {expected}")]
    TypeMismatch { key: String, expected: &'static str },
}

/// Typed handle for a context entry.
///
/// Keys are identified by name. Use [`ContextKey::new`] for `const` keys and
/// [`ContextKey::named`] for keys computed at run time (for example one key
/// per test name).
pub struct ContextKey<T> {
    name: Cow<'static, str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    /// Create a key with a static name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            _marker: PhantomData,
        }
    }

    /// Create a key with a name built at run time.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            _marker: PhantomData,
        }
    }

    /// The key name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextKey")
            .field("name", &self.name)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

type Value = Arc<dyn Any + Send + Sync>;

/// Persistent value chain passed between hooks and steps.
///
/// Cloning is cheap (structural sharing), which is what allows the engine to
/// keep the previous context around when a hook fails.
#[derive(Clone, Default)]
pub struct Context {
    values: im::HashMap<String, Value>,
    cancellation: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Context {
    /// Create an empty context with no cancellation token and no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new context with `value` stored under `key`.
    ///
    /// An existing value under the same key name is shadowed in the returned
    /// context only.
    #[must_use]
    pub fn with_value<T>(&self, key: &ContextKey<T>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        let mut next = self.clone();
        next.values.insert(key.name().to_string(), Arc::new(value));
        next
    }

    /// Return a new context without the entry for `key`.
    #[must_use]
    pub fn without<T>(&self, key: &ContextKey<T>) -> Self {
        let mut next = self.clone();
        next.values = next.values.without(key.name());
        next
    }

    /// Look up the value stored under `key`.
    pub fn value<T>(&self, key: &ContextKey<T>) -> Result<Arc<T>, ContextError>
    where
        T: Any + Send + Sync,
    {
        let value = self
            .values
            .get(key.name())
            .ok_or_else(|| ContextError::Missing {
                key: key.name().to_string(),
            })?;

        Arc::clone(value)
            .downcast::<T>()
            .map_err(|_| ContextError::TypeMismatch {
                key: key.name().to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Look up a value and clone it out of the context.
    pub fn cloned<T>(&self, key: &ContextKey<T>) -> Result<T, ContextError>
    where
        T: Any + Send + Sync + Clone,
    {
        self.value(key).map(|v| T::clone(&v))
    }

    /// Whether an entry exists under `name`, regardless of its type.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Return a new context carrying `token`.
    #[must_use]
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        let mut next = self.clone();
        next.cancellation = Some(token);
        next
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Return a new context with an absolute deadline.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut next = self.clone();
        next.deadline = Some(deadline);
        next
    }

    /// Return a new context whose deadline is `timeout` from now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the token was cancelled or the deadline has passed.
    pub fn is_done(&self) -> bool {
        let cancelled = self
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled);
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        cancelled || expired
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("Context")
            .field("keys", &keys)
            .field("cancellable", &self.cancellation.is_some())
            .field("deadline", &self.deadline)
            .finish()
    }
}
