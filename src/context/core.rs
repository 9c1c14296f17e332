use dashmap::DashMap;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Type-erased attribute value. Values are shared, never deep-cloned.
pub type AttributeValue = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
struct Attribute {
    value: AttributeValue,
    serializable: bool,
}

/// Mutable attribute bag for a single logical request.
///
/// `Context` is a handle: cloning it shares the same attributes, which is how
/// the current-context slot hands out the context it holds. Use
/// [`Context::copy`] to get an independent bag whose key insertions and
/// removals are invisible to the original (the values themselves are shared).
#[derive(Clone, Default)]
pub struct Context {
    attributes: Arc<DashMap<String, Attribute>>,
}

impl Context {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an independent copy of this context.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            attributes: Arc::new((*self.attributes).clone()),
        }
    }

    /// Canonical attribute name used for type-keyed attributes.
    #[inline]
    #[must_use]
    pub fn type_key<T: ?Sized + 'static>() -> &'static str {
        std::any::type_name::<T>()
    }

    /// Get the raw attribute value stored under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<AttributeValue> {
        self.attributes
            .get(name)
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Get the attribute stored under `name` as a `T`.
    ///
    /// Returns `None` when the attribute is absent or holds another type.
    #[must_use]
    pub fn get_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name).and_then(|value| value.downcast::<T>().ok())
    }

    /// Get the attribute keyed by the type name of `T`.
    #[must_use]
    pub fn get_typed<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.get_as::<T>(Self::type_key::<T>())
    }

    /// Set or remove an attribute.
    ///
    /// `None` removes the key. A stored value is not confirmed serializable,
    /// so a warning is logged: such attributes cannot cross a process boundary.
    /// Prefer [`Context::set_serializable`] for values that implement `Serialize`.
    pub fn set<T: Any + Send + Sync>(&self, name: impl Into<String>, value: Option<T>) -> &Self {
        let name = name.into();
        match value {
            None => {
                self.attributes.remove(&name);
            }
            Some(value) => {
                warn!(
                    attribute = %name,
                    value_type = std::any::type_name::<T>(),
                    "Context attribute value is not confirmed serializable"
                );
                self.insert(name, Arc::new(value), false);
            }
        }
        self
    }

    /// Set or remove an attribute whose value is known to be serializable.
    pub fn set_serializable<T>(&self, name: impl Into<String>, value: Option<T>) -> &Self
    where
        T: Serialize + Any + Send + Sync,
    {
        let name = name.into();
        match value {
            None => {
                self.attributes.remove(&name);
            }
            Some(value) => self.insert(name, Arc::new(value), true),
        }
        self
    }

    /// Set or remove the attribute keyed by the type name of `T`.
    pub fn set_typed<T>(&self, value: Option<T>) -> &Self
    where
        T: Serialize + Any + Send + Sync,
    {
        self.set_serializable(Self::type_key::<T>(), value)
    }

    /// Store an already shared value. Serializability is unknown, so this warns
    /// like [`Context::set`].
    pub fn set_shared(&self, name: impl Into<String>, value: AttributeValue) -> &Self {
        let name = name.into();
        warn!(
            attribute = %name,
            "Context attribute value is not confirmed serializable"
        );
        self.insert(name, value, false);
        self
    }

    /// Remove an attribute, returning its value.
    pub fn remove(&self, name: &str) -> Option<AttributeValue> {
        self.attributes.remove(name).map(|(_, attr)| attr.value)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Whether the attribute under `name` was stored as serializable.
    #[must_use]
    pub fn is_serializable(&self, name: &str) -> bool {
        self.attributes
            .get(name)
            .map(|entry| entry.serializable)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Attribute names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .attributes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Whether two handles share the same attribute bag.
    #[must_use]
    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.attributes, &other.attributes)
    }

    fn insert(&self, name: String, value: AttributeValue, serializable: bool) {
        self.attributes.insert(
            name,
            Attribute {
                value,
                serializable,
            },
        );
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("attributes", &self.names())
            .finish()
    }
}
