//! Ordered documents.

use indexmap::IndexMap;
use indexmap::map::{IntoIter, Iter, IterMut, Keys, Values};

use crate::error::{BsonError, BsonResult};
use crate::value::{Array, Bson};

/// An insertion-ordered mapping of unique element names to values.
///
/// Re-inserting an existing name replaces the value in place; the element
/// keeps its original position. Equality is order-sensitive.
#[derive(Debug, Clone, Default)]
pub struct Document {
    inner: IndexMap<String, Bson>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: IndexMap::with_capacity(capacity),
        }
    }

    /// Insert or replace, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bson>) -> Option<Bson> {
        self.inner.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Bson> {
        self.inner.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Bson> {
        self.inner.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Remove an element, preserving the order of the rest.
    pub fn remove(&mut self, key: &str) -> Option<Bson> {
        self.inner.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, String, Bson> {
        self.inner.iter()
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, String, Bson> {
        self.inner.iter_mut()
    }

    pub fn keys(&self) -> Keys<'_, String, Bson> {
        self.inner.keys()
    }

    pub fn values(&self) -> Values<'_, String, Bson> {
        self.inner.values()
    }

    /// The first element, if any.
    pub fn first(&self) -> Option<(&String, &Bson)> {
        self.inner.first()
    }

    /// Look up a dotted path such as `a.b.0.c`, descending through
    /// documents and arrays.
    pub fn get_path(&self, path: &str) -> Option<&Bson> {
        let mut segments = path.split('.');
        let mut current = self.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Bson::Document(doc) => doc.get(segment)?,
                Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn typed<'a, T>(
        &'a self,
        key: &str,
        expected: &str,
        extract: impl FnOnce(&'a Bson) -> Option<T>,
    ) -> BsonResult<T> {
        let value = self
            .get(key)
            .ok_or_else(|| BsonError::mapping(format!("missing element {:?}", key)))?;
        extract(value).ok_or_else(|| {
            BsonError::mapping(format!(
                "element {:?} is {}, expected {}",
                key,
                value.element_type(),
                expected
            ))
        })
    }

    pub fn get_str(&self, key: &str) -> BsonResult<&str> {
        self.typed(key, "string", Bson::as_str)
    }

    pub fn get_i32(&self, key: &str) -> BsonResult<i32> {
        self.typed(key, "int", Bson::as_i32)
    }

    pub fn get_i64(&self, key: &str) -> BsonResult<i64> {
        self.typed(key, "long", Bson::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> BsonResult<f64> {
        self.typed(key, "double", Bson::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> BsonResult<bool> {
        self.typed(key, "bool", Bson::as_bool)
    }

    pub fn get_document(&self, key: &str) -> BsonResult<&Document> {
        self.typed(key, "object", Bson::as_document)
    }

    pub fn get_array(&self, key: &str) -> BsonResult<&Array> {
        self.typed(key, "array", Bson::as_array)
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va == vb)
    }
}

impl IntoIterator for Document {
    type Item = (String, Bson);
    type IntoIter = IntoIter<String, Bson>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl<'a> IntoIterator for &'a Document {
    type Item = (&'a String, &'a Bson);
    type IntoIter = Iter<'a, String, Bson>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl<K: Into<String>, V: Into<Bson>> FromIterator<(K, V)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl<K: Into<String>, V: Into<Bson>> Extend<(K, V)> for Document {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

/// Build a [`Document`] from `key => value` pairs.
///
/// ```
/// use lodestar_bson::doc;
///
/// let d = doc! { "x" => 1, "name" => "lodestar" };
/// assert_eq!(d.len(), 2);
/// ```
#[macro_export]
macro_rules! doc {
    () => {
        $crate::Document::new()
    };
    ( $( $key:expr => $value:expr ),+ $(,)? ) => {{
        let mut document = $crate::Document::new();
        $( document.insert($key, $crate::Bson::from($value)); )+
        document
    }};
}

/// Build a [`Bson::Array`] from values.
#[macro_export]
macro_rules! array {
    ( $( $value:expr ),* $(,)? ) => {
        $crate::Bson::Array(vec![ $( $crate::Bson::from($value) ),* ])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_insert_keeps_position() {
        let mut d = doc! { "a" => 1, "b" => 2 };
        assert_eq!(d.insert("a", 3), Some(Bson::Int32(1)));
        let keys: Vec<_> = d.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(d.get("a"), Some(&Bson::Int32(3)));
    }

    #[test]
    fn test_equality_is_order_sensitive() {
        let a = doc! { "x" => 1, "y" => 2 };
        let b = doc! { "y" => 2, "x" => 1 };
        assert_ne!(a, b);
        assert_eq!(a, doc! { "x" => 1, "y" => 2 });
    }

    #[test]
    fn test_dotted_path_lookup() {
        let d = doc! { "a" => doc! { "b" => crate::array![10, 20] } };
        assert_eq!(d.get_path("a.b.1"), Some(&Bson::Int32(20)));
        assert_eq!(d.get_path("a.c"), None);
    }

    #[test]
    fn test_typed_accessors() {
        let d = doc! { "n" => 5, "s" => "text" };
        assert_eq!(d.get_i32("n").unwrap(), 5);
        assert_eq!(d.get_str("s").unwrap(), "text");
        assert!(d.get_str("n").unwrap_err().is_mapping_error());
        assert!(d.get_bool("missing").is_err());
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut d = doc! { "a" => 1, "b" => 2, "c" => 3 };
        d.remove("b");
        let keys: Vec<_> = d.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "c"]);
    }
}
