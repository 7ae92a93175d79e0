//! Fetch keys.

use std::borrow::Borrow;
use std::fmt;
use std::rc::Rc;

/// Identifies one logical data source.
///
/// Keys compare by exact string equality. Cloning is cheap, the string is
/// shared between the pool, the subscriber and every delivery handle.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Rc<str>);

impl Key {
    /// Creates a key from anything string-like.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Rc::from(key.as_ref()))
    }

    /// Returns the key as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", &*self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for Key {
    fn from(key: String) -> Self {
        Self(Rc::from(key))
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_key_equality_is_exact() {
        assert_eq!(Key::from("a/b"), Key::from(String::from("a/b")));
        assert_ne!(Key::from("a/b"), Key::from("a/B"));
        assert_ne!(Key::from("a/b"), Key::from("a/b "));
    }

    #[test]
    fn test_key_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(Key::from("users"), 1);
        assert_eq!(map.get("users"), Some(&1));
        assert_eq!(map.get("Users"), None);
    }

    #[test]
    fn test_key_display() {
        let key = Key::new("feed?limit=10");
        assert_eq!(key.to_string(), "feed?limit=10");
        assert_eq!(format!("{:?}", key), "Key(\"feed?limit=10\")");
    }
}
