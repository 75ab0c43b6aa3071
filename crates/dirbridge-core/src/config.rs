//! Layered key/value configuration sources.
//!
//! Directory settings are looked up by key (for example `ldap_server`) across a stack of
//! sources: a site-specific override layer first, then global defaults. The first layer that
//! yields a non-blank value wins.

use crate::Error;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Read-only source of string settings.
pub trait ConfigSource: Send + Sync {
    /// Returns the raw value for `key`, if the source defines one.
    fn get(&self, key: &str) -> Option<String>;
}

impl<T: ConfigSource + ?Sized> ConfigSource for Arc<T> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }
}

/// In-memory configuration layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapSource {
    values: HashMap<String, String>,
}

impl MapSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a source from key/value pairs.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    /// Parses a flat JSON object into a source.
    ///
    /// Strings are taken verbatim, numbers and booleans are rendered to text, `null` is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the document is not a JSON object or holds nested
    /// values.
    pub fn from_json(document: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(document)
            .map_err(|e| Error::Configuration(format!("invalid configuration document: {e}")))?;
        let Value::Object(object) = value else {
            return Err(Error::Configuration(
                "configuration document must be a JSON object".to_string(),
            ));
        };

        let mut values = HashMap::with_capacity(object.len());
        for (key, value) in object {
            let text = match value {
                Value::Null => continue,
                Value::String(s) => s,
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Array(_) | Value::Object(_) => {
                    return Err(Error::Configuration(format!(
                        "configuration key `{key}` must hold a scalar value"
                    )))
                }
            };
            values.insert(key, text);
        }

        Ok(Self { values })
    }

    /// Sets a value, replacing any previous one.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Sets a value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl ConfigSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Adapts a source whose keys use a dotted prefix instead of the `ldap_` key prefix.
///
/// With prefix `auth.ldap.`, a lookup of `ldap_server` reads `auth.ldap.server`. Keys that do not
/// start with `ldap_` are read as `prefix + key`.
pub struct PrefixedSource<S> {
    inner: S,
    prefix: String,
}

impl<S: ConfigSource> PrefixedSource<S> {
    /// Wraps `inner`, translating keys with `prefix`.
    #[must_use]
    pub fn new(inner: S, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn translate(&self, key: &str) -> String {
        let suffix = key.strip_prefix("ldap_").unwrap_or(key);
        format!("{}{}", self.prefix, suffix)
    }
}

impl<S: ConfigSource> ConfigSource for PrefixedSource<S> {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.get(&self.translate(key))
    }
}

impl<S> fmt::Debug for PrefixedSource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefixedSource")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Ordered stack of sources; earlier layers override later ones.
#[derive(Clone, Default)]
pub struct LayeredSource {
    layers: Vec<Arc<dyn ConfigSource>>,
}

impl LayeredSource {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer with lower precedence than every layer added before it.
    #[must_use]
    pub fn with_layer(mut self, layer: impl ConfigSource + 'static) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    /// Number of layers in the stack.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns true if no layer has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl ConfigSource for LayeredSource {
    fn get(&self, key: &str) -> Option<String> {
        // Blank values in an override layer fall through to the defaults.
        self.layers
            .iter()
            .filter_map(|layer| layer.get(key))
            .find(|value| !value.trim().is_empty())
    }
}

impl fmt::Debug for LayeredSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayeredSource")
            .field("layers", &self.layers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_source_lookup() {
        let source = MapSource::from_pairs([("ldap_server", "ldap.example.com")])
            .with("ldap_port", "389");
        assert_eq!(source.get("ldap_server").as_deref(), Some("ldap.example.com"));
        assert_eq!(source.get("ldap_port").as_deref(), Some("389"));
        assert!(source.get("ldap_base_DN").is_none());
    }

    #[test]
    fn test_map_source_from_json() {
        let source = MapSource::from_json(
            r#"{"ldap_server": "ldap.example.com", "ldap_port": 636, "ldap_ssl": true, "ldap_bind_DN": null}"#,
        )
        .unwrap();
        assert_eq!(source.get("ldap_port").as_deref(), Some("636"));
        assert_eq!(source.get("ldap_ssl").as_deref(), Some("true"));
        assert!(source.get("ldap_bind_DN").is_none());
    }

    #[test]
    fn test_map_source_from_json_rejects_nested() {
        let err = MapSource::from_json(r#"{"ldap_group_classes": ["group"]}"#).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = MapSource::from_json("[1, 2]").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_prefixed_source_translation() {
        let global = MapSource::new()
            .with("auth.ldap.server", "global.example.com")
            .with("auth.ldap.UID_attr", "uid");
        let source = PrefixedSource::new(global, "auth.ldap.");
        assert_eq!(source.get("ldap_server").as_deref(), Some("global.example.com"));
        assert_eq!(source.get("ldap_UID_attr").as_deref(), Some("uid"));
        assert!(source.get("ldap_port").is_none());
    }

    #[test]
    fn test_layered_source_precedence() {
        let site = MapSource::new()
            .with("ldap_server", "site.example.com")
            .with("ldap_base_DN", "   ");
        let global = MapSource::new()
            .with("ldap_server", "global.example.com")
            .with("ldap_base_DN", "dc=example,dc=com")
            .with("ldap_port", "636");

        let layered = LayeredSource::new().with_layer(site).with_layer(global);
        assert_eq!(layered.len(), 2);
        assert_eq!(layered.get("ldap_server").as_deref(), Some("site.example.com"));
        assert_eq!(layered.get("ldap_base_DN").as_deref(), Some("dc=example,dc=com"));
        assert_eq!(layered.get("ldap_port").as_deref(), Some("636"));
        assert!(layered.get("ldap_UID_attr").is_none());
    }

    #[test]
    fn test_empty_layered_source() {
        let layered = LayeredSource::new();
        assert!(layered.is_empty());
        assert!(layered.get("ldap_server").is_none());
    }
}
