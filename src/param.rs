use std::collections::HashMap;

use crate::error::Error;

/// The reference namespace used by every parameter key defined in this
/// crate (listen-port, hostname, recv-bufsize, ...).
pub const NAMESPACE_REFERENCE: u16 = 0;

/// A qualified parameter name: a 16-bit namespace tag paired with a local
/// string name, so configuration stays open-ended without a closed schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamKey {
    pub namespace: u16,
    pub name: String,
}

impl ParamKey {
    pub fn new(namespace: u16, name: impl Into<String>) -> Self {
        ParamKey {
            namespace,
            name: name.into(),
        }
    }

    /// A key in the reference namespace (namespace 0).
    pub fn reference(name: impl Into<String>) -> Self {
        ParamKey::new(NAMESPACE_REFERENCE, name)
    }
}

/// A typed parameter value. The set of representable types matches what
/// Event Source configuration actually needs: booleans, 16-bit integers,
/// single strings, and string arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Bool(bool),
    U16(u16),
    String(String),
    StringArray(Vec<String>),
}

/// An unordered mapping from qualified name to typed value, used to
/// configure Event Sources and operations without a closed schema.
#[derive(Debug, Default, Clone)]
pub struct ParamMap {
    values: HashMap<ParamKey, ParamValue>,
}

impl ParamMap {
    pub fn new() -> Self {
        ParamMap {
            values: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: ParamKey, value: ParamValue) {
        self.values.insert(key, value);
    }

    pub fn get(&self, key: &ParamKey) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &ParamKey) -> bool {
        self.values.contains_key(key)
    }

    /// Fetches a required `u16` parameter.
    pub fn require_u16(&self, key: &ParamKey) -> Result<u16, Error> {
        match self.values.get(key) {
            Some(ParamValue::U16(v)) => Ok(*v),
            Some(_) => Err(Error::InvalidArgument(format!(
                "parameter {} has the wrong type, expected u16",
                key.name
            ))),
            None => Err(Error::InvalidArgument(format!(
                "missing required parameter {}",
                key.name
            ))),
        }
    }

    /// Fetches an optional `u16` parameter.
    pub fn get_u16(&self, key: &ParamKey) -> Result<Option<u16>, Error> {
        match self.values.get(key) {
            Some(ParamValue::U16(v)) => Ok(Some(*v)),
            Some(_) => Err(Error::InvalidArgument(format!(
                "parameter {} has the wrong type, expected u16",
                key.name
            ))),
            None => Ok(None),
        }
    }

    /// Fetches a required string parameter.
    pub fn require_string(&self, key: &ParamKey) -> Result<&str, Error> {
        match self.values.get(key) {
            Some(ParamValue::String(v)) => Ok(v.as_str()),
            Some(_) => Err(Error::InvalidArgument(format!(
                "parameter {} has the wrong type, expected string",
                key.name
            ))),
            None => Err(Error::InvalidArgument(format!(
                "missing required parameter {}",
                key.name
            ))),
        }
    }

    /// Fetches a parameter that may be given as a single string or an array
    /// of strings (e.g. `listen-hostnames`), normalizing to a `Vec<String>`.
    pub fn get_string_array(&self, key: &ParamKey) -> Result<Option<Vec<String>>, Error> {
        match self.values.get(key) {
            Some(ParamValue::String(v)) => Ok(Some(vec![v.clone()])),
            Some(ParamValue::StringArray(v)) => Ok(Some(v.clone())),
            Some(_) => Err(Error::InvalidArgument(format!(
                "parameter {} has the wrong type, expected string or string array",
                key.name
            ))),
            None => Ok(None),
        }
    }
}
