use std::fmt;

use serde::{
    de::{self, Visitor},
    Deserialize,
    Serialize,
};

/// Monotonic version of a persisted record.
///
/// Every successful write bumps the version by one. A writer that read
/// version `n` may only replace the record while it is still at `n`; any other
/// value means somebody else wrote in between.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// Version of a record that has never been written.
    pub const fn initial() -> Self {
        Self(0)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ResourceVersion {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for ResourceVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

/// Missing or null versions deserialize to the initial version, so records
/// written before versioning was introduced still load.
struct ResourceVersionVisitor;

impl<'de> Visitor<'de> for ResourceVersionVisitor {
    type Value = ResourceVersion;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an unsigned integer representing the resource version or null")
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(value.into())
    }

    fn visit_none<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(ResourceVersion::initial())
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(ResourceVersion::initial())
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_u64(self)
    }
}

impl<'de> Deserialize<'de> for ResourceVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_option(ResourceVersionVisitor)
    }
}

/// A value together with the version it was read at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    #[serde(default)]
    pub version: ResourceVersion,
    pub value: T,
}

impl<T> Versioned<T> {
    pub fn new(version: ResourceVersion, value: T) -> Self {
        Self { version, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_increments() {
        let v = ResourceVersion::initial();
        assert_eq!(v.value(), 0);
        assert_eq!(v.next().next().value(), 2);
        assert!(v < v.next());
    }

    #[test]
    fn test_missing_version_deserializes_to_initial() {
        let parsed: Versioned<Vec<u32>> = serde_json::from_str(r#"{"value":[1]}"#).unwrap();
        assert_eq!(parsed.version, ResourceVersion::initial());

        let parsed: Versioned<Vec<u32>> =
            serde_json::from_str(r#"{"version":null,"value":[]}"#).unwrap();
        assert_eq!(parsed.version, ResourceVersion::initial());

        let parsed: Versioned<Vec<u32>> =
            serde_json::from_str(r#"{"version":7,"value":[]}"#).unwrap();
        assert_eq!(parsed.version.value(), 7);
    }
}
