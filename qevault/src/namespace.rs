//! Database/collection namespaces.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A `(database, collection)` pair.
///
/// Namespaces are always carried as an explicit pair. The dotted form is
/// only a rendering: database names never contain `.`, so parsing splits on
/// the first dot and the remainder (which may contain dots) is the collection.
///
/// # Example
///
/// ```
/// use qevault::namespace::Namespace;
///
/// let ns: Namespace = "encryption.__keyVault".parse().unwrap();
/// assert_eq!(ns.database(), "encryption");
/// assert_eq!(ns.collection(), "__keyVault");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawNamespace")]
pub struct Namespace {
    database: String,
    collection: String,
}

#[derive(Deserialize)]
struct RawNamespace {
    database: String,
    collection: String,
}

impl TryFrom<RawNamespace> for Namespace {
    type Error = Error;

    fn try_from(raw: RawNamespace) -> Result<Self, Self::Error> {
        Self::new(raw.database, raw.collection)
    }
}

impl Namespace {
    /// Creates a validated namespace.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidNamespace` if either part is empty, the
    /// database name contains a `.`, or either part contains a NUL byte.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Result<Self, Error> {
        let database = database.into();
        let collection = collection.into();

        if database.is_empty() {
            return Err(Error::InvalidNamespace("database name is empty".to_string()));
        }
        if collection.is_empty() {
            return Err(Error::InvalidNamespace("collection name is empty".to_string()));
        }
        if database.contains('.') {
            return Err(Error::InvalidNamespace(format!(
                "database name `{database}` must not contain '.'"
            )));
        }
        if database.contains('\0') || collection.contains('\0') {
            return Err(Error::InvalidNamespace("names must not contain NUL".to_string()));
        }

        Ok(Self { database, collection })
    }

    /// Returns the database name.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (database, collection) = s
            .split_once('.')
            .ok_or_else(|| Error::InvalidNamespace(format!("`{s}` is not of the form db.coll")))?;
        Self::new(database, collection)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_on_first_dot() {
        let ns: Namespace = "users.memories.archive".parse().unwrap();
        assert_eq!(ns.database(), "users");
        assert_eq!(ns.collection(), "memories.archive");
        assert_eq!(ns.to_string(), "users.memories.archive");
    }

    #[test]
    fn test_parse_requires_dot() {
        let result = "encryption".parse::<Namespace>();
        assert!(matches!(result, Err(Error::InvalidNamespace(_))));
    }

    #[test]
    fn test_rejects_empty_parts() {
        assert!(Namespace::new("", "coll").is_err());
        assert!(Namespace::new("db", "").is_err());
        assert!(".coll".parse::<Namespace>().is_err());
        assert!("db.".parse::<Namespace>().is_err());
    }

    #[test]
    fn test_rejects_dotted_database() {
        let result = Namespace::new("a.b", "coll");
        assert!(matches!(result, Err(Error::InvalidNamespace(_))));
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Namespace =
            serde_json::from_str(r#"{"database":"encryption","collection":"__keyVault"}"#).unwrap();
        assert_eq!(ok.to_string(), "encryption.__keyVault");

        let bad = serde_json::from_str::<Namespace>(r#"{"database":"a.b","collection":"c"}"#);
        assert!(bad.is_err());
    }
}
