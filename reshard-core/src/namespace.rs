//! Collection namespaces and shard-key patterns.

use std::fmt;
use std::str::FromStr;

use crate::{CollectionId, Error, Result};

/// Collection-name prefix of the temporary collection a resharding operation
/// builds on recipients.
pub const TEMPORARY_RESHARDING_PREFIX: &str = "system.resharding.";

/// A fully-qualified collection name: `db.coll`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    /// Creates a namespace.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if either part is empty or the database
    /// name contains a dot.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Result<Self> {
        let db = db.into();
        let coll = coll.into();
        if db.is_empty() || db.contains('.') {
            return Err(Error::InvalidArgument {
                name: "db",
                reason: "must be non-empty and contain no '.'",
            });
        }
        if coll.is_empty() {
            return Err(Error::InvalidArgument {
                name: "coll",
                reason: "must be non-empty",
            });
        }
        Ok(Self { db, coll })
    }

    /// Returns the temporary namespace used while resharding the collection
    /// `source` in database `db`: `db.system.resharding.<source>`.
    #[must_use]
    pub fn temporary_resharding(db: &str, source: CollectionId) -> Self {
        Self {
            db: db.to_string(),
            coll: format!("{TEMPORARY_RESHARDING_PREFIX}{}", source.get()),
        }
    }

    /// Database name.
    #[must_use]
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Collection name.
    #[must_use]
    pub fn coll(&self) -> &str {
        &self.coll
    }

    /// Returns true if this is a temporary resharding collection.
    #[must_use]
    pub fn is_temporary_resharding(&self) -> bool {
        self.coll.starts_with(TEMPORARY_RESHARDING_PREFIX)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((db, coll)) = s.split_once('.') else {
            return Err(Error::Parse {
                what: "namespace",
                input: s.to_string(),
            });
        };
        Self::new(db, coll).map_err(|_| Error::Parse {
            what: "namespace",
            input: s.to_string(),
        })
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns({}.{})", self.db, self.coll)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Ordered list of fields a collection is sharded on.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ShardKeyPattern {
    fields: Vec<String>,
}

impl ShardKeyPattern {
    /// Creates a shard-key pattern.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if there are no fields, a field is empty,
    /// or a field is repeated.
    pub fn new<I, S>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(Error::InvalidArgument {
                name: "shard_key",
                reason: "must name at least one field",
            });
        }
        for (i, field) in fields.iter().enumerate() {
            if field.is_empty() {
                return Err(Error::InvalidArgument {
                    name: "shard_key",
                    reason: "field names must be non-empty",
                });
            }
            if fields[..i].contains(field) {
                return Err(Error::InvalidArgument {
                    name: "shard_key",
                    reason: "field names must be unique",
                });
            }
        }
        Ok(Self { fields })
    }

    /// The key fields, in order.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

impl fmt::Debug for ShardKeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ShardKeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{ ")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{field}: 1")?;
        }
        f.write_str(" }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_parse_and_display() {
        let ns: Namespace = "db.foo".parse().unwrap();
        assert_eq!(ns.db(), "db");
        assert_eq!(ns.coll(), "foo");
        assert_eq!(ns.to_string(), "db.foo");

        // Collection names may themselves contain dots.
        let ns: Namespace = "db.system.views".parse().unwrap();
        assert_eq!(ns.coll(), "system.views");
    }

    #[test]
    fn test_namespace_parse_rejects_missing_dot() {
        let err = "nodot".parse::<Namespace>().unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert!(".foo".parse::<Namespace>().is_err());
        assert!("db.".parse::<Namespace>().is_err());
    }

    #[test]
    fn test_temporary_resharding_namespace() {
        let tmp = Namespace::temporary_resharding("db", CollectionId::new(77));
        assert_eq!(tmp.to_string(), "db.system.resharding.77");
        assert!(tmp.is_temporary_resharding());
        assert!(!Namespace::new("db", "foo").unwrap().is_temporary_resharding());
    }

    #[test]
    fn test_shard_key_pattern() {
        let key = ShardKeyPattern::new(["newKey", "other"]).unwrap();
        assert_eq!(key.to_string(), "{ newKey: 1, other: 1 }");
        assert_eq!(key.fields().len(), 2);

        assert!(ShardKeyPattern::new(Vec::<String>::new()).is_err());
        assert!(ShardKeyPattern::new(["a", "a"]).is_err());
        assert!(ShardKeyPattern::new([""]).is_err());
    }
}
