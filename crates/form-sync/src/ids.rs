//! Opaque identifiers for document nodes and participants.
//!
//! Every id is a non-empty string. Fresh ids are minted from UUID v4 with a
//! short kind prefix (`fld-`, `row-`, `sec-`, `usr-`) so they stay readable in
//! logs. Ids compare lexicographically; for [`UserId`] that ordering is the
//! conflict tie-break, so it must be identical on every replica.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("Identifier cannot be empty")]
    Empty,
    #[error("Identifier contains whitespace: {0:?}")]
    Whitespace(String),
}

fn validate(raw: &str) -> Result<(), IdError> {
    if raw.is_empty() {
        return Err(IdError::Empty);
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(IdError::Whitespace(raw.to_string()));
    }
    Ok(())
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh, globally unique id.
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{}"), Uuid::new_v4().simple()))
            }

            /// Wrap an existing id, rejecting empty or whitespace-bearing input.
            pub fn new(raw: impl Into<String>) -> Result<Self, IdError> {
                let raw = raw.into();
                validate(&raw)?;
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(raw: String) -> Result<Self, Self::Error> {
                Self::new(raw)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_id!(
    /// Identity of a field. Never reused for a different field, even after
    /// the field is deleted.
    FieldId,
    "fld"
);

opaque_id!(
    /// Identity of a row of side-by-side fields.
    RowId,
    "row"
);

opaque_id!(
    /// Identity of a section.
    SectionId,
    "sec"
);

opaque_id!(
    /// Identity of a participant. Lexicographic order breaks timestamp ties:
    /// the smaller id wins.
    UserId,
    "usr"
);

pub(crate) const DERIVED_ROW_PREFIX: &str = "r-";

impl RowId {
    /// Row id for a row created implicitly by the operation stamped
    /// `(timestamp, user, seq)`.
    ///
    /// Derived rather than random so that every replica applying the same
    /// operation creates a row with the same id. The zero-padded timestamp
    /// prefix makes derived ids sort by creation time, which is the row order
    /// inside a section.
    pub fn derived(timestamp: u64, user: &UserId, seq: u64) -> Self {
        Self(format!("{}{:020}-{}-{}", DERIVED_ROW_PREFIX, timestamp, user, seq))
    }

    /// Whether this id was produced by [`RowId::derived`].
    pub fn is_derived(&self) -> bool {
        self.0.starts_with(DERIVED_ROW_PREFIX)
    }

    /// Split an id into the row whose overflow chain it belongs to and its
    /// depth in that chain: `R1++` is `("R1", 2)`, `R1` is `("R1", 0)`.
    pub(crate) fn chain_position(&self) -> (&str, usize) {
        let base = self.0.trim_end_matches('+');
        if base.is_empty() {
            return (&self.0, 0);
        }
        (base, self.0.len() - base.len())
    }

    /// The row `depth` places down the overflow chain of `base`.
    pub(crate) fn in_chain(base: &str, depth: usize) -> Self {
        Self(format!("{}{}", base, "+".repeat(depth)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_has_prefix_and_is_unique() {
        let a = FieldId::generate();
        let b = FieldId::generate();
        assert!(a.as_str().starts_with("fld-"));
        assert_ne!(a, b);
        assert!(SectionId::generate().as_str().starts_with("sec-"));
    }

    #[test]
    fn test_reject_empty() {
        assert_eq!(FieldId::new(""), Err(IdError::Empty));
        assert!("".parse::<UserId>().is_err());
    }

    #[test]
    fn test_reject_whitespace() {
        assert!(matches!(RowId::new("row 1"), Err(IdError::Whitespace(_))));
    }

    #[test]
    fn test_user_ids_order_lexicographically() {
        let alice: UserId = "alice".parse().unwrap();
        let bob: UserId = "bob".parse().unwrap();
        assert!(alice < bob);
    }

    #[test]
    fn test_derived_row_id_is_stable() {
        let user: UserId = "alice".parse().unwrap();
        assert_eq!(RowId::derived(42, &user, 7), RowId::derived(42, &user, 7));
        assert_eq!(
            RowId::derived(42, &user, 7).as_str(),
            "r-00000000000000000042-alice-7"
        );
        assert!(RowId::derived(42, &user, 7).is_derived());
        assert!(!"R1".parse::<RowId>().unwrap().is_derived());
    }

    #[test]
    fn test_derived_row_ids_sort_by_timestamp() {
        let zed: UserId = "zed".parse().unwrap();
        let amy: UserId = "amy".parse().unwrap();
        assert!(RowId::derived(9, &zed, 1) < RowId::derived(10, &amy, 1));
    }

    #[test]
    fn test_overflow_chain_position() {
        let row: RowId = "R1++".parse().unwrap();
        assert_eq!(row.chain_position(), ("R1", 2));
        assert_eq!(RowId::in_chain("R1", 2), row);
        assert_eq!(RowId::in_chain("R1", 0).chain_position(), ("R1", 0));

        let odd: RowId = "++".parse().unwrap();
        assert_eq!(odd.chain_position(), ("++", 0));
    }

    #[test]
    fn test_serde_is_plain_string() {
        let id: FieldId = "F1".parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"F1\"");
        let parsed: FieldId = serde_json::from_str("\"F1\"").unwrap();
        assert_eq!(parsed, id);
        assert!(serde_json::from_str::<FieldId>("\"\"").is_err());
    }
}
