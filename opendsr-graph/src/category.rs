use std::fmt;

use serde::{Deserialize, Serialize};

/// A dotted hierarchical tag on a field, e.g.
/// `user.provided.identifiable.contact.email`. Categories are matched
/// by *segment* prefix: requesting `user.provided.identifiable.contact`
/// selects every category underneath it, but `user.provided.id` does
/// not select `user.provided.identifiable`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataCategory(String);

impl DataCategory {
    pub fn new(category: impl Into<String>) -> Self {
        DataCategory(category.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Dotted-segment prefix relation: `self` is a prefix of `other`
    /// if every segment of `self` equals the corresponding segment of
    /// `other`. A category is a prefix of itself.
    pub fn is_prefix_of(&self, other: &DataCategory) -> bool {
        let mut ours = self.segments();
        let mut theirs = other.segments();
        loop {
            match (ours.next(), theirs.next()) {
                (None, _) => return true,
                (Some(_), None) => return false,
                (Some(a), Some(b)) if a == b => continue,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataCategory {
    fn from(s: &str) -> Self {
        DataCategory(s.to_owned())
    }
}

impl From<String> for DataCategory {
    fn from(s: String) -> Self {
        DataCategory(s)
    }
}
