//! Directory entry and membership index types.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::dn::{normalize_dn, DistinguishedName};

/// One value of a (possibly multi-valued) directory attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchAttribute {
    /// Attribute name as returned by the server.
    pub name: String,
    /// Attribute value.
    pub value: String,
}

impl SearchAttribute {
    /// Creates an attribute value pair.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A directory entry: its DN plus an ordered sequence of attribute values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Distinguished name of the entry.
    pub dn: String,
    /// Attribute values, one element per value.
    ///
    /// [`DirectoryEntry::with`] keeps insertion order; [`DirectoryEntry::from_multi_valued`]
    /// groups values by attribute name in sorted order.
    pub attributes: Vec<SearchAttribute>,
}

impl DirectoryEntry {
    /// Creates an entry with no attributes.
    #[must_use]
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    /// Appends a value.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(SearchAttribute::new(name, value));
        self
    }

    /// Flattens a multi-valued attribute map (as produced by LDAP client libraries).
    ///
    /// Attribute names are sorted so the resulting order is stable.
    #[must_use]
    pub fn from_multi_valued(dn: impl Into<String>, attrs: HashMap<String, Vec<String>>) -> Self {
        let sorted: BTreeMap<_, _> = attrs.into_iter().collect();
        let attributes = sorted
            .into_iter()
            .flat_map(|(name, values)| {
                values
                    .into_iter()
                    .map(move |value| SearchAttribute::new(name.clone(), value))
            })
            .collect();
        Self {
            dn: dn.into(),
            attributes,
        }
    }

    /// All values of `name` (case-insensitive).
    pub fn values<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + 'n
    where
        'a: 'n,
    {
        self.attributes
            .iter()
            .filter(move |attr| attr.name.eq_ignore_ascii_case(name))
            .map(|attr| attr.value.as_str())
    }

    /// First value of `name` (case-insensitive).
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.name.eq_ignore_ascii_case(name))
            .map(|attr| attr.value.as_str())
    }

    /// Returns true if the entry carries at least one value for `name`.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.first(name).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Member {
    dn: String,
    id: String,
}

/// Resolved group membership: member DN to member identifier.
///
/// Entries are keyed by normalised DN; the first identifier recorded for a DN is kept.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MembershipIndex {
    members: BTreeMap<String, Member>,
}

impl MembershipIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `dn → id` unless the DN is already present. Returns true if inserted.
    pub fn insert(&mut self, dn: impl Into<String>, id: impl Into<String>) -> bool {
        let dn = dn.into();
        let key = normalize_dn(&dn);
        if self.members.contains_key(&key) {
            return false;
        }
        self.members.insert(
            key,
            Member {
                dn,
                id: id.into(),
            },
        );
        true
    }

    /// Identifier recorded for `dn`.
    #[must_use]
    pub fn get(&self, dn: &str) -> Option<&str> {
        self.members
            .get(&normalize_dn(dn))
            .map(|member| member.id.as_str())
    }

    /// Returns true if `dn` is a member.
    #[must_use]
    pub fn contains_dn(&self, dn: &str) -> bool {
        self.members.contains_key(&normalize_dn(dn))
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if there are no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterates `(dn, id)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.members
            .values()
            .map(|member| (member.dn.as_str(), member.id.as_str()))
    }

    /// Copies the index into a plain `dn → id` map.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.iter()
            .map(|(dn, id)| (dn.to_string(), id.to_string()))
            .collect()
    }

    /// Locates a member by account identifier or DN.
    ///
    /// Matches, in order of precedence per member: identifier equal to `account`
    /// (case-insensitive), DN equal to `account`, or DN whose leading RDN is
    /// `uid_attribute=account`. Returns the member's DN.
    #[must_use]
    pub fn find_member(&self, account: &str, uid_attribute: &str) -> Option<&str> {
        let account = account.trim();
        if account.is_empty() {
            return None;
        }
        let account_key = normalize_dn(account);
        let account_lower = account.to_lowercase();

        self.members.iter().find_map(|(key, member)| {
            let matched = member.id.to_lowercase() == account_lower
                || *key == account_key
                || DistinguishedName::parse(&member.dn)
                    .is_ok_and(|dn| dn.leads_with(uid_attribute, account));
            matched.then_some(member.dn.as_str())
        })
    }
}
