//! Transitive group membership resolution.

use std::collections::HashSet;
use tracing::{debug, warn};

use crate::config::DirectoryConfig;
use crate::connection::{DirectoryConnection, SearchRequest, SearchScope};
use crate::dn::{normalize_dn, DistinguishedName};
use crate::entry::{DirectoryEntry, MembershipIndex};
use crate::filter::{looks_like_filter, user_search_filter};

const OBJECT_CLASS: &str = "objectClass";

/// Outcome of resolving one group reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupResolution {
    /// Whether the reference classified as a group.
    pub is_group: bool,
    /// Leaf members found (for a non-group, the entry itself).
    pub members: MembershipIndex,
}

/// Walks a group's membership graph.
///
/// A reference may be a DN, a search filter (every matching entry is classified), or a bare
/// identifier looked up with the user search format. Nested groups are expanded through an
/// explicit worklist; each normalised DN is expanded at most once, so cyclic graphs terminate.
#[derive(Debug, Clone, Copy)]
pub struct GroupResolver<'a> {
    config: &'a DirectoryConfig,
}

impl<'a> GroupResolver<'a> {
    /// Creates a resolver over `config`.
    #[must_use]
    pub const fn new(config: &'a DirectoryConfig) -> Self {
        Self { config }
    }

    /// Resolves `group` with a fresh visited set.
    pub async fn resolve(&self, conn: &mut DirectoryConnection, group: &str) -> GroupResolution {
        let mut visited = HashSet::new();
        let mut members = MembershipIndex::new();
        let is_group = self
            .resolve_into(conn, group, &mut visited, &mut members)
            .await;
        GroupResolution { is_group, members }
    }

    /// Resolves `group`, accumulating leaf members into `members`.
    ///
    /// `visited` holds normalised DNs already expanded; nested references found there are not
    /// searched again. Returns true iff `group` itself classified as a group. An absent entry or
    /// a failed search reports false and leaves `members` untouched.
    pub async fn resolve_into(
        &self,
        conn: &mut DirectoryConnection,
        group: &str,
        visited: &mut HashSet<String>,
        members: &mut MembershipIndex,
    ) -> bool {
        visited.insert(normalize_dn(group));
        let mut pending = Vec::new();

        let is_group = self
            .expand(conn, group, visited, members, &mut pending)
            .await;
        while let Some(reference) = pending.pop() {
            self.expand(conn, &reference, visited, members, &mut pending)
                .await;
        }

        debug!(group, is_group, members = members.len(), "group resolved");
        is_group
    }

    async fn expand(
        &self,
        conn: &mut DirectoryConnection,
        reference: &str,
        visited: &mut HashSet<String>,
        members: &mut MembershipIndex,
        pending: &mut Vec<String>,
    ) -> bool {
        let reference_key = normalize_dn(reference);
        let mut is_group = false;

        for entry in self.lookup(conn, reference).await {
            let key = normalize_dn(&entry.dn);
            if key != reference_key && !visited.insert(key) {
                continue;
            }
            is_group |= self.classify(&entry, visited, members, pending);
        }
        is_group
    }

    fn classify(
        &self,
        entry: &DirectoryEntry,
        visited: &mut HashSet<String>,
        members: &mut MembershipIndex,
        pending: &mut Vec<String>,
    ) -> bool {
        let is_group = entry
            .values(OBJECT_CLASS)
            .any(|class| self.config.is_group_class(class));

        if !is_group {
            let id = entry.first(self.config.uid_attribute());
            if id.is_none() {
                warn!(
                    dn = %entry.dn,
                    attribute = self.config.uid_attribute(),
                    "member entry has no UID attribute, recording an empty identifier"
                );
            }
            members.insert(entry.dn.clone(), id.unwrap_or_default());
            return false;
        }

        for attribute in &entry.attributes {
            if !self.config.is_member_field(&attribute.name) {
                continue;
            }
            let member = attribute.value.trim();
            if member.is_empty() {
                continue;
            }
            if visited.insert(normalize_dn(member)) {
                pending.push(member.to_string());
            } else {
                debug!(group = %entry.dn, member, "member already visited");
            }
        }
        true
    }

    async fn lookup(&self, conn: &mut DirectoryConnection, reference: &str) -> Vec<DirectoryEntry> {
        let attributes = self.requested_attributes();
        let time_limit = self.config.search_time_limit();

        let (request, first_only) = if DistinguishedName::is_valid(reference) {
            (
                SearchRequest::new(reference, SearchScope::Base, "(objectClass=*)"),
                false,
            )
        } else if looks_like_filter(reference) {
            (
                SearchRequest::new(self.config.base_dn(), SearchScope::Subtree, reference),
                false,
            )
        } else {
            let filter = user_search_filter(
                self.config.user_search_format(),
                self.config.uid_attribute(),
                reference,
            );
            (
                SearchRequest::new(self.config.base_dn(), SearchScope::Subtree, filter),
                true,
            )
        };
        let request = request
            .with_attributes(attributes)
            .with_time_limit(time_limit);

        let outcome = match conn.search(request).await {
            Ok(results) if first_only => {
                let mut results = results;
                let first = results.next().await;
                results.finish().await;
                first.map(|entry| entry.into_iter().collect())
            }
            Ok(results) => results.collect().await,
            Err(err) => Err(err),
        };

        outcome.unwrap_or_else(|err| {
            if err.is_directory_unavailable() {
                warn!(reference, error = %err, "membership search failed");
            } else {
                debug!(reference, error = %err, "membership search failed");
            }
            Vec::new()
        })
    }

    fn requested_attributes(&self) -> Vec<String> {
        let mut attributes = vec![
            OBJECT_CLASS.to_string(),
            self.config.uid_attribute().to_string(),
        ];
        attributes.extend(self.config.group_member_fields().iter().cloned());
        attributes
    }
}
