//! Local account provisioning from directory attributes.

use dirbridge_core::{Error, ProvisionFailure, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::{DirectoryConfig, ACCOUNT_NAME_FIELD};
use crate::connection::{DirectoryConnection, SearchRequest, SearchScope};
use crate::entry::{DirectoryEntry, SearchAttribute};
use crate::filter::user_search_filter;

/// A local account built from directory attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Local account identifier.
    pub account_id: String,
    /// Local field name to value.
    pub fields: BTreeMap<String, String>,
}

/// Reduces `raw` to characters legal in an account identifier.
#[must_use]
pub fn sanitize_account_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// Looks up a user by uid under the base DN and returns the first match.
///
/// # Errors
///
/// Returns the search error; an absent user is `Ok(None)`.
pub async fn find_user(
    conn: &mut DirectoryConnection,
    config: &DirectoryConfig,
    uid: &str,
    attributes: Vec<String>,
) -> Result<Option<DirectoryEntry>> {
    let filter = user_search_filter(config.user_search_format(), config.uid_attribute(), uid);
    let request = SearchRequest::new(config.base_dn(), SearchScope::Subtree, filter)
        .with_attributes(attributes)
        .with_time_limit(config.search_time_limit());

    let mut results = conn.search(request).await?;
    let first = results.next().await;
    results.finish().await;
    first
}

/// Maps directory attributes onto local account fields.
#[derive(Debug, Clone, Copy)]
pub struct UserProvisioner<'a> {
    config: &'a DirectoryConfig,
}

impl<'a> UserProvisioner<'a> {
    /// Creates a provisioner using the configured attribute mapping.
    #[must_use]
    pub const fn new(config: &'a DirectoryConfig) -> Self {
        Self { config }
    }

    /// Builds a [`UserRecord`] from pre-fetched `attributes`.
    ///
    /// The attribute mapped to `name` derives the account identifier when `explicit_id` is
    /// absent and is never stored as a field. Multi-valued attributes contribute their first
    /// value.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionFailure::NoMapping`] when no mapping is configured, or
    /// [`ProvisionFailure::NoAccountId`] when no identifier is available.
    pub fn provision(
        &self,
        uid: &str,
        attributes: &[SearchAttribute],
        explicit_id: Option<&str>,
    ) -> std::result::Result<UserRecord, ProvisionFailure> {
        let mapping = self.config.attribute_mapping();
        if mapping.is_empty() {
            return Err(ProvisionFailure::NoMapping);
        }

        let explicit_id = explicit_id.map(str::trim).filter(|id| !id.is_empty());
        let mut derived_id: Option<String> = None;
        let mut name_seen = false;
        let mut fields = BTreeMap::new();

        for pair in mapping.iter() {
            let Some(value) = attributes
                .iter()
                .find(|attr| attr.name.eq_ignore_ascii_case(&pair.directory))
                .map(|attr| attr.value.as_str())
            else {
                continue;
            };

            if pair.local == ACCOUNT_NAME_FIELD {
                if !name_seen && explicit_id.is_none() {
                    derived_id = Some(sanitize_account_id(value)).filter(|id| !id.is_empty());
                }
                name_seen = true;
                continue;
            }
            fields.entry(pair.local.clone()).or_insert_with(|| value.to_string());
        }

        let account_id = explicit_id
            .map(str::to_string)
            .or(derived_id)
            .ok_or_else(|| ProvisionFailure::NoAccountId {
                uid: uid.to_string(),
            })?;

        debug!(uid, account_id = %account_id, fields = fields.len(), "provisioned user record");
        Ok(UserRecord { account_id, fields })
    }

    /// Fetches `uid` from the directory and provisions it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown uid, the search error, or the provisioning
    /// failure.
    pub async fn fetch_and_provision(
        &self,
        conn: &mut DirectoryConnection,
        uid: &str,
        explicit_id: Option<&str>,
    ) -> Result<UserRecord> {
        let mapping = self.config.attribute_mapping();
        if mapping.is_empty() {
            return Err(ProvisionFailure::NoMapping.into());
        }

        let entry = find_user(conn, self.config, uid, mapping.directory_attributes())
            .await?
            .ok_or_else(|| Error::NotFound(format!("user `{uid}` not found in directory")))?;
        Ok(self.provision(uid, &entry.attributes, explicit_id)?)
    }
}
