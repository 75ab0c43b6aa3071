//! LDAP directory integration for host authentication systems.
//!
//! This crate authenticates users against an LDAP directory, resolves nested group memberships
//! and caches them per endpoint, and maps directory attributes onto local accounts.
//!
//! [`DirectoryService`] is the entry point. With the `test-util` feature, `InMemoryDirectory`
//! stands in for a live server.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod cache;
mod config;
mod connection;
mod dn;
mod entry;
mod filter;
#[cfg(any(test, feature = "test-util"))]
mod memory;
mod provision;
mod resolver;
mod service;
mod transport;

pub use cache::{CacheStats, Membership, MembershipCache};
pub use config::{
    AttributeMapping, DirectoryConfig, DirectoryEndpoint, GroupSyncMode, MappingPair, TlsMode,
    ACCOUNT_NAME_FIELD, DEFAULT_CACHE_TTL_SECS, DEFAULT_CONNECTION_TIMEOUT_SECS,
    DEFAULT_GROUP_CLASSES, DEFAULT_GROUP_MEMBER_FIELDS, DEFAULT_LDAPS_PORT, DEFAULT_LDAP_PORT,
    DEFAULT_PASSWORD_FIELD, DEFAULT_SEARCH_TIME_LIMIT_MS, DEFAULT_UID_ATTRIBUTE,
    DEFAULT_USER_SEARCH_FORMAT,
};
pub use connection::{
    ConnectionState, DirectoryConnection, EntryStream, LdapConnector, LdapSession, SearchRequest,
    SearchResults, SearchScope,
};
pub use dn::{escape_dn_value, normalize_dn, DistinguishedName, DnError, Rdn};
pub use entry::{DirectoryEntry, MembershipIndex, SearchAttribute};
pub use filter::{escape_filter_value, format_template, looks_like_filter, user_search_filter};
#[cfg(any(test, feature = "test-util"))]
pub use memory::InMemoryDirectory;
pub use provision::{find_user, sanitize_account_id, UserProvisioner, UserRecord};
pub use resolver::{GroupResolution, GroupResolver};
pub use service::{DirectoryService, GroupSyncPlan, MemberLookup};
pub use transport::{Ldap3Connector, TransportSettings};

pub use dirbridge_core::{BindError, ConfigSource, ConnectError, Error, ProvisionFailure, Result};
