//! Entry points consumed by host authentication and authorization code.

use dirbridge_core::{BindError, Error, ProvisionFailure, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::cache::{Membership, MembershipCache};
use crate::config::{DirectoryConfig, GroupSyncMode};
use crate::connection::{DirectoryConnection, LdapConnector};
use crate::entry::{DirectoryEntry, SearchAttribute};
use crate::provision::{find_user, UserProvisioner, UserRecord};
use crate::resolver::{GroupResolution, GroupResolver};
use crate::transport::{Ldap3Connector, TransportSettings};

/// Answer to a membership check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberLookup {
    /// The account belongs to the group; carries the member DN.
    Member {
        /// DN under which the account was found.
        dn: String,
    },
    /// No group was required.
    Unrestricted,
    /// The account is not a member, or the group could not be resolved.
    Absent,
}

impl MemberLookup {
    /// Returns true unless [`MemberLookup::Absent`].
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

/// Local group changes derived from directory membership.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupSyncPlan {
    /// Local groups the user should join.
    pub add: Vec<String>,
    /// Local groups the user should leave.
    pub remove: Vec<String>,
}

impl GroupSyncPlan {
    /// Returns true when nothing changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Directory integration for one configured endpoint.
///
/// Connections are opened per call and always closed before returning. Group memberships are
/// served from the injected [`MembershipCache`].
pub struct DirectoryService {
    config: Arc<DirectoryConfig>,
    connector: Arc<dyn LdapConnector>,
    cache: Arc<MembershipCache>,
}

impl DirectoryService {
    /// Creates a service talking to the configured server through `ldap3`.
    #[must_use]
    pub fn new(config: DirectoryConfig, cache: Arc<MembershipCache>) -> Self {
        let connector = Arc::new(Ldap3Connector::new(TransportSettings::from_config(&config)));
        Self::with_connector(config, connector, cache)
    }

    /// Creates a service with a custom connector.
    #[must_use]
    pub fn with_connector(
        config: DirectoryConfig,
        connector: Arc<dyn LdapConnector>,
        cache: Arc<MembershipCache>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            cache,
        }
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Membership cache in use.
    #[must_use]
    pub fn cache(&self) -> &MembershipCache {
        &self.cache
    }

    /// Resolves `group` to its transitive leaf members.
    ///
    /// The directory is contacted only on a cache miss. An unreachable directory or a rejected
    /// service bind yields [`Membership::NotAGroup`].
    #[instrument(skip(self))]
    pub async fn resolve_membership(&self, group: &str) -> Membership {
        let bucket = self.bucket();
        self.cache
            .get_or_resolve(&bucket, group, self.config.cache_ttl(), move || {
                self.resolve_uncached(group)
            })
            .await
    }

    /// Checks whether `account` (identifier or DN) belongs to `group`.
    ///
    /// An empty `group` is satisfied without contacting the directory.
    #[instrument(skip(self))]
    pub async fn is_member(&self, account: &str, group: &str) -> MemberLookup {
        if group.trim().is_empty() {
            return MemberLookup::Unrestricted;
        }
        let membership = self.resolve_membership(group).await;
        membership
            .find_member(account, self.config.uid_attribute())
            .map_or(MemberLookup::Absent, |dn| MemberLookup::Member {
                dn: dn.to_string(),
            })
    }

    /// Authenticates `login` and returns its directory entry.
    ///
    /// The entry carries the mapped attributes plus the UID attribute.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] for rejected credentials, [`Error::NotFound`] for an unknown
    /// login, [`Error::AccessDenied`] when the login-group rules refuse the user, or the
    /// connection error.
    #[instrument(skip(self, password))]
    pub async fn bind_and_fetch(&self, login: &str, password: &str) -> Result<DirectoryEntry> {
        if login.trim().is_empty() || password.is_empty() {
            // An empty password would turn into an unauthenticated bind.
            return Err(BindError::InvalidCredentials {
                dn: login.to_string(),
            }
            .into());
        }

        let mut conn = self.connection();
        let outcome = self.login_on(&mut conn, login, password).await;
        conn.close().await;

        match &outcome {
            Ok(entry) => info!(login, dn = %entry.dn, "directory login succeeded"),
            Err(err) if err.should_log() => warn!(login, error = %err, "directory login failed"),
            Err(err) => debug!(login, error = %err, "directory login refused"),
        }
        outcome
    }

    /// Builds a local account from pre-fetched attributes.
    ///
    /// # Errors
    ///
    /// Returns the [`ProvisionFailure`].
    #[instrument(skip(self, attributes))]
    pub fn provision_user(
        &self,
        uid: &str,
        attributes: &[SearchAttribute],
        explicit_id: Option<&str>,
    ) -> std::result::Result<UserRecord, ProvisionFailure> {
        UserProvisioner::new(&self.config).provision(uid, attributes, explicit_id)
    }

    /// Fetches `uid` through the service identity and provisions it.
    ///
    /// # Errors
    ///
    /// Returns the connection, lookup or provisioning error.
    #[instrument(skip(self))]
    pub async fn fetch_and_provision(&self, uid: &str, explicit_id: Option<&str>) -> Result<UserRecord> {
        let mut conn = self.connection();
        conn.open(&self.config.service_endpoint()).await?;
        let outcome = UserProvisioner::new(&self.config)
            .fetch_and_provision(&mut conn, uid, explicit_id)
            .await;
        conn.close().await;
        outcome
    }

    /// Authenticates `login` and provisions a local account from its entry.
    ///
    /// # Errors
    ///
    /// Returns the login or provisioning error.
    pub async fn authenticate_and_provision(
        &self,
        login: &str,
        password: &str,
        explicit_id: Option<&str>,
    ) -> Result<UserRecord> {
        let entry = self.bind_and_fetch(login, password).await?;
        Ok(self.provision_user(login, &entry.attributes, explicit_id)?)
    }

    /// Computes local group changes for `user_dn` from the configured group mappings.
    ///
    /// With `ldap_mode_group_sync=create` only newly created accounts are synchronised. A
    /// mapping whose directory groups all fail to resolve never removes the local group.
    #[instrument(skip(self, current_local_groups))]
    pub async fn plan_group_sync(
        &self,
        user_dn: &str,
        current_local_groups: &BTreeSet<String>,
        newly_created: bool,
    ) -> GroupSyncPlan {
        let mut plan = GroupSyncPlan::default();
        if self.config.group_sync_mode() == GroupSyncMode::OnCreate && !newly_created {
            return plan;
        }

        for (local_group, group_dns) in self.config.group_mappings() {
            let mut resolved_any = false;
            let mut is_member = false;
            for group_dn in group_dns {
                let membership = self.resolve_membership(group_dn).await;
                resolved_any |= membership.is_group();
                if membership
                    .find_member(user_dn, self.config.uid_attribute())
                    .is_some()
                {
                    is_member = true;
                    break;
                }
            }

            let has_local = current_local_groups.contains(local_group);
            if is_member && !has_local {
                plan.add.push(local_group.clone());
            } else if !is_member && has_local && resolved_any {
                plan.remove.push(local_group.clone());
            }
        }

        debug!(user_dn, add = ?plan.add, remove = ?plan.remove, "group sync planned");
        plan
    }

    /// Drops every cached membership of this service's endpoint.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate_endpoint(&self.bucket());
    }

    async fn login_on(
        &self,
        conn: &mut DirectoryConnection,
        login: &str,
        password: &str,
    ) -> Result<DirectoryEntry> {
        let login_endpoint = self.config.login_endpoint(login, password);
        conn.open(&login_endpoint).await?;

        let mut attributes = self.config.attribute_mapping().directory_attributes();
        let uid_attribute = self.config.uid_attribute();
        if !attributes.iter().any(|a| a.eq_ignore_ascii_case(uid_attribute)) {
            attributes.push(uid_attribute.to_string());
        }
        let entry = find_user(conn, &self.config, login, attributes)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user `{login}` not found in directory")))?;

        if !self.config.bind_dn_is_user_specific() {
            self.verify_password(conn, &entry.dn, password).await?;
            conn.bind(login_endpoint.bind_dn(), login_endpoint.bind_password())
                .await?;
        }

        self.check_login_groups(conn, &entry.dn).await?;
        Ok(entry)
    }

    async fn verify_password(
        &self,
        conn: &mut DirectoryConnection,
        user_dn: &str,
        password: &str,
    ) -> Result<()> {
        if self.config.validate_password() {
            let matches = conn
                .compare(user_dn, self.config.password_field(), password)
                .await?;
            if !matches {
                return Err(BindError::InvalidCredentials {
                    dn: user_dn.to_string(),
                }
                .into());
            }
            return Ok(());
        }
        conn.bind(user_dn, password).await
    }

    async fn check_login_groups(&self, conn: &mut DirectoryConnection, user_dn: &str) -> Result<()> {
        let required = self.config.user_group();
        if !required.is_empty()
            && self
                .membership_on(conn, required)
                .await
                .find_member(user_dn, self.config.uid_attribute())
                .is_none()
        {
            return Err(Error::AccessDenied(format!(
                "`{user_dn}` is not a member of `{required}`"
            )));
        }

        let excluded = self.config.exclude_group();
        if !excluded.is_empty()
            && self
                .membership_on(conn, excluded)
                .await
                .find_member(user_dn, self.config.uid_attribute())
                .is_some()
        {
            return Err(Error::AccessDenied(format!(
                "`{user_dn}` is a member of excluded group `{excluded}`"
            )));
        }
        Ok(())
    }

    /// Cached membership, resolved over an already bound connection on a miss.
    async fn membership_on(&self, conn: &mut DirectoryConnection, group: &str) -> Membership {
        let resolver = &GroupResolver::new(&self.config);
        self.cache
            .get_or_resolve(&self.bucket(), group, self.config.cache_ttl(), move || {
                resolver.resolve(conn, group)
            })
            .await
    }

    async fn resolve_uncached(&self, group: &str) -> GroupResolution {
        let mut conn = self.connection();
        if let Err(err) = conn.open(&self.config.service_endpoint()).await {
            warn!(group, error = %err, "directory unavailable, treating reference as not a group");
            return GroupResolution::default();
        }
        let resolution = GroupResolver::new(&self.config).resolve(&mut conn, group).await;
        conn.close().await;
        resolution
    }

    fn connection(&self) -> DirectoryConnection {
        DirectoryConnection::new(self.connector.clone(), self.config.connection_timeout())
    }

    fn bucket(&self) -> String {
        MembershipCache::bucket_key(&self.config.endpoint(), self.config.uid_attribute())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttributeMapping;
    use crate::memory::InMemoryDirectory;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const ADMIN: &str = "cn=admin,dc=example";

    fn directory() -> InMemoryDirectory {
        InMemoryDirectory::new()
            .with_entry(
                DirectoryEntry::new("cn=Eng,ou=Groups,dc=example")
                    .with("objectClass", "groupOfUniqueNames")
                    .with("cn", "Eng")
                    .with("uniqueMember", "uid=alice,ou=People,dc=example")
                    .with("uniqueMember", "cn=Sub,ou=Groups,dc=example"),
            )
            .with_entry(
                DirectoryEntry::new("cn=Sub,ou=Groups,dc=example")
                    .with("objectClass", "groupOfNames")
                    .with("cn", "Sub")
                    .with("member", "uid=bob,ou=People,dc=example"),
            )
            .with_entry(
                DirectoryEntry::new("cn=Banned,ou=Groups,dc=example")
                    .with("objectClass", "groupOfNames")
                    .with("cn", "Banned")
                    .with("member", "uid=bob,ou=People,dc=example"),
            )
            .with_entry(person("alice", "Alice Liddell"))
            .with_entry(person("bob", "Bob Builder"))
            .with_entry(person("carol", "Carol Danvers"))
            .with_password(ADMIN, "admin-secret")
            .with_password("uid=alice,ou=People,dc=example", "wonderland")
            .with_password("uid=bob,ou=People,dc=example", "canwefixit")
            .with_password("uid=carol,ou=People,dc=example", "marvel")
    }

    fn person(uid: &str, cn: &str) -> DirectoryEntry {
        DirectoryEntry::new(format!("uid={uid},ou=People,dc=example"))
            .with("objectClass", "inetOrgPerson")
            .with("uid", uid)
            .with("cn", cn)
            .with("mail", format!("{uid}@example.com"))
            .with("userPassword", "{SSHA}opaque")
    }

    fn config() -> DirectoryConfig {
        DirectoryConfig::default()
            .with_server("ldap.example.com", 389)
            .with_bind(ADMIN, "admin-secret")
            .with_base_dn("dc=example")
            .with_uid_attribute("uid")
            .with_attribute_mapping(AttributeMapping::parse("email=mail,name=cn"))
    }

    fn service(directory: &InMemoryDirectory, config: DirectoryConfig) -> DirectoryService {
        DirectoryService::with_connector(
            config,
            Arc::new(directory.clone()),
            Arc::new(MembershipCache::new()),
        )
    }

    #[tokio::test]
    async fn resolves_nested_membership_once() {
        let directory = directory();
        let service = service(&directory, config());

        let first = service.resolve_membership("cn=Eng,ou=Groups,dc=example").await;
        let expected = BTreeMap::from([
            ("uid=alice,ou=People,dc=example".to_string(), "alice".to_string()),
            ("uid=bob,ou=People,dc=example".to_string(), "bob".to_string()),
        ]);
        assert_eq!(first.members().map(|m| m.to_map()), Some(expected));
        assert_eq!(directory.connection_count(), 1);

        let second = service.resolve_membership("cn=Eng,ou=Groups,dc=example").await;
        assert_eq!(first, second);
        assert_eq!(directory.connection_count(), 1);

        service.invalidate_cache();
        service.resolve_membership("cn=Eng,ou=Groups,dc=example").await;
        assert_eq!(directory.connection_count(), 2);
    }

    #[tokio::test]
    async fn membership_checks() {
        let directory = directory();
        let service = service(&directory, config());

        assert_eq!(
            service.is_member("alice", "cn=Eng,ou=Groups,dc=example").await,
            MemberLookup::Member {
                dn: "uid=alice,ou=People,dc=example".to_string()
            }
        );
        assert_eq!(
            service
                .is_member("uid=bob,ou=People,dc=example", "cn=Eng,ou=Groups,dc=example")
                .await,
            MemberLookup::Member {
                dn: "uid=bob,ou=People,dc=example".to_string()
            }
        );
        assert_eq!(
            service.is_member("carol", "cn=Eng,ou=Groups,dc=example").await,
            MemberLookup::Absent
        );
        assert_eq!(service.is_member("carol", "").await, MemberLookup::Unrestricted);
        assert_eq!(directory.connection_count(), 1);
    }

    #[tokio::test]
    async fn outage_fails_closed() {
        let directory = directory();
        let service = service(&directory, config());
        directory.set_unreachable(true);

        assert_eq!(
            service.resolve_membership("cn=Eng,ou=Groups,dc=example").await,
            Membership::NotAGroup
        );
        assert_eq!(
            service.is_member("alice", "cn=Eng,ou=Groups,dc=example").await,
            MemberLookup::Absent
        );
        assert_eq!(service.cache().stats().entries, 0);
    }

    #[tokio::test]
    async fn rejected_service_bind_fails_closed() {
        let directory = directory();
        let service = service(&directory, config().with_bind(ADMIN, "wrong"));

        assert_eq!(
            service.resolve_membership("cn=Eng,ou=Groups,dc=example").await,
            Membership::NotAGroup
        );
    }

    #[tokio::test]
    async fn login_with_service_account() {
        let directory = directory();
        let service = service(&directory, config());

        let entry = service.bind_and_fetch("alice", "wonderland").await.unwrap();
        assert_eq!(entry.dn, "uid=alice,ou=People,dc=example");
        assert_eq!(entry.first("mail"), Some("alice@example.com"));
        assert_eq!(entry.first("uid"), Some("alice"));
        assert!(!entry.has("userPassword"));

        let err = service.bind_and_fetch("alice", "wrong").await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CREDENTIALS");

        let err = service.bind_and_fetch("alice", "").await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CREDENTIALS");

        let err = service.bind_and_fetch("mallory", "x").await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn login_with_user_bind_template() {
        let directory = directory();
        let config = config().with_bind("uid={0},ou=People,dc=example", "{1}");
        let service = service(&directory, config);

        let entry = service.bind_and_fetch("bob", "canwefixit").await.unwrap();
        assert_eq!(entry.first("cn"), Some("Bob Builder"));

        let err = service.bind_and_fetch("bob", "nope").await.unwrap_err();
        assert!(matches!(err, Error::Bind(BindError::InvalidCredentials { ref dn }) if dn == "uid=bob,ou=People,dc=example"));
    }

    #[tokio::test]
    async fn placeholder_login_keeps_password_out_of_bind_dn() {
        let directory = directory();
        let config = config().with_bind("uid={0},ou=People,dc=example", "{1}");
        let service = service(&directory, config);

        let err = service.bind_and_fetch("{1}", "hunter2").await.unwrap_err();
        assert!(matches!(err, Error::Bind(BindError::InvalidCredentials { ref dn }) if dn == "uid={1},ou=People,dc=example"));
        assert!(!err.to_string().contains("hunter2"));

        let err = service.bind_and_fetch("bob,ou=People", "canwefixit").await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CREDENTIALS");
    }

    #[tokio::test]
    async fn login_with_password_compare() {
        let directory = directory();
        let service = service(&directory, config().with_password_validation("userPassword"));

        assert!(service.bind_and_fetch("carol", "marvel").await.is_ok());
        let err = service.bind_and_fetch("carol", "captain").await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CREDENTIALS");
    }

    #[tokio::test]
    async fn login_groups_are_enforced() {
        let directory = directory();
        let config = config().with_login_groups(
            "cn=Eng,ou=Groups,dc=example",
            "cn=Banned,ou=Groups,dc=example",
        );
        let service = service(&directory, config);

        assert!(service.bind_and_fetch("alice", "wonderland").await.is_ok());

        let err = service.bind_and_fetch("carol", "marvel").await.unwrap_err();
        assert_eq!(err.error_code(), "ACCESS_DENIED");

        let err = service.bind_and_fetch("bob", "canwefixit").await.unwrap_err();
        assert_eq!(err.error_code(), "ACCESS_DENIED");
    }

    #[tokio::test]
    async fn unreachable_login_is_a_connect_error() {
        let directory = directory();
        directory.set_unreachable(true);
        let service = service(&directory, config());

        let err = service.bind_and_fetch("alice", "wonderland").await.unwrap_err();
        assert!(err.is_directory_unavailable());
    }

    #[tokio::test]
    async fn authenticate_and_provision_builds_record() {
        let directory = directory();
        let service = service(&directory, config());

        let record = service
            .authenticate_and_provision("alice", "wonderland", None)
            .await
            .unwrap();
        assert_eq!(record.account_id, "AliceLiddell");
        assert_eq!(record.fields["email"], "alice@example.com");

        let record = service.fetch_and_provision("bob", Some("bob")).await.unwrap();
        assert_eq!(record.account_id, "bob");
    }

    #[tokio::test]
    async fn provision_user_from_attributes() {
        let directory = directory();
        let service = service(&directory, config());

        let attributes = vec![
            SearchAttribute::new("mail", "x@y.com"),
            SearchAttribute::new("cn", "X Y"),
        ];
        let record = service.provision_user("xy", &attributes, None).unwrap();
        assert_eq!(record.account_id, "XY");
        assert_eq!(directory.connection_count(), 0);
    }

    #[tokio::test]
    async fn group_sync_plan() {
        let directory = directory();
        let mappings = BTreeMap::from([
            (
                "Engineers".to_string(),
                vec!["cn=Eng,ou=Groups,dc=example".to_string()],
            ),
            (
                "Banned".to_string(),
                vec!["cn=Banned,ou=Groups,dc=example".to_string()],
            ),
            (
                "Ghosts".to_string(),
                vec!["cn=Ghost,ou=Groups,dc=example".to_string()],
            ),
        ]);
        let config = config().with_group_mappings(mappings.clone(), GroupSyncMode::Always);
        let service = service(&directory, config);

        let current = BTreeSet::from(["Banned".to_string(), "Ghosts".to_string()]);
        let plan = service
            .plan_group_sync("uid=alice,ou=People,dc=example", &current, false)
            .await;
        assert_eq!(
            plan,
            GroupSyncPlan {
                add: vec!["Engineers".to_string()],
                remove: vec!["Banned".to_string()],
            }
        );

        let on_create = service_with_mode(&directory, mappings, GroupSyncMode::OnCreate);
        assert!(on_create
            .plan_group_sync("uid=alice,ou=People,dc=example", &current, false)
            .await
            .is_empty());
        assert!(!on_create
            .plan_group_sync("uid=alice,ou=People,dc=example", &current, true)
            .await
            .is_empty());
    }

    fn service_with_mode(
        directory: &InMemoryDirectory,
        mappings: BTreeMap<String, Vec<String>>,
        mode: GroupSyncMode,
    ) -> DirectoryService {
        service(directory, config().with_group_mappings(mappings, mode))
    }

    #[tokio::test(start_paused = true)]
    async fn cache_ttl_applies_to_service() {
        let directory = directory();
        let service = service(&directory, config().with_cache_ttl(Duration::from_secs(1)));

        service.resolve_membership("cn=Sub,ou=Groups,dc=example").await;
        service.resolve_membership("cn=Sub,ou=Groups,dc=example").await;
        assert_eq!(directory.connection_count(), 1);

        tokio::time::advance(Duration::from_millis(1_100)).await;
        service.resolve_membership("cn=Sub,ou=Groups,dc=example").await;
        assert_eq!(directory.connection_count(), 2);
    }
}
