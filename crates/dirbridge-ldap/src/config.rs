//! Directory settings resolved from a layered configuration source.

use dirbridge_core::ConfigSource;
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use validator::Validate;

use crate::dn::escape_dn_value;
use crate::filter::format_template;

/// Default UID attribute.
pub const DEFAULT_UID_ATTRIBUTE: &str = "cn";
/// Object classes recognised as groups unless configured otherwise.
pub const DEFAULT_GROUP_CLASSES: &[&str] = &[
    "group",
    "groupOfNames",
    "groupOfUniqueNames",
    "dynamicGroup",
    "dynamicGroupAux",
    "groupWiseDistributionList",
];
/// Attributes holding group members unless configured otherwise.
pub const DEFAULT_GROUP_MEMBER_FIELDS: &[&str] = &["member", "uniqueMember"];
/// Default membership cache TTL (seconds).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 21_800;
/// Default connection and operation timeout (seconds).
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;
/// Default search time limit (milliseconds).
pub const DEFAULT_SEARCH_TIME_LIMIT_MS: u64 = 1_000;
/// Default user lookup filter format.
pub const DEFAULT_USER_SEARCH_FORMAT: &str = "({0}={1})";
/// Default attribute compared when validating passwords.
pub const DEFAULT_PASSWORD_FIELD: &str = "userPassword";
/// Plain LDAP port.
pub const DEFAULT_LDAP_PORT: u16 = 389;
/// LDAPS port.
pub const DEFAULT_LDAPS_PORT: u16 = 636;

/// Local field that derives the account identifier during provisioning.
pub const ACCOUNT_NAME_FIELD: &str = "name";

/// Identifies one remote directory instance and the identity to bind with.
pub struct DirectoryEndpoint {
    host: String,
    port: u16,
    use_tls: bool,
    bind_dn: String,
    bind_password: SecretString,
}

impl DirectoryEndpoint {
    /// Creates an endpoint with anonymous credentials.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, use_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls,
            bind_dn: String::new(),
            bind_password: SecretString::from(String::new()),
        }
    }

    /// Sets the bind identity.
    #[must_use]
    pub fn with_credentials(mut self, bind_dn: impl Into<String>, password: impl Into<String>) -> Self {
        self.bind_dn = bind_dn.into();
        self.bind_password = SecretString::from(password.into());
        self
    }

    /// Host name.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Whether the session is TLS protected.
    #[must_use]
    pub const fn use_tls(&self) -> bool {
        self.use_tls
    }

    /// DN to bind as; empty for anonymous.
    #[must_use]
    pub fn bind_dn(&self) -> &str {
        &self.bind_dn
    }

    /// Password to bind with.
    #[must_use]
    pub fn bind_password(&self) -> &str {
        self.bind_password.expose_secret()
    }

    /// `host:port`, used for cache partitioning and diagnostics.
    #[must_use]
    pub fn signature(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connection URL; `ldaps` when TLS is requested.
    ///
    /// StartTLS upgrades are requested through the transport settings and use the `ldap` scheme.
    #[must_use]
    pub fn url(&self, starttls: bool) -> String {
        let scheme = if self.use_tls && !starttls {
            "ldaps"
        } else {
            "ldap"
        };
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{scheme}://[{}]:{}", self.host, self.port)
        } else {
            format!("{scheme}://{}:{}", self.host, self.port)
        }
    }
}

impl Clone for DirectoryEndpoint {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            use_tls: self.use_tls,
            bind_dn: self.bind_dn.clone(),
            bind_password: SecretString::from(self.bind_password.expose_secret().to_owned()),
        }
    }
}

impl fmt::Debug for DirectoryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_tls", &self.use_tls)
            .field("bind_dn", &self.bind_dn)
            .finish_non_exhaustive()
    }
}

/// One `local=directoryAttribute` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingPair {
    /// Local account field.
    pub local: String,
    /// Directory attribute supplying the value.
    pub directory: String,
}

/// Ordered mapping from directory attributes to local account fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeMapping {
    pairs: Vec<MappingPair>,
}

impl AttributeMapping {
    /// Parses `local=directoryAttr` pairs separated by commas.
    ///
    /// Malformed pairs are skipped with a warning.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut pairs = Vec::new();
        for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match item.split_once('=') {
                Some((local, directory))
                    if !local.trim().is_empty()
                        && !directory.trim().is_empty()
                        && !directory.contains('=') =>
                {
                    pairs.push(MappingPair {
                        local: local.trim().to_string(),
                        directory: directory.trim().to_string(),
                    });
                }
                _ => warn!(pair = item, "ignoring malformed attribute mapping pair"),
            }
        }
        Self { pairs }
    }

    /// Builds a mapping from explicit pairs.
    #[must_use]
    pub fn from_pairs<I, L, D>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (L, D)>,
        L: Into<String>,
        D: Into<String>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(local, directory)| MappingPair {
                    local: local.into(),
                    directory: directory.into(),
                })
                .collect(),
        }
    }

    /// Returns true if no pair is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Pairs in configured order.
    pub fn iter(&self) -> impl Iterator<Item = &MappingPair> + '_ {
        self.pairs.iter()
    }

    /// Directory attribute feeding the account name, if mapped.
    #[must_use]
    pub fn name_attribute(&self) -> Option<&str> {
        self.pairs
            .iter()
            .find(|pair| pair.local == ACCOUNT_NAME_FIELD)
            .map(|pair| pair.directory.as_str())
    }

    /// Distinct directory attributes to request when fetching a user.
    #[must_use]
    pub fn directory_attributes(&self) -> Vec<String> {
        let mut attrs: Vec<String> = Vec::with_capacity(self.pairs.len());
        for pair in &self.pairs {
            if !attrs.iter().any(|a| a.eq_ignore_ascii_case(&pair.directory)) {
                attrs.push(pair.directory.clone());
            }
        }
        attrs
    }
}

/// How the session is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// No TLS.
    Plain,
    /// TLS from the first byte (`ldaps://`).
    Ldaps,
    /// Plain connection upgraded with the StartTLS extended operation.
    StartTls,
}

/// When local group memberships are synchronised from the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSyncMode {
    /// On every login.
    Always,
    /// Only when the local account is first created.
    OnCreate,
}

#[derive(Validate)]
struct EndpointSettings {
    #[validate(length(min = 1, max = 253))]
    host: String,
    #[validate(range(min = 1, max = 65535))]
    port: u32,
}

/// Read-only snapshot of directory settings.
///
/// Built once from a [`ConfigSource`]; every malformed or absent value is replaced by its
/// documented default, with a warning emitted at load time.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    host: String,
    port: u16,
    tls_mode: TlsMode,
    tls_verify: bool,
    trust_store: Option<PathBuf>,
    bind_dn_template: String,
    bind_password_template: String,
    base_dn: String,
    uid_attribute: String,
    user_search_format: String,
    group_classes: Vec<String>,
    group_member_fields: Vec<String>,
    attribute_mapping: AttributeMapping,
    cache_ttl: Duration,
    user_group: String,
    exclude_group: String,
    validate_password: bool,
    password_field: String,
    group_mappings: BTreeMap<String, Vec<String>>,
    group_sync_mode: GroupSyncMode,
    search_time_limit: Duration,
    connection_timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_LDAP_PORT,
            tls_mode: TlsMode::Plain,
            tls_verify: true,
            trust_store: None,
            bind_dn_template: String::new(),
            bind_password_template: String::new(),
            base_dn: String::new(),
            uid_attribute: DEFAULT_UID_ATTRIBUTE.to_string(),
            user_search_format: DEFAULT_USER_SEARCH_FORMAT.to_string(),
            group_classes: lowercase_all(DEFAULT_GROUP_CLASSES.iter().copied()),
            group_member_fields: lowercase_all(DEFAULT_GROUP_MEMBER_FIELDS.iter().copied()),
            attribute_mapping: AttributeMapping::default(),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            user_group: String::new(),
            exclude_group: String::new(),
            validate_password: false,
            password_field: DEFAULT_PASSWORD_FIELD.to_string(),
            group_mappings: BTreeMap::new(),
            group_sync_mode: GroupSyncMode::Always,
            search_time_limit: Duration::from_millis(DEFAULT_SEARCH_TIME_LIMIT_MS),
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
        }
    }
}

impl DirectoryConfig {
    /// Resolves every setting from `source`.
    #[must_use]
    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let defaults = Self::default();
        let get = |key: &str| source.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let use_tls = get("ldap_ssl")
            .and_then(|raw| parse_bool("ldap_ssl", &raw))
            .unwrap_or(false);
        let starttls = get("ldap_starttls")
            .and_then(|raw| parse_bool("ldap_starttls", &raw))
            .unwrap_or(false);
        let tls_mode = match (use_tls, starttls) {
            (_, true) => TlsMode::StartTls,
            (true, false) => TlsMode::Ldaps,
            (false, false) => TlsMode::Plain,
        };
        let default_port = if tls_mode == TlsMode::Ldaps {
            DEFAULT_LDAPS_PORT
        } else {
            DEFAULT_LDAP_PORT
        };

        let host = get("ldap_server").unwrap_or(defaults.host);
        let port = get("ldap_port").map_or(u32::from(default_port), |raw| {
            raw.parse::<u32>().unwrap_or_else(|_| {
                warn!(key = "ldap_port", value = %raw, "malformed directory port, using default");
                u32::from(default_port)
            })
        });
        let settings = EndpointSettings { host, port };
        let (host, port) = match settings.validate() {
            Ok(()) => (
                settings.host,
                u16::try_from(settings.port).unwrap_or(default_port),
            ),
            Err(err) => {
                warn!(error = %err, "invalid directory endpoint settings, using defaults");
                let host = if settings.host.is_empty() || settings.host.len() > 253 {
                    "localhost".to_string()
                } else {
                    settings.host
                };
                let port = u16::try_from(settings.port)
                    .ok()
                    .filter(|p| *p != 0)
                    .unwrap_or(default_port);
                (host, port)
            }
        };

        let cache_ttl = get("ldap_groupcache_expiration")
            .and_then(|raw| parse_u64("ldap_groupcache_expiration", &raw))
            .map_or(defaults.cache_ttl, Duration::from_secs);
        let search_time_limit = get("ldap_timeout")
            .and_then(|raw| parse_u64("ldap_timeout", &raw))
            .filter(|ms| *ms > 0)
            .map_or(defaults.search_time_limit, Duration::from_millis);
        let connection_timeout = get("ldap_connect_timeout")
            .and_then(|raw| parse_u64("ldap_connect_timeout", &raw))
            .filter(|secs| *secs > 0)
            .map_or(defaults.connection_timeout, Duration::from_secs);

        let group_classes = get("ldap_group_classes")
            .map(|raw| parse_list(&raw))
            .filter(|list| !list.is_empty())
            .unwrap_or(defaults.group_classes);
        let group_member_fields = get("ldap_group_memberfields")
            .map(|raw| parse_list(&raw))
            .filter(|list| !list.is_empty())
            .unwrap_or(defaults.group_member_fields);

        let group_sync_mode = match get("ldap_mode_group_sync") {
            None => GroupSyncMode::Always,
            Some(raw) if raw.eq_ignore_ascii_case("always") => GroupSyncMode::Always,
            Some(raw) if raw.eq_ignore_ascii_case("create") => GroupSyncMode::OnCreate,
            Some(raw) => {
                warn!(key = "ldap_mode_group_sync", value = %raw, "unknown group sync mode, using `always`");
                GroupSyncMode::Always
            }
        };

        Self {
            host,
            port,
            tls_mode,
            tls_verify: get("ldap_ssl.verify")
                .and_then(|raw| parse_bool("ldap_ssl.verify", &raw))
                .unwrap_or(true),
            trust_store: get("ldap_ssl.keystore").map(PathBuf::from),
            bind_dn_template: get("ldap_bind_DN").unwrap_or_default(),
            bind_password_template: source.get("ldap_bind_pass").unwrap_or_default(),
            base_dn: get("ldap_base_DN").unwrap_or_default(),
            uid_attribute: get("ldap_UID_attr").unwrap_or(defaults.uid_attribute),
            user_search_format: get("ldap_user_search_fmt").unwrap_or(defaults.user_search_format),
            group_classes,
            group_member_fields,
            attribute_mapping: get("ldap_fields_mapping")
                .map(|raw| AttributeMapping::parse(&raw))
                .unwrap_or_default(),
            cache_ttl,
            user_group: get("ldap_user_group").unwrap_or_default(),
            exclude_group: get("ldap_exclude_group").unwrap_or_default(),
            validate_password: get("ldap_validate_password")
                .and_then(|raw| parse_bool("ldap_validate_password", &raw))
                .unwrap_or(false),
            password_field: get("ldap_password_field").unwrap_or(defaults.password_field),
            group_mappings: get("ldap_group_mapping")
                .map(|raw| parse_group_mappings(&raw))
                .unwrap_or_default(),
            group_sync_mode,
            search_time_limit,
            connection_timeout,
        }
    }

    /// Directory host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Directory port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// TLS mode.
    #[must_use]
    pub const fn tls_mode(&self) -> TlsMode {
        self.tls_mode
    }

    /// Returns whether TLS certificate verification is enabled.
    #[must_use]
    pub const fn tls_verify(&self) -> bool {
        self.tls_verify
    }

    /// Optional PEM bundle of trusted CA certificates.
    #[must_use]
    pub fn trust_store(&self) -> Option<&PathBuf> {
        self.trust_store.as_ref()
    }

    /// Base DN for searches.
    #[must_use]
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Attribute holding the user identifier.
    #[must_use]
    pub fn uid_attribute(&self) -> &str {
        &self.uid_attribute
    }

    /// User lookup filter format (`{0}` attribute, `{1}` uid).
    #[must_use]
    pub fn user_search_format(&self) -> &str {
        &self.user_search_format
    }

    /// Lower-cased group object classes.
    #[must_use]
    pub fn group_classes(&self) -> &[String] {
        &self.group_classes
    }

    /// Lower-cased member attributes.
    #[must_use]
    pub fn group_member_fields(&self) -> &[String] {
        &self.group_member_fields
    }

    /// Returns true if `object_class` names a group class.
    #[must_use]
    pub fn is_group_class(&self, object_class: &str) -> bool {
        self.group_classes
            .iter()
            .any(|class| class.eq_ignore_ascii_case(object_class))
    }

    /// Returns true if `attribute` is a configured member attribute.
    #[must_use]
    pub fn is_member_field(&self, attribute: &str) -> bool {
        self.group_member_fields
            .iter()
            .any(|field| field.eq_ignore_ascii_case(attribute))
    }

    /// Provisioning attribute mapping.
    #[must_use]
    pub fn attribute_mapping(&self) -> &AttributeMapping {
        &self.attribute_mapping
    }

    /// Membership cache TTL.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Group a user must belong to in order to log in (empty: unrestricted).
    #[must_use]
    pub fn user_group(&self) -> &str {
        &self.user_group
    }

    /// Group whose members may not log in (empty: none).
    #[must_use]
    pub fn exclude_group(&self) -> &str {
        &self.exclude_group
    }

    /// Whether passwords are verified by compare instead of bind.
    #[must_use]
    pub const fn validate_password(&self) -> bool {
        self.validate_password
    }

    /// Attribute compared when validating passwords.
    #[must_use]
    pub fn password_field(&self) -> &str {
        &self.password_field
    }

    /// Local group name to directory group DNs.
    #[must_use]
    pub const fn group_mappings(&self) -> &BTreeMap<String, Vec<String>> {
        &self.group_mappings
    }

    /// Group synchronisation mode.
    #[must_use]
    pub const fn group_sync_mode(&self) -> GroupSyncMode {
        self.group_sync_mode
    }

    /// Time limit for a single search.
    #[must_use]
    pub const fn search_time_limit(&self) -> Duration {
        self.search_time_limit
    }

    /// Connection and per-operation timeout.
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// Returns true if the bind DN template embeds the login (`{0}`).
    #[must_use]
    pub fn bind_dn_is_user_specific(&self) -> bool {
        self.bind_dn_template.contains("{0}")
    }

    /// Endpoint without any bind identity.
    #[must_use]
    pub fn endpoint(&self) -> DirectoryEndpoint {
        DirectoryEndpoint::new(self.host.clone(), self.port, self.tls_mode != TlsMode::Plain)
    }

    /// Endpoint bound with the configured service identity.
    ///
    /// A user-specific bind template has no meaning outside a login, so it yields an anonymous
    /// endpoint.
    #[must_use]
    pub fn service_endpoint(&self) -> DirectoryEndpoint {
        if self.bind_dn_is_user_specific() {
            return self.endpoint();
        }
        self.endpoint()
            .with_credentials(self.bind_dn_template.clone(), self.bind_password_template.clone())
    }

    /// Endpoint bound with the templates expanded for `login` / `password`.
    ///
    /// The login is DN-escaped before it lands in the bind DN.
    #[must_use]
    pub fn login_endpoint(&self, login: &str, password: &str) -> DirectoryEndpoint {
        let escaped = escape_dn_value(login);
        self.endpoint().with_credentials(
            format_template(&self.bind_dn_template, &[escaped.as_str(), password]),
            format_template(&self.bind_password_template, &[login, password]),
        )
    }

    /// Overrides the directory host and port.
    #[must_use]
    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Overrides the bind templates.
    #[must_use]
    pub fn with_bind(mut self, dn: impl Into<String>, password: impl Into<String>) -> Self {
        self.bind_dn_template = dn.into();
        self.bind_password_template = password.into();
        self
    }

    /// Overrides the base DN.
    #[must_use]
    pub fn with_base_dn(mut self, base_dn: impl Into<String>) -> Self {
        self.base_dn = base_dn.into();
        self
    }

    /// Overrides the UID attribute.
    #[must_use]
    pub fn with_uid_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.uid_attribute = attribute.into();
        self
    }

    /// Overrides the attribute mapping.
    #[must_use]
    pub fn with_attribute_mapping(mut self, mapping: AttributeMapping) -> Self {
        self.attribute_mapping = mapping;
        self
    }

    /// Overrides the cache TTL.
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Overrides the required and excluded login groups.
    #[must_use]
    pub fn with_login_groups(mut self, required: impl Into<String>, excluded: impl Into<String>) -> Self {
        self.user_group = required.into();
        self.exclude_group = excluded.into();
        self
    }

    /// Enables password validation by compare on `field`.
    #[must_use]
    pub fn with_password_validation(mut self, field: impl Into<String>) -> Self {
        self.validate_password = true;
        self.password_field = field.into();
        self
    }

    /// Overrides the group mappings and sync mode.
    #[must_use]
    pub fn with_group_mappings(mut self, mappings: BTreeMap<String, Vec<String>>, mode: GroupSyncMode) -> Self {
        self.group_mappings = mappings;
        self.group_sync_mode = mode;
        self
    }

    /// Overrides the search time limit.
    #[must_use]
    pub const fn with_search_time_limit(mut self, limit: Duration) -> Self {
        self.search_time_limit = limit;
        self
    }
}

fn parse_bool(key: &str, raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(key, value = %raw, "malformed boolean directory setting, using default");
            None
        }
    }
}

fn parse_u64(key: &str, raw: &str) -> Option<u64> {
    raw.parse().map_or_else(
        |_| {
            warn!(key, value = %raw, "malformed numeric directory setting, using default");
            None
        },
        Some,
    )
}

fn parse_list(raw: &str) -> Vec<String> {
    lowercase_all(raw.split(',').map(str::trim).filter(|s| !s.is_empty()))
}

fn lowercase_all<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    items.map(str::to_ascii_lowercase).collect()
}

/// Parses `localGroup=groupDN|localGroup=groupDN`; one local group may appear several times.
fn parse_group_mappings(raw: &str) -> BTreeMap<String, Vec<String>> {
    let mut mappings: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for item in raw.split('|').map(str::trim).filter(|s| !s.is_empty()) {
        match item.split_once('=') {
            Some((local, dn)) if !local.trim().is_empty() && !dn.trim().is_empty() => {
                mappings
                    .entry(local.trim().to_string())
                    .or_default()
                    .push(dn.trim().to_string());
            }
            _ => warn!(mapping = item, "ignoring malformed group mapping"),
        }
    }
    mappings
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirbridge_core::{LayeredSource, MapSource};

    #[test]
    fn defaults_from_empty_source() {
        let config = DirectoryConfig::from_source(&MapSource::new());
        assert_eq!(config.host(), "localhost");
        assert_eq!(config.port(), 389);
        assert_eq!(config.tls_mode(), TlsMode::Plain);
        assert_eq!(config.uid_attribute(), "cn");
        assert_eq!(config.cache_ttl(), Duration::from_secs(21_800));
        assert_eq!(config.group_member_fields(), ["member", "uniquemember"]);
        assert!(config.is_group_class("GroupOfUniqueNames"));
        assert!(config.is_group_class("groupWiseDistributionList"));
        assert!(!config.is_group_class("person"));
        assert!(config.attribute_mapping().is_empty());
        assert_eq!(config.user_search_format(), "({0}={1})");
        assert_eq!(config.search_time_limit(), Duration::from_millis(1_000));
    }

    #[test]
    fn tls_changes_default_port() {
        let config = DirectoryConfig::from_source(&MapSource::new().with("ldap_ssl", "1"));
        assert_eq!(config.tls_mode(), TlsMode::Ldaps);
        assert_eq!(config.port(), 636);
        assert_eq!(config.endpoint().url(false), "ldaps://localhost:636");

        let config = DirectoryConfig::from_source(
            &MapSource::new()
                .with("ldap_ssl", "true")
                .with("ldap_starttls", "yes"),
        );
        assert_eq!(config.tls_mode(), TlsMode::StartTls);
        assert_eq!(config.port(), 389);
        assert!(config.endpoint().use_tls());
        assert_eq!(config.endpoint().url(true), "ldap://localhost:389");
    }

    #[test]
    fn malformed_values_fall_back_to_defaults() {
        let source = MapSource::new()
            .with("ldap_port", "not-a-port")
            .with("ldap_ssl", "maybe")
            .with("ldap_groupcache_expiration", "-5")
            .with("ldap_timeout", "0")
            .with("ldap_mode_group_sync", "sometimes")
            .with("ldap_group_classes", " , ");
        let config = DirectoryConfig::from_source(&source);

        assert_eq!(config.port(), 389);
        assert_eq!(config.tls_mode(), TlsMode::Plain);
        assert_eq!(config.cache_ttl(), Duration::from_secs(DEFAULT_CACHE_TTL_SECS));
        assert_eq!(config.search_time_limit(), Duration::from_millis(1_000));
        assert_eq!(config.group_sync_mode(), GroupSyncMode::Always);
        assert_eq!(config.group_classes().len(), DEFAULT_GROUP_CLASSES.len());
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let config = DirectoryConfig::from_source(&MapSource::new().with("ldap_port", "70000"));
        assert_eq!(config.port(), 389);

        let config = DirectoryConfig::from_source(&MapSource::new().with("ldap_port", "0"));
        assert_eq!(config.port(), 389);
    }

    #[test]
    fn layered_override_wins() {
        let site = MapSource::new()
            .with("ldap_server", "site.example.com")
            .with("ldap_UID_attr", "uid");
        let global = MapSource::new()
            .with("ldap_server", "global.example.com")
            .with("ldap_port", "10389")
            .with("ldap_group_memberfields", "member, memberUid");
        let layered = LayeredSource::new().with_layer(site).with_layer(global);

        let config = DirectoryConfig::from_source(&layered);
        assert_eq!(config.host(), "site.example.com");
        assert_eq!(config.port(), 10389);
        assert_eq!(config.uid_attribute(), "uid");
        assert!(config.is_member_field("memberUID"));
        assert!(!config.is_member_field("uniqueMember"));
        assert_eq!(config.endpoint().signature(), "site.example.com:10389");
    }

    #[test]
    fn attribute_mapping_parsing() {
        let mapping = AttributeMapping::parse("email=mail, name=cn,,broken,=sn,first_name=givenName");
        let pairs: Vec<_> = mapping
            .iter()
            .map(|p| (p.local.as_str(), p.directory.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![("email", "mail"), ("name", "cn"), ("first_name", "givenName")]
        );
        assert_eq!(mapping.name_attribute(), Some("cn"));
        assert_eq!(mapping.directory_attributes(), vec!["mail", "cn", "givenName"]);
    }

    #[test]
    fn group_mappings_parsing() {
        let config = DirectoryConfig::from_source(&MapSource::new().with(
            "ldap_group_mapping",
            "Admins=cn=admins,ou=Groups|Users=cn=staff,ou=Groups|Users=cn=contractors,ou=Groups|junk",
        ));
        let mappings = config.group_mappings();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings["Admins"], vec!["cn=admins,ou=Groups"]);
        assert_eq!(
            mappings["Users"],
            vec!["cn=staff,ou=Groups", "cn=contractors,ou=Groups"]
        );
    }

    #[test]
    fn bind_templates() {
        let config = DirectoryConfig::default()
            .with_bind("uid={0},ou=People,dc=example", "{1}");
        assert!(config.bind_dn_is_user_specific());
        assert_eq!(config.service_endpoint().bind_dn(), "");

        let login = config.login_endpoint("bob", "hunter2");
        assert_eq!(login.bind_dn(), "uid=bob,ou=People,dc=example");
        assert_eq!(login.bind_password(), "hunter2");

        let config = DirectoryConfig::default().with_bind("cn=admin,dc=example", "secret");
        assert!(!config.bind_dn_is_user_specific());
        assert_eq!(config.service_endpoint().bind_dn(), "cn=admin,dc=example");
        assert_eq!(config.service_endpoint().bind_password(), "secret");
    }

    #[test]
    fn login_is_escaped_in_bind_dn() {
        let config = DirectoryConfig::default()
            .with_bind("uid={0},ou=People,dc=example", "{1}");

        let login = config.login_endpoint("doe, john", "hunter2");
        assert_eq!(login.bind_dn(), r"uid=doe\, john,ou=People,dc=example");
        assert_eq!(login.bind_password(), "hunter2");

        let login = config.login_endpoint("{1}", "hunter2");
        assert_eq!(login.bind_dn(), "uid={1},ou=People,dc=example");
        assert!(!format!("{login:?}").contains("hunter2"));
    }

    #[test]
    fn endpoint_debug_redacts_password() {
        let endpoint =
            DirectoryEndpoint::new("ldap.example.com", 389, false).with_credentials("cn=admin", "secret");
        let debug = format!("{endpoint:?}");
        assert!(debug.contains("cn=admin"));
        assert!(!debug.contains("secret"));
        assert_eq!(endpoint.clone().bind_password(), "secret");
    }

    #[test]
    fn ipv6_host_is_bracketed() {
        let endpoint = DirectoryEndpoint::new("::1", 389, false);
        assert_eq!(endpoint.url(false), "ldap://[::1]:389");
    }
}
