//! `ldap3` implementation of the session traits.

use async_trait::async_trait;
use dirbridge_core::{BindError, ConnectError, Error, Result};
use ldap3::result::CompareResult;
use ldap3::{
    Ldap, LdapConnAsync, LdapConnSettings, LdapError, SearchEntry, SearchOptions, SearchStream,
};
use native_tls::{Certificate, TlsConnector};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::{DirectoryConfig, DirectoryEndpoint, TlsMode};
use crate::connection::{EntryStream, LdapConnector, LdapSession, SearchRequest};
use crate::entry::DirectoryEntry;

const RC_SUCCESS: u32 = 0;
const RC_TIME_LIMIT_EXCEEDED: u32 = 3;
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
const RC_COMPARE_FALSE: u32 = 5;
const RC_COMPARE_TRUE: u32 = 6;
const RC_NO_SUCH_ATTRIBUTE: u32 = 16;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INVALID_CREDENTIALS: u32 = 49;

/// Transport options applied to every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    connect_timeout: Duration,
    starttls: bool,
    tls_verify: bool,
    trust_store: Option<PathBuf>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(crate::config::DEFAULT_CONNECTION_TIMEOUT_SECS),
            starttls: false,
            tls_verify: true,
            trust_store: None,
        }
    }
}

impl TransportSettings {
    /// Derives transport options from the directory settings.
    #[must_use]
    pub fn from_config(config: &DirectoryConfig) -> Self {
        Self {
            connect_timeout: config.connection_timeout(),
            starttls: config.tls_mode() == TlsMode::StartTls,
            tls_verify: config.tls_verify(),
            trust_store: config.trust_store().cloned(),
        }
    }

    /// Sets the TCP connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Upgrades TLS endpoints with StartTLS instead of LDAPS.
    #[must_use]
    pub const fn with_starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    /// Enables or disables certificate verification.
    #[must_use]
    pub const fn with_tls_verify(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    /// Trusts the CA certificates in the PEM file at `path`.
    #[must_use]
    pub fn with_trust_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust_store = Some(path.into());
        self
    }
}

/// Connector backed by `ldap3`.
#[derive(Debug, Clone, Default)]
pub struct Ldap3Connector {
    settings: TransportSettings,
}

impl Ldap3Connector {
    /// Creates a new connector instance.
    #[must_use]
    pub const fn new(settings: TransportSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl LdapConnector for Ldap3Connector {
    async fn connect(
        &self,
        endpoint: &DirectoryEndpoint,
    ) -> std::result::Result<Box<dyn LdapSession>, ConnectError> {
        let signature = endpoint.signature();
        let starttls = self.settings.starttls && endpoint.use_tls();
        let url = endpoint.url(starttls);
        Url::parse(&url).map_err(|err| ConnectError::InvalidEndpoint(format!("{url}: {err}")))?;

        let settings = build_ldap_settings(&self.settings, starttls).map_err(|message| {
            ConnectError::TlsHandshake {
                endpoint: signature.clone(),
                message,
            }
        })?;
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|err| classify_connect_error(&signature, err))?;
        ldap3::drive!(conn);

        debug!(endpoint = %signature, starttls, "directory transport established");
        Ok(Box::new(Ldap3Session { inner: ldap }))
    }
}

struct Ldap3Session {
    inner: Ldap,
}

#[async_trait]
impl LdapSession for Ldap3Session {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> std::result::Result<(), BindError> {
        let result = self
            .inner
            .simple_bind(dn, password)
            .await
            .map_err(|err| BindError::Transport(err.to_string()))?;
        bind_outcome(result.rc, result.text, dn)
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<Box<dyn EntryStream>> {
        // The server limit has one second granularity; the local deadline is exact.
        let seconds = request.time_limit.as_secs().max(1);
        let time_limit = i32::try_from(seconds).unwrap_or(i32::MAX);

        let abandon_handle = self.inner.clone();
        let stream = self
            .inner
            .with_search_options(SearchOptions::new().timelimit(time_limit))
            .streaming_search(
                &request.base_dn,
                request.scope.into(),
                &request.filter,
                request.attributes.clone(),
            )
            .await
            .map_err(map_ldap_error)?;

        Ok(Box::new(Ldap3EntryStream {
            stream,
            abandon_handle,
            base_dn: request.base_dn.clone(),
        }))
    }

    async fn compare(&mut self, dn: &str, attribute: &str, value: &str) -> Result<bool> {
        let CompareResult(result) = self
            .inner
            .compare(dn, attribute, value)
            .await
            .map_err(map_ldap_error)?;
        compare_outcome(result.rc, &result.text, dn)
    }

    async fn unbind(&mut self) -> Result<()> {
        self.inner.unbind().await.map_err(map_ldap_error)
    }
}

struct Ldap3EntryStream {
    stream: SearchStream<'static, String, Vec<String>>,
    abandon_handle: Ldap,
    base_dn: String,
}

#[async_trait]
impl EntryStream for Ldap3EntryStream {
    async fn next_entry(&mut self) -> Result<Option<DirectoryEntry>> {
        loop {
            let Some(entry) = self.stream.next().await.map_err(map_ldap_error)? else {
                let result = self.stream.finish().await;
                return search_outcome(result.rc, &result.text, &self.base_dn);
            };
            if entry.is_ref() || entry.is_intermediate() {
                continue;
            }
            let entry = SearchEntry::construct(entry);
            return Ok(Some(DirectoryEntry::from_multi_valued(entry.dn, entry.attrs)));
        }
    }

    async fn abandon(&mut self) {
        let msgid = self.stream.ldap_handle().last_id();
        if let Err(err) = self.abandon_handle.abandon(msgid).await {
            debug!(base = %self.base_dn, error = %err, "abandon failed");
        }
    }
}

fn bind_outcome(rc: u32, text: String, dn: &str) -> std::result::Result<(), BindError> {
    match rc {
        RC_SUCCESS => Ok(()),
        RC_INVALID_CREDENTIALS => Err(BindError::InvalidCredentials { dn: dn.to_string() }),
        code => Err(BindError::Protocol {
            code,
            message: text,
        }),
    }
}

/// Attribute or entry absence is a plain mismatch, not a failure.
fn compare_outcome(rc: u32, text: &str, dn: &str) -> Result<bool> {
    match rc {
        RC_COMPARE_TRUE => Ok(true),
        RC_COMPARE_FALSE | RC_NO_SUCH_ATTRIBUTE | RC_NO_SUCH_OBJECT => Ok(false),
        code => Err(Error::Protocol(format!(
            "compare on `{dn}` failed with result code {code}: {text}"
        ))),
    }
}

fn search_outcome(rc: u32, text: &str, base_dn: &str) -> Result<Option<DirectoryEntry>> {
    match rc {
        RC_SUCCESS | RC_SIZE_LIMIT_EXCEEDED | RC_NO_SUCH_OBJECT => Ok(None),
        RC_TIME_LIMIT_EXCEEDED => Err(Error::SearchTimeout(base_dn.to_string())),
        code => Err(Error::Protocol(format!(
            "search under `{base_dn}` failed with result code {code}: {text}"
        ))),
    }
}

fn build_ldap_settings(
    settings: &TransportSettings,
    starttls: bool,
) -> std::result::Result<LdapConnSettings, String> {
    let mut ldap_settings = LdapConnSettings::new()
        .set_conn_timeout(settings.connect_timeout)
        .set_starttls(starttls);

    if !settings.tls_verify {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| format!("failed to construct TLS connector: {err}"))?;
        ldap_settings = ldap_settings
            .set_connector(connector)
            .set_no_tls_verify(true);
    } else if let Some(path) = &settings.trust_store {
        let pem = fs::read(path)
            .map_err(|err| format!("failed to read trust store {}: {err}", path.display()))?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|err| format!("invalid trust store certificate: {err}"))?;
        let connector = TlsConnector::builder()
            .add_root_certificate(certificate)
            .build()
            .map_err(|err| format!("failed to load trust store certificate: {err}"))?;
        ldap_settings = ldap_settings.set_connector(connector);
    }

    Ok(ldap_settings)
}

/// Sorts a connection failure into unreachable host, TLS failure, timeout or bad endpoint.
fn classify_connect_error(endpoint: &str, err: LdapError) -> ConnectError {
    match err {
        LdapError::NativeTLS { .. } => ConnectError::TlsHandshake {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        },
        LdapError::Timeout { .. } => ConnectError::Timeout {
            endpoint: endpoint.to_string(),
        },
        LdapError::UrlParsing { .. } | LdapError::UnknownScheme(_) => {
            ConnectError::InvalidEndpoint(err.to_string())
        }
        other => ConnectError::Unreachable {
            endpoint: endpoint.to_string(),
            message: other.to_string(),
        },
    }
}

fn map_ldap_error(err: LdapError) -> Error {
    Error::Protocol(err.to_string())
}
