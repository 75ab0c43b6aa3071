//! Directory session state machine.
//!
//! A [`DirectoryConnection`] drives one logical connect → bind → search/compare → close sequence.
//! The wire protocol sits behind the [`LdapConnector`], [`LdapSession`] and [`EntryStream`]
//! traits so the state machine can run against `ldap3`, the in-memory directory, or mocks.

use async_trait::async_trait;
use dirbridge_core::{BindError, ConnectError, Error, Result};
use ldap3::Scope;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::debug;

use crate::config::DirectoryEndpoint;
use crate::entry::DirectoryEntry;

/// Represents the search scope for LDAP queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// Base object only.
    Base,
    /// One level below the base.
    OneLevel,
    /// Entire subtree.
    Subtree,
}

impl From<SearchScope> for Scope {
    fn from(scope: SearchScope) -> Self {
        match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::OneLevel => Scope::OneLevel,
            SearchScope::Subtree => Scope::Subtree,
        }
    }
}

/// Parameters of one search operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Search base.
    pub base_dn: String,
    /// Search scope.
    pub scope: SearchScope,
    /// RFC 4515 filter.
    pub filter: String,
    /// Attributes to return; empty requests all user attributes.
    pub attributes: Vec<String>,
    /// Server-side and local time limit.
    pub time_limit: Duration,
}

impl SearchRequest {
    /// Creates a request returning all attributes with a one second time limit.
    #[must_use]
    pub fn new(base_dn: impl Into<String>, scope: SearchScope, filter: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope,
            filter: filter.into(),
            attributes: Vec::new(),
            time_limit: Duration::from_secs(1),
        }
    }

    /// Restricts the returned attributes.
    #[must_use]
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the time limit.
    #[must_use]
    pub const fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }
}

/// Entries produced by an in-flight search.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntryStream: Send {
    /// Next entry, or `None` when the server reports the search done.
    async fn next_entry(&mut self) -> Result<Option<DirectoryEntry>>;

    /// Abandons the operation on the server. Never fails observably.
    async fn abandon(&mut self);
}

/// An established transport to a directory server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LdapSession: Send {
    /// Simple bind; an empty DN binds anonymously.
    async fn simple_bind(&mut self, dn: &str, password: &str) -> std::result::Result<(), BindError>;

    /// Starts a search.
    async fn search(&mut self, request: &SearchRequest) -> Result<Box<dyn EntryStream>>;

    /// Compares an attribute value.
    async fn compare(&mut self, dn: &str, attribute: &str, value: &str) -> Result<bool>;

    /// Sends an unbind and tears the transport down.
    async fn unbind(&mut self) -> Result<()>;
}

/// Opens sessions to directory endpoints.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LdapConnector: Send + Sync {
    /// Establishes a transport (including TLS) to `endpoint`.
    async fn connect(
        &self,
        endpoint: &DirectoryEndpoint,
    ) -> std::result::Result<Box<dyn LdapSession>, ConnectError>;
}

/// Lifecycle state of a [`DirectoryConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport.
    Disconnected,
    /// Transport established, not authenticated.
    Connected,
    /// Transport established and bound.
    Bound,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Bound => "bound",
        })
    }
}

/// One session with a directory server.
pub struct DirectoryConnection {
    connector: Arc<dyn LdapConnector>,
    session: Option<Box<dyn LdapSession>>,
    state: ConnectionState,
    endpoint: Option<String>,
    operation_timeout: Duration,
}

impl DirectoryConnection {
    /// Creates a disconnected connection.
    ///
    /// `operation_timeout` bounds connect, bind, compare and unbind.
    #[must_use]
    pub fn new(connector: Arc<dyn LdapConnector>, operation_timeout: Duration) -> Self {
        Self {
            connector,
            session: None,
            state: ConnectionState::Disconnected,
            endpoint: None,
            operation_timeout,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Signature of the connected endpoint.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Establishes the transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless disconnected, or [`Error::Connect`] on failure.
    pub async fn connect(&mut self, endpoint: &DirectoryEndpoint) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(self.invalid("connect"));
        }

        let signature = endpoint.signature();
        debug!(endpoint = %signature, tls = endpoint.use_tls(), "connecting to directory");
        let session = timeout(self.operation_timeout, self.connector.connect(endpoint))
            .await
            .map_err(|_| ConnectError::Timeout {
                endpoint: signature.clone(),
            })??;

        self.session = Some(session);
        self.state = ConnectionState::Connected;
        self.endpoint = Some(signature);
        Ok(())
    }

    /// Authenticates the connection. Re-binding a bound connection is allowed.
    ///
    /// A failed bind leaves the connection connected but unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] when disconnected, or [`Error::Bind`] on failure.
    pub async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let operation_timeout = self.operation_timeout;
        let session = self.session_for("bind")?;

        debug!(dn, anonymous = dn.is_empty(), "binding");
        let outcome = timeout(operation_timeout, session.simple_bind(dn, password))
            .await
            .unwrap_or(Err(BindError::Timeout));

        match outcome {
            Ok(()) => {
                self.state = ConnectionState::Bound;
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Connected;
                Err(err.into())
            }
        }
    }

    /// Connects and binds with the endpoint's credentials.
    ///
    /// The connection is closed again if the bind fails.
    ///
    /// # Errors
    ///
    /// Returns the connect or bind error.
    pub async fn open(&mut self, endpoint: &DirectoryEndpoint) -> Result<()> {
        self.connect(endpoint).await?;
        if let Err(err) = self.bind(endpoint.bind_dn(), endpoint.bind_password()).await {
            self.close().await;
            return Err(err);
        }
        Ok(())
    }

    /// Starts a search; entries are pulled lazily from the returned [`SearchResults`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] when disconnected, [`Error::SearchTimeout`] if the
    /// server does not accept the request in time, or the transport error.
    pub async fn search(&mut self, request: SearchRequest) -> Result<SearchResults<'_>> {
        let session = self.session_for("search")?;

        debug!(base = %request.base_dn, filter = %request.filter, scope = ?request.scope, "searching");
        let deadline = Instant::now() + request.time_limit;
        let stream = timeout_at(deadline, session.search(&request))
            .await
            .map_err(|_| Error::SearchTimeout(request.base_dn.clone()))??;

        Ok(SearchResults {
            stream: Some(stream),
            deadline,
            base_dn: request.base_dn,
            _connection: PhantomData,
        })
    }

    /// Compares `attribute` of `dn` with `value`.
    ///
    /// Missing entries and missing attributes compare as `false`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] when disconnected or a protocol error.
    pub async fn compare(&mut self, dn: &str, attribute: &str, value: &str) -> Result<bool> {
        let operation_timeout = self.operation_timeout;
        let session = self.session_for("compare")?;

        timeout(operation_timeout, session.compare(dn, attribute, value))
            .await
            .map_err(|_| Error::Protocol(format!("compare on `{dn}` timed out")))?
    }

    /// Unbinds and drops the transport. Idempotent; failures are only logged.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            match timeout(self.operation_timeout, session.unbind()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(error = %err, "unbind failed"),
                Err(_) => debug!("unbind timed out"),
            }
        }
        if let Some(endpoint) = self.endpoint.take() {
            debug!(endpoint = %endpoint, "directory connection closed");
        }
        self.state = ConnectionState::Disconnected;
    }

    fn session_for(&mut self, operation: &'static str) -> Result<&mut Box<dyn LdapSession>> {
        let state = self.state;
        match (state, self.session.as_mut()) {
            (ConnectionState::Connected | ConnectionState::Bound, Some(session)) => Ok(session),
            _ => Err(Error::InvalidState {
                operation,
                state: state.to_string(),
            }),
        }
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }
}

impl Drop for DirectoryConnection {
    fn drop(&mut self) {
        if self.session.is_some() {
            debug!(
                endpoint = self.endpoint.as_deref().unwrap_or_default(),
                "dropping open directory connection"
            );
        }
    }
}

impl fmt::Debug for DirectoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryConnection")
            .field("state", &self.state)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Lazy, finite, non-restartable sequence of search results.
///
/// Borrows its connection for as long as the search is in flight. Once exhausted, failed or
/// timed out it yields `Ok(None)`.
pub struct SearchResults<'c> {
    stream: Option<Box<dyn EntryStream>>,
    deadline: Instant,
    base_dn: String,
    _connection: PhantomData<&'c mut DirectoryConnection>,
}

impl SearchResults<'_> {
    /// Next entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SearchTimeout`] once the time limit passes (the search is abandoned),
    /// or the transport error.
    pub async fn next(&mut self) -> Result<Option<DirectoryEntry>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let outcome = timeout_at(self.deadline, stream.next_entry()).await;
        match outcome {
            Ok(Ok(Some(entry))) => Ok(Some(entry)),
            Ok(Ok(None)) => {
                self.stream = None;
                Ok(None)
            }
            Ok(Err(err)) => {
                self.stream = None;
                Err(err)
            }
            Err(_) => {
                debug!(base = %self.base_dn, "search time limit exceeded, abandoning");
                self.abandon().await;
                Err(Error::SearchTimeout(self.base_dn.clone()))
            }
        }
    }

    /// Drains the remaining entries.
    ///
    /// # Errors
    ///
    /// Propagates the first error from [`SearchResults::next`].
    pub async fn collect(mut self) -> Result<Vec<DirectoryEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Abandons the search if it is still running.
    pub async fn finish(mut self) {
        self.abandon().await;
    }

    async fn abandon(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.abandon().await;
        }
    }
}
