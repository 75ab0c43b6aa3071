//! In-memory directory implementing the connector traits.
//!
//! Useful for host applications' tests and for exercising resolution without a server. Supports
//! simple binds against stored passwords, base/one-level/subtree searches with equality,
//! presence, substring, `&`, `|` and `!` filters, and compares.

use async_trait::async_trait;
use dirbridge_core::{BindError, ConnectError, Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::DirectoryEndpoint;
use crate::connection::{EntryStream, LdapConnector, LdapSession, SearchRequest, SearchScope};
use crate::dn::normalize_dn;
use crate::entry::DirectoryEntry;

#[derive(Default)]
struct Inner {
    entries: RwLock<BTreeMap<String, DirectoryEntry>>,
    passwords: RwLock<HashMap<String, String>>,
    unreachable: AtomicBool,
    connections: AtomicUsize,
    searches: AtomicUsize,
}

/// Shared in-memory directory. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    inner: Arc<Inner>,
}

impl InMemoryDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `entry` (builder form).
    #[must_use]
    pub fn with_entry(self, entry: DirectoryEntry) -> Self {
        self.insert(entry);
        self
    }

    /// Sets the bind password of `dn` (builder form).
    #[must_use]
    pub fn with_password(self, dn: &str, password: &str) -> Self {
        self.set_password(dn, password);
        self
    }

    /// Adds or replaces an entry.
    pub fn insert(&self, entry: DirectoryEntry) {
        self.inner
            .entries
            .write()
            .insert(normalize_dn(&entry.dn), entry);
    }

    /// Removes an entry. Returns true if it existed.
    pub fn remove(&self, dn: &str) -> bool {
        self.inner.entries.write().remove(&normalize_dn(dn)).is_some()
    }

    /// Sets the bind password of `dn`.
    pub fn set_password(&self, dn: &str, password: &str) {
        self.inner
            .passwords
            .write()
            .insert(normalize_dn(dn), password.to_string());
    }

    /// Simulates an outage: new connections fail and open sessions stop answering.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of connections opened so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Number of searches performed so far.
    #[must_use]
    pub fn search_count(&self) -> usize {
        self.inner.searches.load(Ordering::SeqCst)
    }

    fn is_unreachable(&self) -> bool {
        self.inner.unreachable.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LdapConnector for InMemoryDirectory {
    async fn connect(
        &self,
        endpoint: &DirectoryEndpoint,
    ) -> std::result::Result<Box<dyn LdapSession>, ConnectError> {
        if self.is_unreachable() {
            return Err(ConnectError::Unreachable {
                endpoint: endpoint.signature(),
                message: "directory is offline".to_string(),
            });
        }
        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            directory: self.clone(),
            endpoint: endpoint.signature(),
        }))
    }
}

struct MemorySession {
    directory: InMemoryDirectory,
    endpoint: String,
}

impl MemorySession {
    fn ensure_reachable(&self) -> Result<()> {
        if self.directory.is_unreachable() {
            return Err(ConnectError::Unreachable {
                endpoint: self.endpoint.clone(),
                message: "connection reset".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl LdapSession for MemorySession {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> std::result::Result<(), BindError> {
        if self.directory.is_unreachable() {
            return Err(BindError::Transport("connection reset".to_string()));
        }
        if dn.is_empty() {
            return Ok(());
        }
        let passwords = self.directory.inner.passwords.read();
        match passwords.get(&normalize_dn(dn)) {
            Some(stored) if !password.is_empty() && stored == password => Ok(()),
            _ => Err(BindError::InvalidCredentials { dn: dn.to_string() }),
        }
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<Box<dyn EntryStream>> {
        self.ensure_reachable()?;
        self.directory.inner.searches.fetch_add(1, Ordering::SeqCst);

        let filter = Filter::parse(&request.filter)
            .ok_or_else(|| Error::Protocol(format!("invalid search filter `{}`", request.filter)))?;
        let base = normalize_dn(&request.base_dn);

        let entries = self.directory.inner.entries.read();
        let matched = entries
            .iter()
            .filter(|(key, _)| in_scope(key, &base, request.scope))
            .filter(|(_, entry)| filter.matches(entry))
            .map(|(_, entry)| project(entry, &request.attributes))
            .collect();

        Ok(Box::new(MemoryStream { entries: matched }))
    }

    async fn compare(&mut self, dn: &str, attribute: &str, value: &str) -> Result<bool> {
        self.ensure_reachable()?;
        if attribute.eq_ignore_ascii_case("userPassword") {
            let passwords = self.directory.inner.passwords.read();
            if let Some(stored) = passwords.get(&normalize_dn(dn)) {
                return Ok(stored == value);
            }
        }
        let entries = self.directory.inner.entries.read();
        Ok(entries
            .get(&normalize_dn(dn))
            .is_some_and(|entry| entry.values(attribute).any(|v| v == value)))
    }

    async fn unbind(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MemoryStream {
    entries: VecDeque<DirectoryEntry>,
}

#[async_trait]
impl EntryStream for MemoryStream {
    async fn next_entry(&mut self) -> Result<Option<DirectoryEntry>> {
        Ok(self.entries.pop_front())
    }

    async fn abandon(&mut self) {
        self.entries.clear();
    }
}

fn in_scope(key: &str, base: &str, scope: SearchScope) -> bool {
    if base.is_empty() {
        return match scope {
            SearchScope::Base => false,
            SearchScope::OneLevel => !key.contains(','),
            SearchScope::Subtree => true,
        };
    }
    if key == base {
        return scope != SearchScope::OneLevel;
    }
    let Some(prefix) = key
        .strip_suffix(base)
        .and_then(|rest| rest.strip_suffix(','))
    else {
        return false;
    };
    match scope {
        SearchScope::Base => false,
        SearchScope::OneLevel => !prefix.contains(','),
        SearchScope::Subtree => true,
    }
}

fn project(entry: &DirectoryEntry, attributes: &[String]) -> DirectoryEntry {
    if attributes.is_empty() || attributes.iter().any(|a| a == "*") {
        return entry.clone();
    }
    DirectoryEntry {
        dn: entry.dn.clone(),
        attributes: entry
            .attributes
            .iter()
            .filter(|attr| attributes.iter().any(|a| a.eq_ignore_ascii_case(&attr.name)))
            .cloned()
            .collect(),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equal(String, String),
    Substring(String, Vec<String>),
}

impl Filter {
    fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (filter, end) = Self::parse_at(input, 0)?;
        (end == input.len()).then_some(filter)
    }

    fn parse_at(input: &str, pos: usize) -> Option<(Self, usize)> {
        if !input.get(pos..)?.starts_with('(') {
            return None;
        }
        let body = pos + 1;
        match input.get(body..)?.chars().next()? {
            op @ ('&' | '|') => {
                let mut items = Vec::new();
                let mut cursor = body + 1;
                while input.get(cursor..)?.starts_with('(') {
                    let (item, next) = Self::parse_at(input, cursor)?;
                    items.push(item);
                    cursor = next;
                }
                if !input.get(cursor..)?.starts_with(')') {
                    return None;
                }
                let filter = if op == '&' { Self::And(items) } else { Self::Or(items) };
                Some((filter, cursor + 1))
            }
            '!' => {
                let (item, next) = Self::parse_at(input, body + 1)?;
                if !input.get(next..)?.starts_with(')') {
                    return None;
                }
                Some((Self::Not(Box::new(item)), next + 1))
            }
            _ => {
                // Escapes are hex pairs, so the first `)` closes the item.
                let end = body + input.get(body..)?.find(')')?;
                let (attribute, value) = input[body..end].split_once('=')?;
                let attribute = attribute.trim_end_matches(['~', '<', '>']).trim();
                if attribute.is_empty() {
                    return None;
                }
                let filter = if value == "*" {
                    Self::Present(attribute.to_string())
                } else if value.contains('*') {
                    Self::Substring(attribute.to_string(), value.split('*').map(unescape).collect())
                } else {
                    Self::Equal(attribute.to_string(), unescape(value))
                };
                Some((filter, end + 1))
            }
        }
    }

    fn matches(&self, entry: &DirectoryEntry) -> bool {
        match self {
            Self::And(items) => items.iter().all(|f| f.matches(entry)),
            Self::Or(items) => items.iter().any(|f| f.matches(entry)),
            Self::Not(item) => !item.matches(entry),
            Self::Present(attribute) => {
                attribute.eq_ignore_ascii_case("objectClass") || entry.has(attribute)
            }
            Self::Equal(attribute, value) => {
                entry.values(attribute).any(|v| v.eq_ignore_ascii_case(value))
            }
            Self::Substring(attribute, parts) => entry
                .values(attribute)
                .any(|v| substring_match(&v.to_lowercase(), parts)),
        }
    }
}

fn substring_match(value: &str, parts: &[String]) -> bool {
    let Some((first, rest)) = parts.split_first() else {
        return true;
    };
    let Some(mut remaining) = value.strip_prefix(first.to_lowercase().as_str()) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };
    for part in middle {
        let part = part.to_lowercase();
        match remaining.find(part.as_str()) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last.to_lowercase().as_str())
}

fn unescape(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'\\' {
            if let Some(byte) = value
                .get(idx + 1..idx + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(byte);
                idx += 3;
                continue;
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
