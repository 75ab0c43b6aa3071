//! Distinguished name parsing and normalisation.
//!
//! Membership indexes and the resolver's visited set key entries by the normalised form so that
//! `UID=Bob, OU=People` and `uid=bob,ou=people` identify the same entry.

use std::fmt;
use std::iter::Peekable;
use std::str::{CharIndices, FromStr};
use thiserror::Error;

/// Syntax errors in a distinguished name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnError {
    /// Nothing but whitespace.
    #[error("distinguished name is empty")]
    Empty,
    /// Two separators with nothing between them, or a trailing separator.
    #[error("distinguished name has an empty component")]
    EmptyComponent,
    /// A component without `=`.
    #[error("`{0}` is not an attribute=value pair")]
    MissingSeparator(String),
    /// Nothing left of `=`.
    #[error("distinguished name component has no attribute type")]
    EmptyAttribute,
    /// Attribute type with characters outside letters, digits, `-` and `.`.
    #[error("`{0}` is not a valid attribute type")]
    IllegalAttribute(String),
    /// Nothing right of `=`.
    #[error("attribute `{0}` has no value")]
    EmptyValue(String),
    /// Backslash at the end of the input.
    #[error("distinguished name ends inside an escape sequence")]
    DanglingEscape,
    /// Hex escapes that do not form UTF-8.
    #[error("value of `{0}` contains an invalid hex escape")]
    InvalidHexEscape(String),
}

/// One `attribute=value` assertion of a DN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rdn {
    attribute: String,
    value: String,
}

impl Rdn {
    /// Attribute type as written (e.g. `cn`).
    #[must_use]
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Unescaped value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    fn matches(&self, attribute: &str, value: &str) -> bool {
        self.attribute.eq_ignore_ascii_case(attribute)
            && self.value.to_lowercase() == value.to_lowercase()
    }
}

/// Parsed distinguished name.
///
/// Keeps the trimmed input for display; equality compares [`DistinguishedName::normalized`].
#[derive(Debug, Clone)]
pub struct DistinguishedName {
    text: String,
    rdns: Vec<Vec<Rdn>>,
}

impl DistinguishedName {
    /// Parses an RFC 4514 string. `\,` and `\2C` style escapes are both accepted.
    ///
    /// # Errors
    ///
    /// Returns the [`DnError`] describing the first syntax problem.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, DnError> {
        let text = input.as_ref().trim();
        if text.is_empty() {
            return Err(DnError::Empty);
        }

        let mut scanner = Scanner {
            text,
            chars: text.char_indices().peekable(),
        };
        let mut rdns = Vec::new();
        let mut multi = Vec::new();
        loop {
            let (rdn, terminator) = scanner.assertion()?;
            multi.push(rdn);
            if terminator != Some('+') {
                rdns.push(std::mem::take(&mut multi));
            }
            if terminator.is_none() {
                break;
            }
        }

        Ok(Self {
            text: text.to_string(),
            rdns,
        })
    }

    /// Returns true if `input` parses as a DN.
    #[must_use]
    pub fn is_valid(input: &str) -> bool {
        Self::parse(input).is_ok()
    }

    /// The trimmed input.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Every assertion, leftmost RDN first.
    pub fn components(&self) -> impl Iterator<Item = &Rdn> + '_ {
        self.rdns.iter().flatten()
    }

    /// First value of `attribute`, compared case-insensitively.
    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&str> {
        self.components()
            .find(|rdn| rdn.attribute.eq_ignore_ascii_case(attribute))
            .map(Rdn::value)
    }

    /// Returns true if the leftmost RDN asserts `attribute=value`, ignoring case.
    #[must_use]
    pub fn leads_with(&self, attribute: &str, value: &str) -> bool {
        self.rdns
            .first()
            .is_some_and(|multi| multi.iter().any(|rdn| rdn.matches(attribute, value)))
    }

    /// Lower-cased form without insignificant whitespace; multi-valued RDNs are sorted.
    #[must_use]
    pub fn normalized(&self) -> String {
        let mut out = String::with_capacity(self.text.len());
        for (idx, multi) in self.rdns.iter().enumerate() {
            if idx > 0 {
                out.push(',');
            }
            let mut assertions: Vec<String> = multi
                .iter()
                .map(|rdn| {
                    let mut assertion = rdn.attribute.to_ascii_lowercase();
                    assertion.push('=');
                    push_escaped(&mut assertion, &rdn.value.to_lowercase());
                    assertion
                })
                .collect();
            assertions.sort_unstable();
            out.push_str(&assertions.join("+"));
        }
        out
    }
}

impl PartialEq for DistinguishedName {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for DistinguishedName {}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for DistinguishedName {
    type Err = DnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Normalisation key for a DN-like string.
///
/// Input that does not parse is keyed by its trimmed lower-case text.
#[must_use]
pub fn normalize_dn(input: &str) -> String {
    DistinguishedName::parse(input).map_or_else(
        |_| input.trim().to_lowercase(),
        |dn| dn.normalized(),
    )
}

struct Scanner<'a> {
    text: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl Scanner<'_> {
    /// Reads one `attribute=value` and the separator that ended it (`,`, `+`, or end of input).
    fn assertion(&mut self) -> Result<(Rdn, Option<char>), DnError> {
        let start = self.chars.peek().map_or(self.text.len(), |(idx, _)| *idx);
        let equals = loop {
            match self.chars.next() {
                Some((idx, '=')) => break idx,
                Some((idx, ',' | '+')) => return Err(incomplete(&self.text[start..idx])),
                None => return Err(incomplete(&self.text[start..])),
                Some(_) => {}
            }
        };

        let attribute = self.text[start..equals].trim();
        if attribute.is_empty() {
            return Err(DnError::EmptyAttribute);
        }
        if !attribute
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(DnError::IllegalAttribute(attribute.to_string()));
        }

        let mut bytes = Vec::new();
        // Trailing spaces after this length were escaped and are significant.
        let mut protected = 0;
        let mut terminator = None;
        while let Some((_, ch)) = self.chars.next() {
            match ch {
                ',' | '+' => {
                    terminator = Some(ch);
                    break;
                }
                '\\' => {
                    self.unescape_into(&mut bytes)?;
                    protected = bytes.len();
                }
                ' ' if bytes.is_empty() => {}
                _ => push_char(&mut bytes, ch),
            }
        }
        while bytes.len() > protected && bytes.last() == Some(&b' ') {
            bytes.pop();
        }
        if bytes.is_empty() {
            return Err(DnError::EmptyValue(attribute.to_string()));
        }

        let value = String::from_utf8(bytes)
            .map_err(|_| DnError::InvalidHexEscape(attribute.to_string()))?;
        Ok((
            Rdn {
                attribute: attribute.to_string(),
                value,
            },
            terminator,
        ))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn unescape_into(&mut self, bytes: &mut Vec<u8>) -> Result<(), DnError> {
        let (_, first) = self.chars.next().ok_or(DnError::DanglingEscape)?;
        if let Some(high) = first.to_digit(16) {
            if let Some(low) = self.chars.peek().and_then(|(_, c)| c.to_digit(16)) {
                self.chars.next();
                bytes.push(((high << 4) | low) as u8);
                return Ok(());
            }
        }
        push_char(bytes, first);
        Ok(())
    }
}

fn incomplete(fragment: &str) -> DnError {
    let fragment = fragment.trim();
    if fragment.is_empty() {
        DnError::EmptyComponent
    } else {
        DnError::MissingSeparator(fragment.to_string())
    }
}

fn push_char(bytes: &mut Vec<u8>, ch: char) {
    let mut buf = [0; 4];
    bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
}

/// Escapes a value for use as an RDN attribute value (RFC 4514).
#[must_use]
pub fn escape_dn_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    push_escaped(&mut out, value);
    out
}

fn push_escaped(out: &mut String, value: &str) {
    let last = value.chars().count().saturating_sub(1);
    for (idx, ch) in value.chars().enumerate() {
        let special = matches!(ch, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=')
            || (idx == 0 && matches!(ch, ' ' | '#'))
            || (idx == last && ch == ' ');
        if special {
            out.push('\\');
        }
        out.push(ch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_components() {
        let dn = DistinguishedName::parse("uid=alice,ou=People,dc=example,dc=org").unwrap();
        assert_eq!(dn.get("UID"), Some("alice"));
        assert_eq!(dn.get("dc"), Some("example"));
        assert_eq!(dn.components().count(), 4);
        assert_eq!(dn.to_string(), "uid=alice,ou=People,dc=example,dc=org");
    }

    #[test]
    fn escapes_survive_normalisation() {
        let dn = DistinguishedName::parse(r"cn=Liddell\, Alice,ou=People").unwrap();
        assert_eq!(dn.get("cn"), Some("Liddell, Alice"));
        assert_eq!(dn.normalized(), r"cn=liddell\, alice,ou=people");

        let hex: DistinguishedName = r"cn=Liddell\2C Alice, ou=People".parse().unwrap();
        assert_eq!(dn, hex);
    }

    #[test]
    fn hex_escapes_decode_utf8() {
        let dn = DistinguishedName::parse(r"cn=Zo\C3\AB,dc=example").unwrap();
        assert_eq!(dn.get("cn"), Some("Zoë"));
        assert_eq!(
            DistinguishedName::parse(r"cn=\C3,dc=example").unwrap_err(),
            DnError::InvalidHexEscape("cn".to_string())
        );
    }

    #[test]
    fn escaped_trailing_space_is_kept() {
        let dn = DistinguishedName::parse(r"cn=padded\ ,dc=example").unwrap();
        assert_eq!(dn.get("cn"), Some("padded "));
        assert_eq!(dn.normalized(), r"cn=padded\ ,dc=example");
    }

    #[test]
    fn normalisation_ignores_case_and_spacing() {
        let a = DistinguishedName::parse("UID=Alice , OU=People").unwrap();
        let b = DistinguishedName::parse("uid=alice,ou=people").unwrap();
        assert_eq!(a, b);
        assert_eq!(normalize_dn("  CN=Eng,  OU=Groups "), "cn=eng,ou=groups");
    }

    #[test]
    fn multi_valued_rdns() {
        let a = DistinguishedName::parse("cn=Alice+uid=7,ou=People").unwrap();
        let b = DistinguishedName::parse("uid=7 + cn=Alice,ou=People").unwrap();
        assert_eq!(a, b);
        assert!(a.leads_with("UID", "7"));
        assert!(!a.leads_with("ou", "People"));
    }

    #[test]
    fn escapes_rdn_values() {
        assert_eq!(escape_dn_value("jdoe"), "jdoe");
        assert_eq!(escape_dn_value("a,b+c=d"), r"a\,b\+c\=d");
        assert_eq!(escape_dn_value("#admin "), r"\#admin\ ");
        assert_eq!(escape_dn_value(r#"x"<y>;\"#), r#"x\"\<y\>\;\\"#);

        let dn = format!("uid={},ou=People", escape_dn_value("Liddell, Alice"));
        let parsed = DistinguishedName::parse(&dn).unwrap();
        assert_eq!(parsed.get("uid"), Some("Liddell, Alice"));
        assert_eq!(parsed.components().count(), 2);
    }

    #[test]
    fn leads_with_matches_whole_value() {
        let dn = DistinguishedName::parse("uid=bobby,ou=People").unwrap();
        assert!(dn.leads_with("uid", "BOBBY"));
        assert!(!dn.leads_with("uid", "bob"));
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(DistinguishedName::parse(" \t").unwrap_err(), DnError::Empty);
        assert_eq!(
            DistinguishedName::parse("cn=Eng,").unwrap_err(),
            DnError::EmptyComponent
        );
        assert_eq!(
            DistinguishedName::parse("cn=Eng,,dc=example").unwrap_err(),
            DnError::EmptyComponent
        );
        assert_eq!(
            DistinguishedName::parse("cn= ").unwrap_err(),
            DnError::EmptyValue("cn".to_string())
        );
        assert_eq!(
            DistinguishedName::parse("=Eng").unwrap_err(),
            DnError::EmptyAttribute
        );
        assert_eq!(
            DistinguishedName::parse(r"cn=Eng\").unwrap_err(),
            DnError::DanglingEscape
        );
        assert_eq!(
            DistinguishedName::parse("(uid=bob)").unwrap_err(),
            DnError::IllegalAttribute("(uid".to_string())
        );
        assert_eq!(
            DistinguishedName::parse("bob").unwrap_err(),
            DnError::MissingSeparator("bob".to_string())
        );
        assert!(!DistinguishedName::is_valid("Alice Liddell"));
    }

    #[test]
    fn unparseable_input_normalises_to_lowercase() {
        assert_eq!(normalize_dn("  Not A DN "), "not a dn");
    }
}
