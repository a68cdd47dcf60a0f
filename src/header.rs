// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RTSP header multimap: case-insensitive ASCII names, ordered values,
//! duplicates preserved in submission order (§4.1/§4.4 of the spec).

use std::fmt::{Display, Formatter};

/// A case-insensitive ASCII header name. Compares and hashes by lowercase
/// form but preserves the original casing for serialization, matching the
/// first-seen spelling per RFC 2326's "header field names are case
/// insensitive" rule.
#[derive(Clone, Debug, Eq)]
pub struct HeaderName(String);

impl HeaderName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn eq_key(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl PartialEq for HeaderName {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl std::hash::Hash for HeaderName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.eq_key().hash(state)
    }
}

impl Display for HeaderName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HeaderName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Well-known header names, spelled the way this crate emits them. Lookups
/// against a [`Header`] are always case-insensitive regardless.
pub mod names {
    pub const CSEQ: &str = "CSeq";
    pub const SESSION: &str = "Session";
    pub const TRANSPORT: &str = "Transport";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const CONTENT_BASE: &str = "Content-Base";
    pub const WWW_AUTHENTICATE: &str = "WWW-Authenticate";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const RANGE: &str = "Range";
    pub const RTP_INFO: &str = "RTP-Info";
    pub const PUBLIC: &str = "Public";
    pub const USER_AGENT: &str = "User-Agent";
    pub const ACCEPT: &str = "Accept";
}

/// An ordered multimap from header name to a sequence of values, preserving
/// duplicate occurrences in submission order (the distilled spec's
/// `Header` type).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    // Stored as a flat ordered list so that serialization reproduces
    // exactly the submission order across *different* header names too,
    // which is what the round-trip property test (§8.1) depends on.
    entries: Vec<(HeaderName, String)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `value` under `name`, preserving any existing values for
    /// that name (used when the same header line occurs twice on the
    /// wire).
    pub fn append(&mut self, name: impl Into<HeaderName>, value: impl Into<String>) -> &mut Self {
        self.entries.push((name.into(), value.into()));
        self
    }

    /// Removes all existing values for `name` and sets a single new value.
    pub fn set(&mut self, name: impl Into<HeaderName>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        self.entries.retain(|(n, _)| n != &name);
        self.entries.push((name, value.into()));
        self
    }

    pub fn remove(&mut self, name: &str) {
        let name = HeaderName::from(name);
        self.entries.retain(|(n, _)| n != &name);
    }

    /// The first value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = HeaderName::from(name);
        self.entries
            .iter()
            .find(|(n, _)| n == &name)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in submission order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let name = HeaderName::from(name);
        self.entries
            .iter()
            .filter(move |(n, _)| n == &name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses one `Name: value\r\n`-terminated line (sans the trailing
    /// CRLF) and appends it.
    pub(crate) fn append_line(&mut self, line: &str) -> Result<(), String> {
        let colon = line
            .find(':')
            .ok_or_else(|| format!("header line missing ':': {:?}", line))?;
        let name = line[..colon].trim();
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(format!("invalid header name in line {:?}", line));
        }
        // RFC 2326 requires exactly one space after the colon, but real
        // servers are looser; trim any amount of leading whitespace, same
        // as the rest of this crate's leniency toward non-conformant
        // peers (cf. the interleaved-frame GW Security workaround).
        let value = line[colon + 1..].trim_start();
        self.append(name, value);
        Ok(())
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = Header::new();
        h.append("Content-Length", "4");
        assert_eq!(h.get("content-length"), Some("4"));
        assert_eq!(h.get("CONTENT-LENGTH"), Some("4"));
    }

    #[test]
    fn duplicates_preserved_in_order() {
        let mut h = Header::new();
        h.append("WWW-Authenticate", "Basic realm=\"x\"");
        h.append("WWW-Authenticate", "Digest realm=\"x\", nonce=\"y\"");
        let values: Vec<&str> = h.get_all("www-authenticate").collect();
        assert_eq!(
            values,
            vec!["Basic realm=\"x\"", "Digest realm=\"x\", nonce=\"y\""]
        );
    }

    #[test]
    fn set_replaces_all_prior_values() {
        let mut h = Header::new();
        h.append("CSeq", "1");
        h.append("CSeq", "2");
        h.set("CSeq", "3");
        assert_eq!(h.get_all("cseq").collect::<Vec<_>>(), vec!["3"]);
    }

    #[test]
    fn serializes_in_submission_order() {
        let mut h = Header::new();
        h.append("CSeq", "1");
        h.append("Require", "implicit-play");
        h.append("Proxy-Require", "gzipped-messages");
        assert_eq!(
            h.to_string(),
            "CSeq: 1\r\nRequire: implicit-play\r\nProxy-Require: gzipped-messages\r\n"
        );
    }
}
