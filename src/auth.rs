// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Digest and Basic authentication, RFC 2617-style (§4.2).

use md5::{Digest, Md5};
use rand::RngCore;

use crate::header::names;
use crate::header::Header;
use crate::message::{Method, Request, Response};

/// Credentials supplied by the caller (client) or checked against by the
/// caller (server).
#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

fn hex_md5(input: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

/// One `WWW-Authenticate` challenge, parsed enough to act on: which scheme,
/// and (for Digest) the realm/nonce the server wants echoed back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Challenge {
    Basic { realm: String },
    Digest { realm: String, nonce: String },
}

fn quoted_param<'a>(s: &'a str, key: &str) -> Option<&'a str> {
    // Scans `key="value"` (or `key=value`) pairs in a comma-separated
    // challenge/credentials string. Good enough for the servers and
    // clients this crate talks to; doesn't attempt full RFC 2616 quoted
    // string escaping.
    let mut rest = s;
    loop {
        let idx = rest.find(key)?;
        rest = &rest[idx + key.len()..];
        let rest_trim = rest.trim_start();
        if let Some(stripped) = rest_trim.strip_prefix('=') {
            let stripped = stripped.trim_start();
            if let Some(stripped) = stripped.strip_prefix('"') {
                let end = stripped.find('"')?;
                return Some(&stripped[..end]);
            }
            let end = stripped.find(',').unwrap_or(stripped.len());
            return Some(stripped[..end].trim_end());
        }
    }
}

impl Challenge {
    /// Parses a single `WWW-Authenticate` header value.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Some(rest) = value.strip_prefix("Digest ") {
            let realm = quoted_param(rest, "realm")?.to_string();
            let nonce = quoted_param(rest, "nonce")?.to_string();
            Some(Challenge::Digest { realm, nonce })
        } else if let Some(rest) = value.strip_prefix("Basic ") {
            let realm = quoted_param(rest, "realm").unwrap_or_default().to_string();
            Some(Challenge::Basic { realm })
        } else {
            None
        }
    }

    /// Parses every `WWW-Authenticate` value on a 401 response, preferring
    /// Digest if both are offered (§4.2 client-side rule).
    pub fn prefer_from_response(resp: &Response) -> Option<Self> {
        let mut basic = None;
        for v in resp.header.get_all(names::WWW_AUTHENTICATE) {
            match Challenge::parse(v) {
                Some(c @ Challenge::Digest { .. }) => return Some(c),
                Some(c @ Challenge::Basic { .. }) => basic = Some(c),
                None => {}
            }
        }
        basic
    }
}

/// Builds the set of `WWW-Authenticate` challenges a server should send on
/// an unauthenticated request, one header value per configured scheme
/// (§4.2 server-side rule). `nonce` should be generated once per
/// session-auth context and reused across retries.
pub fn www_authenticate_headers(realm: &str, nonce: &str, basic: bool, digest: bool) -> Vec<String> {
    let mut values = Vec::new();
    if basic {
        values.push(format!("Basic realm=\"{}\"", realm));
    }
    if digest {
        values.push(format!("Digest realm=\"{}\", nonce=\"{}\"", realm, nonce));
    }
    values
}

/// Generates a fresh 16-random-byte hex nonce, as used once per
/// session-auth context (§4.2).
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Client-side: given a bound challenge, credentials, method, and URI,
/// computes the `Authorization` header value for a request (§4.2, §8.9).
pub fn authorization_header(
    challenge: &Challenge,
    creds: &Credentials,
    method: Method,
    uri: &str,
) -> String {
    match challenge {
        Challenge::Basic { .. } => {
            let raw = format!("{}:{}", creds.username, creds.password);
            format!("Basic {}", base64::encode(raw))
        }
        Challenge::Digest { realm, nonce } => {
            let ha1 = hex_md5(format!("{}:{}:{}", creds.username, realm, creds.password).as_bytes());
            let ha2 = hex_md5(format!("{}:{}", method.as_str(), uri).as_bytes());
            let response = hex_md5(format!("{}:{}:{}", ha1, nonce, ha2).as_bytes());
            format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                creds.username, realm, nonce, uri, response
            )
        }
    }
}

/// Client-side helper: attach `Authorization` to `req`, given the most
/// recently bound challenge and credentials.
pub fn authorize_request(req: &mut Request, challenge: &Challenge, creds: &Credentials) {
    let uri = req.url.clone_without_credentials().to_string();
    let value = authorization_header(challenge, creds, req.method, &uri);
    req.header.set(names::AUTHORIZATION, value);
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DigestCredentials<'a> {
    username: &'a str,
    realm: &'a str,
    nonce: &'a str,
    uri: &'a str,
    response: &'a str,
}

fn parse_digest_credentials(value: &str) -> Option<DigestCredentials<'_>> {
    let rest = value.trim().strip_prefix("Digest ")?;
    Some(DigestCredentials {
        username: quoted_param(rest, "username")?,
        realm: quoted_param(rest, "realm")?,
        nonce: quoted_param(rest, "nonce")?,
        uri: quoted_param(rest, "uri")?,
        response: quoted_param(rest, "response")?,
    })
}

/// The outcome of a server-side validate pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateResult {
    Ok,
    MissingAuthorization,
    Invalid,
}

/// Server-side: validates a request's `Authorization` header against
/// `creds`/`realm`/`nonce` (§4.2). Exactly one `Authorization` header is
/// required. For Digest, a URI mismatch is retried against only the URL's
/// first path segment (a known VLC workaround).
pub fn validate(req: &Request, creds: &Credentials, realm: &str, nonce: &str) -> ValidateResult {
    let mut values = req.header.get_all(names::AUTHORIZATION);
    let value = match (values.next(), values.next()) {
        (Some(v), None) => v,
        _ => return ValidateResult::MissingAuthorization,
    };
    let value = value.trim();
    if let Some(b64) = value.strip_prefix("Basic ") {
        let decoded = match base64::decode(b64.trim()) {
            Ok(d) => d,
            Err(_) => return ValidateResult::Invalid,
        };
        let decoded = match String::from_utf8(decoded) {
            Ok(s) => s,
            Err(_) => return ValidateResult::Invalid,
        };
        return if decoded == format!("{}:{}", creds.username, creds.password) {
            ValidateResult::Ok
        } else {
            ValidateResult::Invalid
        };
    }

    let dc = match parse_digest_credentials(value) {
        Some(dc) => dc,
        None => return ValidateResult::Invalid,
    };
    if dc.username != creds.username || dc.realm != realm || dc.nonce != nonce {
        return ValidateResult::Invalid;
    }
    let ha1 = hex_md5(format!("{}:{}:{}", creds.username, realm, creds.password).as_bytes());
    let expected_for = |uri: &str| -> String {
        let ha2 = hex_md5(format!("{}:{}", req.method.as_str(), uri).as_bytes());
        hex_md5(format!("{}:{}:{}", ha1, nonce, ha2).as_bytes())
    };
    if expected_for(dc.uri) == dc.response {
        return ValidateResult::Ok;
    }
    // VLC sometimes signs only the first path segment rather than the
    // full request URI; retry against that before giving up.
    let first_segment = dc.uri.splitn(2, '?').next().unwrap_or(dc.uri);
    let first_segment = first_segment
        .trim_start_matches('/')
        .split('/')
        .next()
        .map(|s| format!("/{}", s))
        .unwrap_or_else(|| dc.uri.to_string());
    if expected_for(&first_segment) == dc.response {
        return ValidateResult::Ok;
    }
    ValidateResult::Invalid
}

/// Convenience: appends the full set of `WWW-Authenticate` values onto a
/// 401 response's header.
pub fn set_www_authenticate(header: &mut Header, realm: &str, nonce: &str, basic: bool, digest: bool) {
    for v in www_authenticate_headers(realm, nonce, basic, digest) {
        header.append(names::WWW_AUTHENTICATE, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::RtspUrl;

    #[test]
    fn digest_authorization_matches_known_vector() {
        let creds = Credentials {
            username: "myuser".to_string(),
            password: "mypass".to_string(),
        };
        let challenge = Challenge::Digest {
            realm: "IPCAM".to_string(),
            nonce: "0123456789abcdef".to_string(),
        };
        let uri = "rtsp://camera/stream1";
        let got = authorization_header(&challenge, &creds, Method::Describe, uri);

        let ha1 = hex_md5(b"myuser:IPCAM:mypass");
        let ha2 = hex_md5(format!("DESCRIBE:{}", uri).as_bytes());
        let expected_response = hex_md5(format!("{}:0123456789abcdef:{}", ha1, ha2).as_bytes());
        let expected = format!(
            "Digest username=\"myuser\", realm=\"IPCAM\", nonce=\"0123456789abcdef\", uri=\"{}\", response=\"{}\"",
            uri, expected_response
        );
        assert_eq!(got, expected);
    }

    #[test]
    fn server_validates_matching_digest_response() {
        let creds = Credentials {
            username: "myuser".to_string(),
            password: "mypass".to_string(),
        };
        let challenge = Challenge::Digest {
            realm: "IPCAM".to_string(),
            nonce: "fixednonce".to_string(),
        };
        let url = RtspUrl::parse("rtsp://camera/stream1").unwrap();
        let mut req = Request::new(Method::Describe, url);
        let uri = req.url.clone_without_credentials().to_string();
        req.header.set(
            names::AUTHORIZATION,
            authorization_header(&challenge, &creds, Method::Describe, &uri),
        );
        assert_eq!(
            validate(&req, &creds, "IPCAM", "fixednonce"),
            ValidateResult::Ok
        );
    }

    #[test]
    fn server_rejects_wrong_password() {
        let creds = Credentials {
            username: "myuser".to_string(),
            password: "mypass".to_string(),
        };
        let wrong = Credentials {
            username: "myuser".to_string(),
            password: "wrong".to_string(),
        };
        let challenge = Challenge::Digest {
            realm: "IPCAM".to_string(),
            nonce: "fixednonce".to_string(),
        };
        let url = RtspUrl::parse("rtsp://camera/stream1").unwrap();
        let mut req = Request::new(Method::Describe, url);
        let uri = req.url.clone_without_credentials().to_string();
        req.header.set(
            names::AUTHORIZATION,
            authorization_header(&challenge, &wrong, Method::Describe, &uri),
        );
        assert_eq!(
            validate(&req, &creds, "IPCAM", "fixednonce"),
            ValidateResult::Invalid
        );
    }

    #[test]
    fn prefers_digest_over_basic() {
        let mut resp = Response::new(401);
        resp.header.append(names::WWW_AUTHENTICATE, "Basic realm=\"x\"");
        resp.header
            .append(names::WWW_AUTHENTICATE, "Digest realm=\"x\", nonce=\"y\"");
        assert_eq!(
            Challenge::prefer_from_response(&resp),
            Some(Challenge::Digest {
                realm: "x".to_string(),
                nonce: "y".to_string()
            })
        );
    }
}
