//! Header helpers on top of `rsip`
//!
//! `rsip` models the common RFC 3261 headers; the extension headers this crate
//! needs (RSeq, RAck, Session-Expires, Min-SE) arrive as `Header::Other`. The
//! lookups below match on the printed header name so they work for both.
use crate::Result;
use rsip::{prelude::ToTypedHeader, typed, Header, Headers, Param, UriWithParams, UriWithParamsList};
use std::fmt;

pub const HEADER_RSEQ: &str = "RSeq";
pub const HEADER_RACK: &str = "RAck";
pub const HEADER_SESSION_EXPIRES: &str = "Session-Expires";
pub const HEADER_MIN_SE: &str = "Min-SE";

fn split_header(header: &Header) -> Option<(String, String)> {
    let text = header.to_string();
    let (name, value) = text.split_once(':')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

/// All values of the header `name` (case-insensitive), in message order.
pub fn header_values(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .filter_map(split_header)
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
        .collect()
}

pub fn header_value(headers: &Headers, name: &str) -> Option<String> {
    header_values(headers, name).into_iter().next()
}

/// Whether any `name` header lists `token`, e.g. `Require: 100rel`.
pub fn header_contains_token(headers: &Headers, name: &str, token: &str) -> bool {
    header_values(headers, name).iter().any(|value| {
        value
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    })
}

pub fn parse_rseq_header(headers: &Headers) -> Option<u32> {
    header_value(headers, HEADER_RSEQ)?.trim().parse().ok()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RAck {
    pub rseq: u32,
    pub cseq: u32,
    pub method: String,
}

impl fmt::Display for RAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.rseq, self.cseq, self.method)
    }
}

pub fn parse_rack_header(headers: &Headers) -> Option<RAck> {
    let value = header_value(headers, HEADER_RACK)?;
    let mut parts = value.split_whitespace();
    let rseq = parts.next()?.parse().ok()?;
    let cseq = parts.next()?.parse().ok()?;
    let method = parts.next()?.to_string();
    Some(RAck { rseq, cseq, method })
}

/// The `refresher` parameter of `Session-Expires` (RFC 4028).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Refresher {
    Uac,
    Uas,
}

impl fmt::Display for Refresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refresher::Uac => write!(f, "uac"),
            Refresher::Uas => write!(f, "uas"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionExpires {
    pub delta_seconds: u32,
    pub refresher: Option<Refresher>,
}

impl SessionExpires {
    pub fn new(delta_seconds: u32, refresher: Option<Refresher>) -> Self {
        Self {
            delta_seconds,
            refresher,
        }
    }

    pub fn to_header(&self) -> Header {
        Header::Other(HEADER_SESSION_EXPIRES.into(), self.to_string().into())
    }
}

impl fmt::Display for SessionExpires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.refresher {
            Some(refresher) => write!(f, "{};refresher={}", self.delta_seconds, refresher),
            None => write!(f, "{}", self.delta_seconds),
        }
    }
}

pub fn parse_session_expires(headers: &Headers) -> Option<SessionExpires> {
    let value = header_value(headers, HEADER_SESSION_EXPIRES)?;
    let mut parts = value.split(';');
    let delta_seconds = parts.next()?.trim().parse().ok()?;
    let refresher = parts.find_map(|p| {
        let (name, value) = p.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("refresher") {
            return None;
        }
        match value.trim().to_ascii_lowercase().as_str() {
            "uac" => Some(Refresher::Uac),
            "uas" => Some(Refresher::Uas),
            _ => None,
        }
    });
    Some(SessionExpires {
        delta_seconds,
        refresher,
    })
}

/// URI of a Contact header, display name and header parameters dropped.
pub fn contact_uri(contact: &rsip::headers::Contact) -> Result<rsip::Uri> {
    Ok(contact.typed()?.uri)
}

pub fn via_branch(via: &rsip::headers::Via) -> Option<String> {
    via.typed().ok()?.branch().map(|branch| branch.to_string())
}

/// Removes the parts of a URI that are not allowed in a Request-URI
/// (the `method` parameter and URI headers, RFC 3261 19.1.1).
pub fn strip_request_uri_params(uri: &rsip::Uri) -> rsip::Uri {
    let mut uri = uri.clone();
    uri.params.retain(|p| !matches!(p, Param::Method(_)));
    uri.headers.clear();
    uri
}

/// One entry of a route set, as learned from a Record-Route header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteEntry(UriWithParams);

impl RouteEntry {
    pub fn uri(&self) -> &rsip::Uri {
        &self.0.uri
    }

    /// Whether the hop is a loose router (`lr` present).
    pub fn is_loose(&self) -> bool {
        self.0.uri.params.iter().any(|p| matches!(p, Param::Lr))
    }

    pub fn to_header(&self) -> Header {
        Header::Route(typed::Route(UriWithParamsList(vec![self.0.clone()])).into())
    }
}

impl From<UriWithParams> for RouteEntry {
    fn from(entry: UriWithParams) -> Self {
        Self(entry)
    }
}

impl From<rsip::Uri> for RouteEntry {
    fn from(uri: rsip::Uri) -> Self {
        Self(UriWithParams {
            uri,
            params: vec![],
        })
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Every Record-Route entry of a message, top to bottom.
pub fn record_route_entries(headers: &Headers) -> Result<Vec<RouteEntry>> {
    let mut entries = vec![];
    for header in headers.iter() {
        if let Header::RecordRoute(rr) = header {
            entries.extend(rr.typed()?.uris().iter().cloned().map(RouteEntry::from));
        }
    }
    Ok(entries)
}

/// Pushes `header` in place of any header of the same kind. Extension
/// headers are told apart by name.
pub fn replace_header(headers: &mut Headers, header: Header) {
    match &header {
        Header::Other(name, _) => {
            let name = name.clone();
            headers.retain(|h| {
                split_header(h)
                    .map(|(n, _)| !n.eq_ignore_ascii_case(&name))
                    .unwrap_or(true)
            });
            headers.push(header);
        }
        _ => headers.unique_push(header),
    }
}
