//! Cookie, header and query-string plumbing for token transport

use axum::{
    extract::{ConnectInfo, Query},
    http::{header, request::Parts, HeaderMap, HeaderValue, Uri},
};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::config::SameSite;
use crate::error::{Error, Result};

/// A `Set-Cookie` value
#[derive(Debug, Clone)]
pub(crate) struct Cookie<'a> {
    pub name: &'a str,
    pub value: &'a str,
    pub domain: Option<&'a str>,
    /// `None` makes a browser-session cookie
    pub max_age: Option<i64>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: SameSite,
}

impl fmt::Display for Cookie<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}; Path=/", self.name, self.value)?;
        if let Some(domain) = self.domain.filter(|d| !d.is_empty()) {
            write!(f, "; Domain={}", domain)?;
        }
        if let Some(max_age) = self.max_age {
            write!(f, "; Max-Age={}", max_age)?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        write!(f, "; SameSite={}", self.same_site.as_str())
    }
}

/// Append a `Set-Cookie` header
pub(crate) fn append_cookie(headers: &mut HeaderMap, cookie: &Cookie<'_>) -> Result<()> {
    let value = HeaderValue::from_str(&cookie.to_string())
        .map_err(|e| Error::Internal(format!("invalid cookie {}: {}", cookie.name, e)))?;
    headers.append(header::SET_COOKIE, value);
    Ok(())
}

/// Cookie value from the request `Cookie` headers
pub(crate) fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Non-empty header value
pub(crate) fn read_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Token from `Authorization: Bearer <token>`
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Decoded query parameters; an unparsable query reads as empty
pub(crate) fn query_params(uri: &Uri) -> HashMap<String, String> {
    Query::<HashMap<String, String>>::try_from_uri(uri)
        .map(|Query(params)| params)
        .unwrap_or_default()
}

/// Single non-empty query parameter
pub(crate) fn query_param(uri: &Uri, key: &str) -> Option<String> {
    query_params(uri).remove(key).filter(|v| !v.is_empty())
}

/// Client address: first `X-Forwarded-For` hop, `X-Real-IP`, then the socket peer
pub(crate) fn client_ip(parts: &Parts) -> String {
    let forwarded = read_header(&parts.headers, "x-forwarded-for").and_then(|value| {
        value
            .split(',')
            .map(str::trim)
            .find(|hop| !hop.is_empty())
            .map(str::to_string)
    });

    forwarded
        .or_else(|| read_header(&parts.headers, "x-real-ip"))
        .or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_default()
}
