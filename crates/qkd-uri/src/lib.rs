//! Generic `scheme://host:port/path?key=value&key=value#fragment` URI
//! parsing, percent-encoding, and the PKCS#11 URL dialect used to select an
//! HSM token (spec §6).
//!
//! Grounded in `original_source/src/Algorithms/Datatypes/URI.cpp`: values
//! are stored decoded and re-encoded on `to_string()`, rather than the
//! original's "store encoded, decode on read" approach — more idiomatic for
//! a type that owns `String` fields directly.

mod percent;
mod pkcs11;

pub use percent::{percent_decode, percent_encode};
pub use pkcs11::{Pkcs11Url, PinSource};

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("invalid percent-encoding in {0:?}")]
    InvalidEncoding(String),
}

/// A parsed `scheme://host:port/path?k=v#frag` URI.
///
/// Port `0` means "OS chooses" (spec §6).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct Uri {
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub fragment: Option<String>,
}

impl Uri {
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let (before_fragment, fragment) = split_once_first(input, '#');
        let fragment = fragment
            .map(|f| percent_decode(f))
            .transpose()
            .map_err(|_| UriError::InvalidEncoding(input.to_owned()))?;

        let (before_query, query_str) = split_once_first(before_fragment, '?');
        let query = parse_query(query_str.unwrap_or(""))
            .map_err(|_| UriError::InvalidEncoding(input.to_owned()))?;

        let mut uri = Uri {
            fragment,
            query,
            ..Default::default()
        };

        if let Some(pos) = before_query.find("://") {
            // full authority form: scheme://host[:port][/path]
            let scheme = &before_query[..pos];
            let rest = &before_query[pos + 3..];
            let authority_end = rest
                .find('/')
                .unwrap_or(rest.len());
            let authority = &rest[..authority_end];
            let path = &rest[authority_end..];

            uri.scheme = Some(percent_decode(scheme).map_err(|_| {
                UriError::InvalidEncoding(input.to_owned())
            })?);
            let (host, port) = split_host_port(authority)?;
            uri.host = if host.is_empty() {
                None
            } else {
                Some(percent_decode(host).map_err(|_| UriError::InvalidEncoding(input.to_owned()))?)
            };
            uri.port = port;
            uri.path = percent_decode(path).map_err(|_| UriError::InvalidEncoding(input.to_owned()))?;
        } else if let Some(pos) = before_query.find(':') {
            let before_colon = &before_query[..pos];
            let after_colon = &before_query[pos + 1..];
            if looks_like_scheme(before_colon) && !is_all_digits(after_colon) {
                // opaque form: scheme:path (e.g. pkcs11:module-name=...)
                uri.scheme = Some(before_colon.to_owned());
                uri.path =
                    percent_decode(after_colon).map_err(|_| UriError::InvalidEncoding(input.to_owned()))?;
            } else {
                // host:port, no scheme
                let (host, port) = split_host_port(before_query)?;
                uri.host = if host.is_empty() {
                    None
                } else {
                    Some(percent_decode(host).map_err(|_| UriError::InvalidEncoding(input.to_owned()))?)
                };
                uri.port = port;
            }
        } else if !before_query.is_empty() {
            // just a hostname, or just a path
            if before_query.starts_with('/') {
                uri.path = percent_decode(before_query)
                    .map_err(|_| UriError::InvalidEncoding(input.to_owned()))?;
            } else {
                uri.host = Some(
                    percent_decode(before_query)
                        .map_err(|_| UriError::InvalidEncoding(input.to_owned()))?,
                );
            }
        }

        Ok(uri)
    }

    pub fn first_query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn host_and_port(&self) -> Option<String> {
        self.host
            .as_ref()
            .map(|h| format!("{}:{}", h, self.port.unwrap_or(0)))
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = &self.scheme {
            write!(f, "{}:", percent_encode(scheme))?;
            if self.host.is_some() {
                write!(f, "//")?;
            }
        }
        if let Some(host) = &self.host {
            write!(f, "{}", percent_encode(host))?;
            if let Some(port) = self.port {
                if port != 0 {
                    write!(f, ":{}", port)?;
                }
            }
        }
        write!(f, "{}", percent_encode_path(&self.path))?;
        if !self.query.is_empty() {
            write!(f, "?")?;
            for (idx, (k, v)) in self.query.iter().enumerate() {
                if idx > 0 {
                    write!(f, "&")?;
                }
                write!(f, "{}", percent_encode(k))?;
                if !v.is_empty() {
                    write!(f, "={}", percent_encode(v))?;
                }
            }
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{}", percent_encode(fragment))?;
        }
        Ok(())
    }
}

fn parse_query(raw: &str) -> Result<Vec<(String, String)>, UriError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split('&')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let (key, value) = split_once_first(segment, '=');
            let key = percent_decode(key)?;
            let value = percent_decode(value.unwrap_or(""))?;
            Ok((key, value))
        })
        .collect::<Result<Vec<_>, percent::PercentError>>()
        .map_err(|_| UriError::InvalidEncoding(raw.to_owned()))
}

fn split_once_first(s: &str, sep: char) -> (&str, Option<&str>) {
    match s.find(sep) {
        Some(pos) => (&s[..pos], Some(&s[pos + sep.len_utf8()..])),
        None => (s, None),
    }
}

fn split_host_port(authority: &str) -> Result<(&str, Option<u16>), UriError> {
    match authority.rfind(':') {
        Some(pos) if is_all_digits(&authority[pos + 1..]) => {
            let host = &authority[..pos];
            let port_str = &authority[pos + 1..];
            let port = port_str
                .parse::<u16>()
                .map_err(|_| UriError::InvalidPort(port_str.to_owned()))?;
            Ok((host, Some(port)))
        }
        _ => Ok((authority, None)),
    }
}

fn looks_like_scheme(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().unwrap().is_ascii_alphabetic()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
}

fn is_all_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn percent_encode_path(path: &str) -> String {
    // preserve path separators, encode everything else that needs it
    path.split('/')
        .map(percent_encode)
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri = Uri::parse("pkcs11://hsm-1:7777/slot0?pin-value=1234#note").unwrap();
        assert_eq!(uri.scheme.as_deref(), Some("pkcs11"));
        assert_eq!(uri.host.as_deref(), Some("hsm-1"));
        assert_eq!(uri.port, Some(7777));
        assert_eq!(uri.path, "/slot0");
        assert_eq!(uri.first_query_param("pin-value"), Some("1234"));
        assert_eq!(uri.fragment.as_deref(), Some("note"));
    }

    #[test]
    fn parses_host_and_port_without_scheme() {
        let uri = Uri::parse("127.0.0.1:8080").unwrap();
        assert_eq!(uri.scheme, None);
        assert_eq!(uri.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(uri.port, Some(8080));
    }

    #[test]
    fn parses_just_a_hostname() {
        let uri = Uri::parse("localhost").unwrap();
        assert_eq!(uri.host.as_deref(), Some("localhost"));
        assert_eq!(uri.port, None);
    }

    #[test]
    fn port_zero_means_os_chooses() {
        let uri = Uri::parse("file://localhost:0/path").unwrap();
        assert_eq!(uri.port, Some(0));
    }

    #[test]
    fn to_string_is_idempotent_on_canonicalized_uris() {
        let canonical = "tcp://site-a:7000/device-1?lane=5";
        let first = Uri::parse(canonical).unwrap();
        let rendered = first.to_string();
        let second = Uri::parse(&rendered).unwrap();
        assert_eq!(first, second);
        assert_eq!(rendered, second.to_string());
    }

    #[test]
    fn percent_decodes_path_and_params_on_parse() {
        let uri = Uri::parse("scheme://host/a%20b?k=c%2Fd").unwrap();
        assert_eq!(uri.path, "/a b");
        assert_eq!(uri.first_query_param("k"), Some("c/d"));
    }
}
