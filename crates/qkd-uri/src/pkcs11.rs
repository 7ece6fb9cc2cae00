//! The `pkcs11:` URL dialect (RFC 7512, scoped to what spec §6 requires) used
//! to address an HSM token: `pkcs11:module-name=<so>;[module-path=<path>;]
//! [token=<label>;serial=<s>;slot-id=<n>]?[pin-value=<pin>|pin-source=<file>]
//! [&login=user|so|cs][&source=<tag>]`.

use thiserror::Error;

use crate::{Uri, UriError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Pkcs11Error {
    #[error(transparent)]
    Uri(#[from] UriError),
    #[error("not a pkcs11 url: scheme is {0:?}")]
    WrongScheme(Option<String>),
    #[error("pkcs11 url is missing required attribute {0:?}")]
    MissingAttribute(&'static str),
    #[error("pkcs11 url specifies both pin-value and pin-source")]
    ConflictingPin,
    #[error("pkcs11 url has invalid slot-id: {0:?}")]
    InvalidSlotId(String),
}

/// How the caller should supply the token PIN: inline, or from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinSource {
    Value(String),
    File(String),
}

/// A parsed `pkcs11:` token locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkcs11Url {
    pub module_name: String,
    pub module_path: Option<String>,
    pub token: Option<String>,
    pub serial: Option<String>,
    pub slot_id: Option<u64>,
    pub pin: Option<PinSource>,
    pub login: Option<String>,
    pub source: Option<String>,
}

impl Pkcs11Url {
    pub fn parse(input: &str) -> Result<Self, Pkcs11Error> {
        let uri = Uri::parse(input)?;
        if uri.scheme.as_deref() != Some("pkcs11") {
            return Err(Pkcs11Error::WrongScheme(uri.scheme.clone()));
        }

        let mut module_name = None;
        let mut module_path = None;
        let mut token = None;
        let mut serial = None;
        let mut slot_id = None;

        for segment in uri.path.split(';').filter(|s| !s.is_empty()) {
            let (key, value) = match segment.split_once('=') {
                Some((k, v)) => (k, v),
                None => continue,
            };
            match key {
                "module-name" => module_name = Some(value.to_owned()),
                "module-path" => module_path = Some(value.to_owned()),
                "token" => token = Some(value.to_owned()),
                "serial" => serial = Some(value.to_owned()),
                "slot-id" => {
                    slot_id = Some(
                        value
                            .parse::<u64>()
                            .map_err(|_| Pkcs11Error::InvalidSlotId(value.to_owned()))?,
                    )
                }
                _ => {}
            }
        }

        let module_name = module_name.ok_or(Pkcs11Error::MissingAttribute("module-name"))?;

        let pin_value = uri.first_query_param("pin-value").map(str::to_owned);
        let pin_source = uri.first_query_param("pin-source").map(str::to_owned);
        let pin = match (pin_value, pin_source) {
            (Some(_), Some(_)) => return Err(Pkcs11Error::ConflictingPin),
            (Some(v), None) => Some(PinSource::Value(v)),
            (None, Some(f)) => Some(PinSource::File(f)),
            (None, None) => None,
        };

        Ok(Self {
            module_name,
            module_path,
            token,
            serial,
            slot_id,
            pin,
            login: uri.first_query_param("login").map(str::to_owned),
            source: uri.first_query_param("source").map(str::to_owned),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worked_example() {
        let url = Pkcs11Url::parse("pkcs11:module-name=libsofthsm2.so;token=My%20token%201?pin-value=1234")
            .unwrap();
        assert_eq!(url.module_name, "libsofthsm2.so");
        assert_eq!(url.token.as_deref(), Some("My token 1"));
        assert_eq!(url.pin, Some(PinSource::Value("1234".to_owned())));
    }

    #[test]
    fn parses_full_attribute_set() {
        let url = Pkcs11Url::parse(
            "pkcs11:module-name=foo.so;module-path=/usr/lib/foo.so;token=tok;serial=ABC123;slot-id=2?pin-source=%2Fetc%2Fpin&login=so&source=agent-1",
        )
        .unwrap();
        assert_eq!(url.module_path.as_deref(), Some("/usr/lib/foo.so"));
        assert_eq!(url.serial.as_deref(), Some("ABC123"));
        assert_eq!(url.slot_id, Some(2));
        assert_eq!(url.pin, Some(PinSource::File("/etc/pin".to_owned())));
        assert_eq!(url.login.as_deref(), Some("so"));
        assert_eq!(url.source.as_deref(), Some("agent-1"));
    }

    #[test]
    fn rejects_missing_module_name() {
        assert!(Pkcs11Url::parse("pkcs11:token=tok").is_err());
    }

    #[test]
    fn rejects_conflicting_pin_sources() {
        let err =
            Pkcs11Url::parse("pkcs11:module-name=foo.so?pin-value=1&pin-source=f").unwrap_err();
        assert_eq!(err, Pkcs11Error::ConflictingPin);
    }

    #[test]
    fn rejects_wrong_scheme() {
        assert!(Pkcs11Url::parse("tcp://host:1/path").is_err());
    }
}
