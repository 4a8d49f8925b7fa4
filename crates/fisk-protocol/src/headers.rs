//! Typed views of handshake headers.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::connection::{Handshake, Role};
use crate::error::ProtocolError;
use crate::PROTOCOL_VERSION;

pub const HEADER_SLOTS: &str = "slots";
pub const HEADER_PORT: &str = "port";
pub const HEADER_ENVIRONMENTS: &str = "environments";
pub const HEADER_ENVIRONMENT: &str = "environment";
pub const HEADER_NAME: &str = "name";
pub const HEADER_HOSTNAME: &str = "hostname";
pub const HEADER_SYSTEM: &str = "system";
pub const HEADER_CACHE_PORT: &str = "cache-port";
pub const HEADER_PROTOCOL_VERSION: &str = "protocol-version";
pub const HEADER_PREFERRED_BUILDER: &str = "preferred-builder";
pub const HEADER_USER: &str = "user";
pub const HEADER_RESERVATION: &str = "reservation";
pub const HEADER_DIGEST: &str = "digest";
pub const HEADER_SOURCE_FILE: &str = "source-file";

type Headers = BTreeMap<String, String>;

fn required<'a>(headers: &'a Headers, name: &str) -> Result<&'a str, ProtocolError> {
    match headers.get(name) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim()),
        Some(value) => Err(ProtocolError::invalid_header(name, value, "empty value")),
        None => Err(ProtocolError::missing_header(name)),
    }
}

fn optional(headers: &Headers, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn number<T: FromStr>(name: &str, value: &str) -> Result<T, ProtocolError> {
    value
        .parse()
        .map_err(|_| ProtocolError::invalid_header(name, value, "expected a non-negative integer"))
}

fn optional_number<T: FromStr>(headers: &Headers, name: &str) -> Result<Option<T>, ProtocolError> {
    optional(headers, name)
        .map(|value| number(name, &value))
        .transpose()
}

/// Split a semicolon separated hash list, dropping empty items.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reject peers announcing a different protocol version.
///
/// Peers that do not send the header are assumed compatible.
pub fn check_protocol_version(headers: &Headers) -> Result<(), ProtocolError> {
    if let Some(value) = optional(headers, HEADER_PROTOCOL_VERSION) {
        let requested: u32 = number(HEADER_PROTOCOL_VERSION, &value)?;
        if requested != PROTOCOL_VERSION {
            return Err(ProtocolError::unsupported_protocol(requested, PROTOCOL_VERSION));
        }
    }
    Ok(())
}

fn insert_opt(headers: &mut Headers, name: &str, value: &Option<String>) {
    if let Some(value) = value {
        headers.insert(name.to_string(), value.clone());
    }
}

/// Headers a builder sends when registering with the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderHeaders {
    pub slots: u32,
    pub port: u16,
    pub environments: Vec<String>,
    pub name: Option<String>,
    pub hostname: Option<String>,
    /// Platform/architecture string, matched against environment hosts.
    pub system: Option<String>,
    pub cache_port: Option<u16>,
}

impl BuilderHeaders {
    pub fn parse(headers: &Headers) -> Result<Self, ProtocolError> {
        check_protocol_version(headers)?;

        let slots_raw = required(headers, HEADER_SLOTS)?;
        let slots: u32 = number(HEADER_SLOTS, slots_raw)?;
        if slots == 0 {
            return Err(ProtocolError::invalid_header(
                HEADER_SLOTS,
                slots_raw,
                "must be greater than zero",
            ));
        }
        let port: u16 = number(HEADER_PORT, required(headers, HEADER_PORT)?)?;

        Ok(Self {
            slots,
            port,
            environments: headers
                .get(HEADER_ENVIRONMENTS)
                .map(|v| split_list(v))
                .unwrap_or_default(),
            name: optional(headers, HEADER_NAME),
            hostname: optional(headers, HEADER_HOSTNAME),
            system: optional(headers, HEADER_SYSTEM),
            cache_port: optional_number(headers, HEADER_CACHE_PORT)?,
        })
    }

    pub fn to_handshake(&self) -> Handshake {
        let mut headers = Headers::new();
        headers.insert(HEADER_SLOTS.into(), self.slots.to_string());
        headers.insert(HEADER_PORT.into(), self.port.to_string());
        headers.insert(HEADER_ENVIRONMENTS.into(), self.environments.join(";"));
        headers.insert(HEADER_PROTOCOL_VERSION.into(), PROTOCOL_VERSION.to_string());
        insert_opt(&mut headers, HEADER_NAME, &self.name);
        insert_opt(&mut headers, HEADER_HOSTNAME, &self.hostname);
        insert_opt(&mut headers, HEADER_SYSTEM, &self.system);
        insert_opt(
            &mut headers,
            HEADER_CACHE_PORT,
            &self.cache_port.map(|p| p.to_string()),
        );
        Handshake {
            role: Role::Builder,
            headers,
        }
    }
}

/// Headers a client sends when asking the scheduler for a builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHeaders {
    pub environments: Vec<String>,
    /// Builder name or hostname the client would like to use.
    pub preferred_builder: Option<String>,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub user: Option<String>,
}

impl ClientHeaders {
    pub fn parse(headers: &Headers) -> Result<Self, ProtocolError> {
        check_protocol_version(headers)?;

        let raw = required(headers, HEADER_ENVIRONMENTS)?;
        let environments = split_list(raw);
        if environments.is_empty() {
            return Err(ProtocolError::invalid_header(
                HEADER_ENVIRONMENTS,
                raw,
                "no environment hashes listed",
            ));
        }

        Ok(Self {
            environments,
            preferred_builder: optional(headers, HEADER_PREFERRED_BUILDER),
            name: optional(headers, HEADER_NAME),
            hostname: optional(headers, HEADER_HOSTNAME),
            user: optional(headers, HEADER_USER),
        })
    }

    pub fn to_handshake(&self) -> Handshake {
        let mut headers = Headers::new();
        headers.insert(HEADER_ENVIRONMENTS.into(), self.environments.join(";"));
        headers.insert(HEADER_PROTOCOL_VERSION.into(), PROTOCOL_VERSION.to_string());
        insert_opt(&mut headers, HEADER_PREFERRED_BUILDER, &self.preferred_builder);
        insert_opt(&mut headers, HEADER_NAME, &self.name);
        insert_opt(&mut headers, HEADER_HOSTNAME, &self.hostname);
        insert_opt(&mut headers, HEADER_USER, &self.user);
        Handshake {
            role: Role::Client,
            headers,
        }
    }
}

/// Headers a client sends when opening a job connection to a builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHeaders {
    pub environment: String,
    /// Reservation id handed out by the scheduler's placement.
    pub reservation: Option<u64>,
    pub digest: Option<String>,
    pub source_file: Option<String>,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub user: Option<String>,
}

impl JobHeaders {
    pub fn parse(headers: &Headers) -> Result<Self, ProtocolError> {
        check_protocol_version(headers)?;

        Ok(Self {
            environment: required(headers, HEADER_ENVIRONMENT)?.to_string(),
            reservation: optional_number(headers, HEADER_RESERVATION)?,
            digest: optional(headers, HEADER_DIGEST),
            source_file: optional(headers, HEADER_SOURCE_FILE),
            name: optional(headers, HEADER_NAME),
            hostname: optional(headers, HEADER_HOSTNAME),
            user: optional(headers, HEADER_USER),
        })
    }

    pub fn to_handshake(&self) -> Handshake {
        let mut headers = Headers::new();
        headers.insert(HEADER_ENVIRONMENT.into(), self.environment.clone());
        headers.insert(HEADER_PROTOCOL_VERSION.into(), PROTOCOL_VERSION.to_string());
        insert_opt(
            &mut headers,
            HEADER_RESERVATION,
            &self.reservation.map(|r| r.to_string()),
        );
        insert_opt(&mut headers, HEADER_DIGEST, &self.digest);
        insert_opt(&mut headers, HEADER_SOURCE_FILE, &self.source_file);
        insert_opt(&mut headers, HEADER_NAME, &self.name);
        insert_opt(&mut headers, HEADER_HOSTNAME, &self.hostname);
        insert_opt(&mut headers, HEADER_USER, &self.user);
        Handshake {
            role: Role::Job,
            headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_builder_headers_parse() {
        let parsed = BuilderHeaders::parse(&headers(&[
            ("slots", "4"),
            ("port", "8097"),
            ("environments", "abc123;def456;"),
            ("system", "Linux x86_64"),
            ("cache-port", "8098"),
        ]))
        .unwrap();

        assert_eq!(parsed.slots, 4);
        assert_eq!(parsed.port, 8097);
        assert_eq!(parsed.environments, vec!["abc123", "def456"]);
        assert_eq!(parsed.system.as_deref(), Some("Linux x86_64"));
        assert_eq!(parsed.cache_port, Some(8098));
        assert_eq!(BuilderHeaders::parse(&parsed.to_handshake().headers).unwrap(), parsed);
    }

    #[test]
    fn test_builder_missing_slots() {
        let err = BuilderHeaders::parse(&headers(&[("port", "1")])).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingHeader);
    }

    #[test]
    fn test_builder_zero_slots() {
        let err = BuilderHeaders::parse(&headers(&[("slots", "0"), ("port", "1")])).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidHeader);
    }

    #[test]
    fn test_builder_bad_port() {
        let err =
            BuilderHeaders::parse(&headers(&[("slots", "2"), ("port", "http")])).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidHeader);
    }

    #[test]
    fn test_protocol_version_mismatch() {
        let err = ClientHeaders::parse(&headers(&[
            ("environments", "x"),
            ("protocol-version", "999"),
        ]))
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedProtocol);
    }

    #[test]
    fn test_client_requires_environment() {
        let err = ClientHeaders::parse(&headers(&[("environments", ";;")])).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidHeader);
        let err = ClientHeaders::parse(&headers(&[])).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingHeader);
    }

    #[test]
    fn test_job_headers() {
        let parsed = JobHeaders::parse(&headers(&[
            ("environment", "abc"),
            ("reservation", "17"),
            ("source-file", "/src/main.c"),
        ]))
        .unwrap();
        assert_eq!(parsed.reservation, Some(17));
        assert_eq!(parsed.digest, None);
        assert_eq!(parsed.to_handshake().role, Role::Job);

        let err = JobHeaders::parse(&headers(&[("environment", "abc"), ("reservation", "-1")]))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidHeader);
    }
}
