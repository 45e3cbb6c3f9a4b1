//! Message-type and protocol-identifier URIs.
//!
//! A message type has the shape `<doc-uri><protocol-name>/<semver>/<message-name>`,
//! where the doc-uri prefix is opaque and ends with one of the delimiters
//! `/ ; ! ? & # @` or whitespace. A protocol identifier is the same without
//! the trailing message name.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DcommError, DcommResult};
use crate::semver::Semver;

/// Compare two identifiers ignoring case, punctuation and whitespace.
///
/// Only alphanumeric characters take part, in order, so `trust-ping`,
/// `TrustPing` and `Trust Ping!` are all equal. `None` sorts before any string.
pub fn compare_identifiers(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => normalized(a).cmp(normalized(b)),
    }
}

/// Shorthand for `compare_identifiers(..) == Equal` on two present strings.
pub fn identifiers_match(a: &str, b: &str) -> bool {
    compare_identifiers(Some(a), Some(b)) == Ordering::Equal
}

fn normalized(s: &str) -> impl Iterator<Item = char> + '_ {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
}

fn is_doc_uri_delimiter(c: char) -> bool {
    matches!(c, '/' | ';' | '!' | '?' | '&' | '#' | '@') || c.is_whitespace()
}

/// Split `<doc-uri><name>` at the last delimiter, keeping the delimiter in the doc-uri.
fn split_protocol(prefix: &str) -> (&str, &str) {
    match prefix.rfind(is_doc_uri_delimiter) {
        Some(idx) => {
            let delim_len = prefix[idx..].chars().next().map_or(1, char::len_utf8);
            prefix.split_at(idx + delim_len)
        }
        None => ("", prefix),
    }
}

/// `<doc-uri><protocol-name>/<semver>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolIdentifierUri {
    doc_uri: String,
    protocol_name: String,
    version: Semver,
}

impl ProtocolIdentifierUri {
    pub fn parse(text: &str) -> DcommResult<Self> {
        let (prefix, version) = text
            .rsplit_once('/')
            .ok_or_else(|| DcommError::Format(format!("\"{text}\" has no version segment")))?;
        Self::from_parts(text, prefix, version)
    }

    fn from_parts(text: &str, prefix: &str, version: &str) -> DcommResult<Self> {
        let version = Semver::parse(version)
            .map_err(|_| DcommError::Format(format!("\"{text}\" has no valid version segment")))?;
        let (doc_uri, protocol_name) = split_protocol(prefix);
        if protocol_name.is_empty() {
            return Err(DcommError::Format(format!("\"{text}\" has no protocol name")));
        }
        Ok(Self {
            doc_uri: doc_uri.to_string(),
            protocol_name: protocol_name.to_string(),
            version,
        })
    }

    /// Assemble from parts. The doc-uri must already end with a delimiter (or be empty).
    pub fn new(doc_uri: impl Into<String>, protocol_name: impl Into<String>, version: Semver) -> Self {
        Self {
            doc_uri: doc_uri.into(),
            protocol_name: protocol_name.into(),
            version,
        }
    }

    pub fn doc_uri(&self) -> &str {
        &self.doc_uri
    }

    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    pub fn version(&self) -> &Semver {
        &self.version
    }

    /// The message type for one message of this protocol.
    pub fn message_type(&self, message_name: &str) -> MessageTypeUri {
        MessageTypeUri {
            protocol: self.clone(),
            message_name: message_name.to_string(),
        }
    }
}

impl fmt::Display for ProtocolIdentifierUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", self.doc_uri, self.protocol_name, self.version)
    }
}

/// `<doc-uri><protocol-name>/<semver>/<message-name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageTypeUri {
    protocol: ProtocolIdentifierUri,
    message_name: String,
}

impl MessageTypeUri {
    pub fn parse(text: &str) -> DcommResult<Self> {
        let (rest, message_name) = text
            .rsplit_once('/')
            .ok_or_else(|| DcommError::Format(format!("\"{text}\" is not a message type")))?;
        if message_name.is_empty() {
            return Err(DcommError::Format(format!("\"{text}\" has no message name")));
        }
        let (prefix, version) = rest
            .rsplit_once('/')
            .ok_or_else(|| DcommError::Format(format!("\"{text}\" has no version segment")))?;
        Ok(Self {
            protocol: ProtocolIdentifierUri::from_parts(text, prefix, version)?,
            message_name: message_name.to_string(),
        })
    }

    pub fn protocol(&self) -> &ProtocolIdentifierUri {
        &self.protocol
    }

    pub fn doc_uri(&self) -> &str {
        self.protocol.doc_uri()
    }

    pub fn protocol_name(&self) -> &str {
        self.protocol.protocol_name()
    }

    pub fn version(&self) -> &Semver {
        self.protocol.version()
    }

    pub fn message_name(&self) -> &str {
        &self.message_name
    }
}

impl fmt::Display for MessageTypeUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.message_name)
    }
}

impl FromStr for MessageTypeUri {
    type Err = DcommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl FromStr for ProtocolIdentifierUri {
    type Err = DcommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for MessageTypeUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageTypeUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

impl Serialize for ProtocolIdentifierUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProtocolIdentifierUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}
