//! Message envelope: raw bytes plus derived trust and identity metadata.
//!
//! Construction never fails. A payload that is oversize, not JSON, or not
//! parseable becomes an envelope whose trust context records which checks were
//! denied, so error paths (problem reports, quarantine) can still use it.

use std::fmt;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::crypto::Unpacked;
use crate::error::DcommResult;
use crate::identifiers::MessageTypeUri;
use crate::trust::TrustContext;

/// Payloads above this size are rejected before any parsing.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Upper bound on text scanned by the regex fallbacks and the wire-format probe.
const SCAN_LIMIT: usize = 8192;

const LOG_PREVIEW_CHARS: usize = 300;

lazy_static! {
    static ref ID_PAT: Regex = Regex::new(r#""@id"\s*:\s*"([^"]*)""#).expect("valid regex");
    static ref THID_PAT: Regex =
        Regex::new(r#""~thread"\s*:\s*\{[^{}]*"thid"\s*:\s*"([^"]*)""#).expect("valid regex");
    static ref TYPE_PAT: Regex = Regex::new(r#""@type"\s*:\s*"([^"]+)""#).expect("valid regex");
    static ref SQUEEZE_PAT: Regex = Regex::new(r"\s*\n[\t ]*").expect("valid regex");
    static ref SHORT_TYPE_PAT: Regex =
        Regex::new(r"(.*?)([a-z0-9._-]+)/(\d[^/]*)/([a-z0-9._-]+)$").expect("valid regex");
}

fn is_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\r' | b'\n' | b'\t')
}

/// Balanced outer braces after trimming whitespace.
pub fn is_likely_json(data: &[u8]) -> bool {
    let Some(start) = data.iter().position(|b| !is_ws(*b)) else {
        return false;
    };
    let Some(end) = data.iter().rposition(|b| !is_ws(*b)) else {
        return false;
    };
    end > start && data[start] == b'{' && data[end] == b'}'
}

/// Whether `data` looks like an encrypted wire-format message.
///
/// Anything under 120 bytes is too small to hold a believable `protected`
/// block. Only the first 8 KiB are scanned for a quoted `protected` or
/// `ciphertext` key followed by `:` and a string value.
pub fn is_likely_wire_format(data: &[u8]) -> bool {
    if data.len() < 120 || !is_likely_json(data) {
        return false;
    }
    let limit = (data.len() - 100).min(SCAN_LIMIT);
    let span_ws = |mut i: usize| {
        while i < limit && is_ws(data[i]) {
            i += 1;
        }
        i
    };
    for i in 0..limit {
        if data[i] != b'"' {
            continue;
        }
        let key_len = [&b"\"protected\""[..], &b"\"ciphertext\""[..]]
            .iter()
            .find(|key| data[i..].starts_with(key))
            .map(|key| key.len());
        let Some(key_len) = key_len else {
            continue;
        };
        let j = span_ws(i + key_len);
        if j < limit && data[j] == b':' {
            let k = span_ws(j + 1);
            return k < data.len() && data[k] == b'"';
        }
    }
    false
}

fn capture(pat: &Regex, text: &str) -> Option<String> {
    pat.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn bounded_text(data: &[u8]) -> String {
    String::from_utf8_lossy(&data[..data.len().min(SCAN_LIMIT)]).into_owned()
}

/// One received or outgoing message, scoped to a single handler call.
#[derive(Debug, Clone)]
pub struct Envelope {
    raw: Vec<u8>,
    encrypted: bool,
    plaintext: Option<String>,
    obj: Option<Value>,
    id: Option<String>,
    thid: Option<String>,
    msg_type: Option<String>,
    sender_key: Option<String>,
    recipient_key: Option<String>,
    trust: TrustContext,
    in_time: DateTime<Utc>,
}

impl Envelope {
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        Self::with_trust(raw, TrustContext::new())
    }

    /// Wrap bytes, starting from trust that was established upstream.
    pub fn with_trust(raw: impl Into<Vec<u8>>, trust: TrustContext) -> Self {
        let raw = raw.into();
        let mut env = Self {
            raw: Vec::new(),
            encrypted: false,
            plaintext: None,
            obj: None,
            id: None,
            thid: None,
            msg_type: None,
            sender_key: None,
            recipient_key: None,
            trust,
            in_time: Utc::now(),
        };

        if raw.len() > MAX_MESSAGE_SIZE {
            env.trust
                .deny(TrustContext::SIZE_OK | TrustContext::DESERIALIZE_OK);
            env.fallback_identity(&raw);
            env.raw = raw;
            return env;
        }
        env.trust.affirm(TrustContext::SIZE_OK);

        if is_likely_json(&raw) {
            if is_likely_wire_format(&raw) {
                // Nothing about ciphertext can be affirmed until it is unpacked.
                env.encrypted = true;
                env.raw = raw;
                return env;
            }
            env.trust.deny(
                TrustContext::CONFIDENTIALITY
                    | TrustContext::INTEGRITY
                    | TrustContext::AUTHENTICATED_ORIGIN,
            );
            env.derive_from(&raw);
        } else {
            env.trust.deny(TrustContext::DESERIALIZE_OK);
            env.plaintext = std::str::from_utf8(&raw).ok().map(str::to_string);
            env.fallback_identity(&raw);
        }
        env.raw = raw;
        env
    }

    /// Replace plaintext after an external decrypt. The original bytes are kept.
    pub fn set_plaintext(&mut self, value: impl AsRef<[u8]>) {
        let value = value.as_ref();
        self.clear_derived();
        self.trust.undefine(TrustContext::SIZE_OK);
        if value.len() > MAX_MESSAGE_SIZE {
            self.trust
                .deny(TrustContext::SIZE_OK | TrustContext::DESERIALIZE_OK);
            self.fallback_identity(value);
            return;
        }
        self.trust.affirm(TrustContext::SIZE_OK);
        self.derive_from(value);
    }

    /// Record the result of unpacking ciphertext.
    ///
    /// `guarantees` is what the crypto service actually provides; only those
    /// bits of confidentiality/integrity are affirmed, the rest denied.
    /// Authenticated origin follows the presence of a sender key.
    pub fn apply_unpacked(&mut self, unpacked: Unpacked, guarantees: u32) {
        let transport_bits = TrustContext::CONFIDENTIALITY | TrustContext::INTEGRITY;
        self.trust.affirm(guarantees & transport_bits);
        self.trust.deny(!guarantees & transport_bits);
        if unpacked.sender_key.is_some() {
            self.trust.affirm(TrustContext::AUTHENTICATED_ORIGIN);
        } else {
            self.trust.deny(TrustContext::AUTHENTICATED_ORIGIN);
        }
        self.sender_key = unpacked.sender_key;
        self.recipient_key = unpacked.recipient_key;
        self.set_plaintext(unpacked.plaintext);
    }

    fn clear_derived(&mut self) {
        self.plaintext = None;
        self.obj = None;
        self.id = None;
        self.thid = None;
        self.msg_type = None;
    }

    fn derive_from(&mut self, bytes: &[u8]) {
        self.trust.undefine(TrustContext::DESERIALIZE_OK);
        let Ok(text) = std::str::from_utf8(bytes) else {
            self.trust.deny(TrustContext::DESERIALIZE_OK);
            self.fallback_identity(bytes);
            return;
        };
        self.plaintext = Some(text.to_string());
        match serde_json::from_str::<Value>(text) {
            Ok(obj @ Value::Object(_)) => {
                let field = |v: Option<&Value>| v.and_then(Value::as_str).map(str::to_string);
                self.msg_type = field(obj.get("@type"));
                self.id = field(obj.get("@id"));
                self.thid = field(obj.get("~thread").and_then(|t| t.get("thid")));
                self.obj = Some(obj);
                self.trust.affirm(TrustContext::DESERIALIZE_OK);
            }
            _ => {
                self.trust.deny(TrustContext::DESERIALIZE_OK);
                self.fallback_identity(bytes);
            }
        }
    }

    /// Regex extraction over a bounded prefix so malformed input can still be
    /// attributed to a thread.
    fn fallback_identity(&mut self, bytes: &[u8]) {
        let text = bounded_text(bytes);
        self.id = capture(&ID_PAT, &text);
        self.thid = capture(&THID_PAT, &text);
        self.msg_type = capture(&TYPE_PAT, &text);
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    /// The original bytes when they arrived in wire format.
    pub fn ciphertext(&self) -> Option<&[u8]> {
        self.encrypted.then_some(self.raw.as_slice())
    }

    pub fn plaintext(&self) -> Option<&str> {
        self.plaintext.as_deref()
    }

    pub fn obj(&self) -> Option<&Value> {
        self.obj.as_ref()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn thid(&self) -> Option<&str> {
        self.thid.as_deref()
    }

    /// The thread this message belongs to: its `~thread.thid`, else its own `@id`.
    pub fn thread_id(&self) -> Option<&str> {
        self.thid().or_else(|| self.id())
    }

    pub fn msg_type(&self) -> Option<&str> {
        self.msg_type.as_deref()
    }

    /// Parse `@type`; a missing type is a format error.
    pub fn parsed_type(&self) -> DcommResult<MessageTypeUri> {
        match self.msg_type() {
            Some(t) => MessageTypeUri::parse(t),
            None => Err(crate::error::DcommError::Format(
                "message has no @type".to_string(),
            )),
        }
    }

    pub fn sender_key(&self) -> Option<&str> {
        self.sender_key.as_deref()
    }

    pub fn recipient_key(&self) -> Option<&str> {
        self.recipient_key.as_deref()
    }

    pub fn trust(&self) -> &TrustContext {
        &self.trust
    }

    pub fn trust_mut(&mut self) -> &mut TrustContext {
        &mut self.trust
    }

    pub fn in_time(&self) -> DateTime<Utc> {
        self.in_time
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
            && self.plaintext.as_deref().map_or(true, str::is_empty)
            && self.obj.is_none()
    }

    fn preview(&self) -> Option<String> {
        let text: String = match &self.plaintext {
            Some(p) if !p.is_empty() => p.chars().take(LOG_PREVIEW_CHARS).collect(),
            _ => {
                let raw = &self.raw[..self.raw.len().min(LOG_PREVIEW_CHARS)];
                String::from_utf8_lossy(raw).into_owned()
            }
        };
        (!text.is_empty()).then_some(text)
    }
}

fn shorten_type(uri: &str) -> String {
    if let Some(caps) = SHORT_TYPE_PAT.captures(uri) {
        return format!("...{}/{}/{}", &caps[2], &caps[3], &caps[4]);
    }
    match uri.find(';') {
        Some(i) => format!("...{}", &uri[i + 1..]),
        None => uri.to_string(),
    }
}

fn describe(text: &str) -> String {
    let mut descriptors = Vec::new();
    if let Some(t) = capture(&TYPE_PAT, text) {
        descriptors.push(format!("\"@type\":\"{}\"", shorten_type(&t)));
    }
    if let Some(id) = capture(&ID_PAT, text) {
        descriptors.push(format!("\"@id\":\"{id}\""));
    }
    if !descriptors.is_empty() {
        return format!("{{...{}...}}", descriptors.join(","));
    }
    if text.chars().count() <= 40 {
        return SQUEEZE_PAT.replace_all(text, " ").into_owned();
    }
    let head: String = text.chars().take(60).collect();
    let head = head.trim().replace('\r', "");
    let squeezed = SQUEEZE_PAT.replace_all(&head, " ");
    let clipped: String = squeezed.chars().take(37).collect();
    format!("{clipped}...")
}

impl fmt::Display for Envelope {
    /// Bounded and redacted: at most a 300-character preview, with `@type`
    /// and `@id` preferred and long sender keys clipped.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fragment = match self.preview() {
            Some(text) => describe(&text),
            None => "(empty)".to_string(),
        };
        let sender = match self.sender_key() {
            Some(key) if key.chars().count() > 8 => {
                format!("{}...", key.chars().take(8).collect::<String>())
            }
            Some(key) => key.to_string(),
            None => "nobody".to_string(),
        };
        write!(f, "{fragment} from {sender} with mtc={}", self.trust)
    }
}
