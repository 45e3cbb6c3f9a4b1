//! DIDComm message scaffolding.
//!
//! Every outgoing message carries `@type` and `@id`, plus optional `~thread`
//! (correlation) and `~timing` (receive/send stamps) decorators. Protocol
//! fields live in a flat body next to those reserved keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::{DcommResult, ProblemCode};

/// Doc-uri prefix of the Sovrin community message families.
pub const SOV_DOC_URI: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/";

/// Well-known type of a problem report.
pub const PROBLEM_REPORT_TYPE: &str =
    "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/notification/1.0/problem-report";

/// Catalog that [`ProblemCode`] values are drawn from.
pub const PROBLEM_CODE_CATALOG: &str = "dcomm/problem-codes/1.0";

/// `~thread` decorator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub thid: String,
    #[serde(default)]
    pub sender_order: u32,
}

/// `~timing` decorator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Timing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_time: Option<DateTime<Utc>>,
}

/// Reserved fields common to all messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread", skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
    #[serde(rename = "~timing", skip_serializing_if = "Option::is_none")]
    pub timing: Option<Timing>,
}

/// An outgoing message under construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    #[serde(flatten)]
    pub header: MessageHeader,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Message {
    /// Start a new message with a fresh `@id` and no thread.
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            header: MessageHeader {
                msg_type: msg_type.into(),
                id: Uuid::new_v4().to_string(),
                thread: None,
                timing: None,
            },
            body: Map::new(),
        }
    }

    /// Start a message that answers `incoming`: threaded to the incoming
    /// thread (or its `@id`), and stamped with its receive time.
    pub fn reply_to(msg_type: impl Into<String>, incoming: &Envelope) -> Self {
        let mut msg = Self::new(msg_type);
        if let Some(thid) = incoming.thread_id() {
            msg = msg.with_thread(thid);
        }
        msg.header.timing = Some(Timing {
            in_time: Some(incoming.in_time()),
            out_time: None,
        });
        msg
    }

    pub fn with_thread(mut self, thid: impl Into<String>) -> Self {
        self.header.thread = Some(Thread {
            thid: thid.into(),
            sender_order: 0,
        });
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn thid(&self) -> Option<&str> {
        self.header.thread.as_ref().map(|t| t.thid.as_str())
    }

    /// Stamp `~timing.out_time` (when timing is present) and render as JSON.
    pub fn finish(mut self) -> DcommResult<Value> {
        if let Some(timing) = self.header.timing.as_mut() {
            timing.out_time = Some(Utc::now());
        }
        Ok(serde_json::to_value(&self)?)
    }
}

/// `explain~l10n` block of a problem report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Localization {
    pub code: ProblemCode,
    pub catalog: String,
}

/// Build a problem report about `offending`.
///
/// Correlated to the offending thread when known, else to the offending
/// message's own `@id`, else left unthreaded.
pub fn problem_report(
    offending: Option<&Envelope>,
    explain: &str,
    code: Option<ProblemCode>,
) -> DcommResult<Message> {
    let mut msg = match offending {
        Some(env) => Message::reply_to(PROBLEM_REPORT_TYPE, env),
        None => Message::new(PROBLEM_REPORT_TYPE),
    };
    msg = msg.with_field("explain", explain);
    if let Some(code) = code {
        let l10n = Localization {
            code,
            catalog: PROBLEM_CODE_CATALOG.to_string(),
        };
        msg = msg.with_field("explain~l10n", serde_json::to_value(l10n)?);
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_has_type_and_id() {
        let value = Message::new("x/1.0/ping").with_field("n", 1).finish().unwrap();
        assert_eq!(value["@type"], "x/1.0/ping");
        assert!(Uuid::parse_str(value["@id"].as_str().unwrap()).is_ok());
        assert_eq!(value["n"], 1);
        assert!(value.get("~thread").is_none());
        assert!(value.get("~timing").is_none());
    }

    #[test]
    fn reply_threads_and_stamps_timing() {
        let incoming = Envelope::new(r#"{"@type": "x/1.0/ping", "@id": "p1"}"#);
        let value = Message::reply_to("x/1.0/pong", &incoming).finish().unwrap();
        assert_eq!(value["~thread"]["thid"], "p1");
        assert_eq!(value["~thread"]["sender_order"], 0);
        assert!(value["~timing"]["in_time"].is_string());
        assert!(value["~timing"]["out_time"].is_string());
    }

    #[test]
    fn problem_report_correlation() {
        let threaded = Envelope::new(
            r#"{"@type": "x/1.0/a", "@id": "m2", "~thread": {"thid": "t1"}}"#,
        );
        let report = problem_report(Some(&threaded), "bad", Some(ProblemCode::ProtocolAnomaly))
            .unwrap()
            .finish()
            .unwrap();
        assert_eq!(report["@type"], PROBLEM_REPORT_TYPE);
        assert_eq!(report["~thread"]["thid"], "t1");
        assert_eq!(report["explain"], "bad");
        assert_eq!(report["explain~l10n"]["code"], "protocol_anomaly");
        assert_eq!(report["explain~l10n"]["catalog"], PROBLEM_CODE_CATALOG);

        let garbage = Envelope::new("not json");
        let report = problem_report(Some(&garbage), "unreadable", None).unwrap().finish().unwrap();
        assert!(report.get("~thread").is_none());
        assert!(report.get("explain~l10n").is_none());

        let report = problem_report(None, "late", None).unwrap().finish().unwrap();
        assert!(report.get("~timing").is_none());
    }

    #[test]
    fn every_problem_code_lands_in_localization() {
        let env = Envelope::new(r#"{"@type": "x/1.0/a", "@id": "m3"}"#);
        for code in [
            ProblemCode::MalformedType,
            ProblemCode::MalformedMessage,
            ProblemCode::UnsupportedType,
            ProblemCode::ProtocolAnomaly,
            ProblemCode::InsufficientTrust,
            ProblemCode::InternalError,
        ] {
            let report = problem_report(Some(&env), "x", Some(code)).unwrap().finish().unwrap();
            assert_eq!(report["explain~l10n"]["code"], code.to_string());
        }
    }
}
