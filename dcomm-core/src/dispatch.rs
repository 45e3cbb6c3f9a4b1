//! Handler registry and version-tolerant dispatch.
//!
//! The registry is built once at startup from explicitly registered
//! handlers and is read-only afterwards, so it can be shared across
//! concurrent dispatches without locking.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;

use crate::envelope::Envelope;
use crate::error::DcommResult;
use crate::identifiers::{identifiers_match, MessageTypeUri, ProtocolIdentifierUri};
use crate::interaction::Interaction;
use crate::message::Message;
use crate::semver::Semver;

/// One protocol (at one version) a handler understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSupport {
    pub protocol: ProtocolIdentifierUri,
    pub messages: Vec<String>,
    pub roles: Vec<String>,
}

impl ProtocolSupport {
    pub fn new(protocol: ProtocolIdentifierUri, messages: &[&str], roles: &[&str]) -> Self {
        Self {
            protocol,
            messages: messages.iter().map(|m| m.to_string()).collect(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// A message queued by a handler, sent by the runtime after the handler returns.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub message: Value,
    /// Pack for these keys; plaintext when empty.
    pub recipient_keys: Vec<String>,
    /// Send here; back through the arrival transport when `None`.
    pub endpoint: Option<String>,
}

/// Who this agent is, as far as handlers need to know.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentIdentity {
    pub label: String,
    pub verkey: Option<String>,
    pub endpoint: Option<String>,
}

/// What a handler can touch while handling one message.
pub struct HandlerContext<'a> {
    thid: Option<&'a str>,
    interaction: &'a mut Option<Interaction>,
    outbox: Vec<Outbound>,
    pub registry: &'a HandlerRegistry,
    pub identity: &'a AgentIdentity,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        thid: Option<&'a str>,
        interaction: &'a mut Option<Interaction>,
        registry: &'a HandlerRegistry,
        identity: &'a AgentIdentity,
    ) -> Self {
        Self {
            thid,
            interaction,
            outbox: Vec::new(),
            registry,
            identity,
        }
    }

    pub fn thid(&self) -> Option<&str> {
        self.thid
    }

    /// Persisted protocol data for this thread, if any.
    pub fn data(&self) -> Option<&Value> {
        self.interaction.as_ref().map(|i| &i.data)
    }

    /// Replace this thread's protocol data. Ignored for unthreaded messages.
    pub fn set_data(&mut self, data: Value) {
        if let Some(existing) = self.interaction.as_mut() {
            existing.data = data;
        } else if let Some(thid) = self.thid {
            *self.interaction = Some(Interaction::new(thid, data));
        }
    }

    /// Forget this thread.
    pub fn clear_data(&mut self) {
        *self.interaction = None;
    }

    /// Queue a reply back to whoever sent the message.
    pub fn reply(&mut self, message: Message) -> DcommResult<()> {
        self.send(message, None, Vec::new())
    }

    /// Queue a message to an explicit endpoint, packed for `recipient_keys`.
    pub fn send(
        &mut self,
        message: Message,
        endpoint: Option<String>,
        recipient_keys: Vec<String>,
    ) -> DcommResult<()> {
        self.outbox.push(Outbound {
            message: message.finish()?,
            recipient_keys,
            endpoint,
        });
        Ok(())
    }

    pub fn outbox(&self) -> &[Outbound] {
        &self.outbox
    }

    pub fn into_outbox(self) -> Vec<Outbound> {
        self.outbox
    }
}

/// A protocol implementation.
pub trait Handler: Send + Sync {
    /// Protocols, messages and roles this handler accepts.
    fn supported(&self) -> Vec<ProtocolSupport>;

    /// Handle one message. Returns `false` if the message was not for this handler after all.
    fn handle(
        &self,
        env: &Envelope,
        msg_type: &MessageTypeUri,
        ctx: &mut HandlerContext<'_>,
    ) -> DcommResult<bool>;
}

/// One registered `(handler, protocol version)` pair.
#[derive(Clone)]
pub struct HandlerInfo {
    pub handler: Arc<dyn Handler>,
    pub protocol: ProtocolIdentifierUri,
    pub messages: Vec<String>,
    pub roles: Vec<String>,
}

impl HandlerInfo {
    pub fn doc_uri(&self) -> &str {
        self.protocol.doc_uri()
    }

    pub fn protocol_name(&self) -> &str {
        self.protocol.protocol_name()
    }

    pub fn version(&self) -> &Semver {
        self.protocol.version()
    }

    pub fn supports_message(&self, name: &str) -> bool {
        self.messages.iter().any(|m| identifiers_match(m, name))
    }
}

impl std::fmt::Debug for HandlerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerInfo")
            .field("protocol", &self.protocol.to_string())
            .field("messages", &self.messages)
            .field("roles", &self.roles)
            .finish()
    }
}

/// Flat, ordered, immutable collection of handlers.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<HandlerInfo>,
}

/// Collects handlers before freezing them into a [`HandlerRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: Vec<HandlerInfo>,
}

impl RegistryBuilder {
    /// Add every protocol `handler` declares, in declaration order.
    pub fn register(mut self, handler: Arc<dyn Handler>) -> Self {
        for support in handler.supported() {
            tracing::debug!(protocol = %support.protocol, "Registered handler");
            self.handlers.push(HandlerInfo {
                handler: handler.clone(),
                protocol: support.protocol,
                messages: support.messages,
                roles: support.roles,
            });
        }
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn handlers(&self) -> &[HandlerInfo] {
        &self.handlers
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Pick the handler for `msg_type`.
    ///
    /// Candidates share the doc-uri exactly and match protocol and message
    /// names under [`identifiers_match`]. An exact version wins. Otherwise
    /// compatibility scores decide: if any handler is newer, the newer one
    /// closest to the message version wins (highest magnitude, then lowest
    /// version); else the closest older one (highest magnitude, then highest
    /// version). Incompatible handlers are never chosen. Registration order
    /// breaks any remaining tie.
    pub fn find_handler(&self, msg_type: &MessageTypeUri) -> Option<&HandlerInfo> {
        let wanted = msg_type.version();
        let candidates: Vec<&HandlerInfo> = self
            .handlers
            .iter()
            .filter(|h| h.doc_uri() == msg_type.doc_uri())
            .filter(|h| identifiers_match(h.protocol_name(), msg_type.protocol_name()))
            .filter(|h| h.supports_message(msg_type.message_name()))
            .collect();

        if let Some(exact) = candidates.iter().find(|h| h.version() == wanted) {
            return Some(*exact);
        }

        let scored: Vec<(i8, &HandlerInfo)> = candidates
            .into_iter()
            .map(|h| (h.version().compatible_with(wanted), h))
            .filter(|(score, _)| *score != 0)
            .collect();

        let newer = scored.iter().filter(|(score, _)| *score > 0);
        let older = scored.iter().filter(|(score, _)| *score < 0);

        // min_by keeps the first of equal elements, preserving registration order.
        let closest = |a: &&(i8, &HandlerInfo), b: &&(i8, &HandlerInfo), newer: bool| {
            b.0.abs().cmp(&a.0.abs()).then_with(|| {
                let by_version = a.1.version().cmp(b.1.version());
                if newer {
                    by_version
                } else {
                    by_version.reverse()
                }
            })
        };

        newer
            .min_by(|a, b| closest(a, b, true))
            .or_else(|| older.min_by(|a, b| closest(a, b, false)))
            .map(|(_, h)| *h)
    }

    /// Distinct protocol identifiers, in registration order.
    pub fn protocols(&self) -> Vec<&HandlerInfo> {
        let mut seen: Vec<&HandlerInfo> = Vec::new();
        for info in &self.handlers {
            if !seen.iter().any(|s| s.protocol == info.protocol) {
                seen.push(info);
            }
        }
        seen
    }
}

/// Sort helper used when listing protocols for humans.
pub fn by_protocol_name(a: &HandlerInfo, b: &HandlerInfo) -> Ordering {
    crate::identifiers::compare_identifiers(Some(a.protocol_name()), Some(b.protocol_name()))
        .then_with(|| a.version().cmp(b.version()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed {
        name: &'static str,
        versions: Vec<&'static str>,
    }

    impl Handler for Fixed {
        fn supported(&self) -> Vec<ProtocolSupport> {
            self.versions
                .iter()
                .map(|v| {
                    ProtocolSupport::new(
                        ProtocolIdentifierUri::parse(&format!("https://x.org/{}/{v}", self.name))
                            .unwrap(),
                        &["do-thing"],
                        &["doer"],
                    )
                })
                .collect()
        }

        fn handle(
            &self,
            _env: &Envelope,
            _msg_type: &MessageTypeUri,
            ctx: &mut HandlerContext<'_>,
        ) -> DcommResult<bool> {
            ctx.set_data(json!({"seen": true}));
            ctx.reply(Message::new("https://x.org/foo/1.0/done"))?;
            Ok(true)
        }
    }

    fn registry(versions: &[&'static str]) -> HandlerRegistry {
        HandlerRegistry::builder()
            .register(Arc::new(Fixed {
                name: "foo",
                versions: versions.to_vec(),
            }))
            .build()
    }

    fn pick(versions: &[&'static str], wanted: &str) -> Option<String> {
        let reg = registry(versions);
        let mt = MessageTypeUri::parse(&format!("https://x.org/foo/{wanted}/do-thing")).unwrap();
        reg.find_handler(&mt).map(|h| h.version().to_string())
    }

    #[test]
    fn version_negotiation_table() {
        let table: &[(&[&str], &str, Option<&str>)] = &[
            (&["1.0", "2.1"], "1.2", Some("1.0")),
            (&["2.1", "1.0"], "1.2", Some("1.0")),
            (&["1.0", "1.1", "1.3"], "1.2", Some("1.3")),
            (&["1.5", "1.3"], "1.2", Some("1.3")),
            (&["1.0", "1.1"], "1.2", Some("1.1")),
            (&["1.2.0", "1.2.5", "1.4"], "1.2.3", Some("1.2.5")),
            (&["1.2.0", "1.1"], "1.2.3", Some("1.2.0")),
            (&["1.3", "1.2"], "1.2", Some("1.2")),
            (&["1.2.3+b", "1.2.3+a"], "1.2.3", Some("1.2.3+a")),
            (&["2.0"], "1.0", None),
            (&["0.1", "0.2"], "0.3", None),
            (&["0.3.1", "0.2"], "0.3", Some("0.3.1")),
            (&[], "1.0", None),
        ];
        for (versions, wanted, expected) in table {
            assert_eq!(
                pick(versions, wanted).as_deref(),
                *expected,
                "handlers {versions:?}, message {wanted}"
            );
        }
    }

    #[test]
    fn names_match_loosely_but_doc_uri_exactly() {
        let reg = registry(&["1.0"]);
        let loose = MessageTypeUri::parse("https://x.org/FOO/1.0/DoThing").unwrap();
        assert!(reg.find_handler(&loose).is_some());

        let other_doc = MessageTypeUri::parse("https://y.org/foo/1.0/do-thing").unwrap();
        assert!(reg.find_handler(&other_doc).is_none());

        let other_msg = MessageTypeUri::parse("https://x.org/foo/1.0/undo").unwrap();
        assert!(reg.find_handler(&other_msg).is_none());
    }

    #[test]
    fn protocols_are_listed_once() {
        let reg = HandlerRegistry::builder()
            .register(Arc::new(Fixed { name: "foo", versions: vec!["1.0", "1.1"] }))
            .register(Arc::new(Fixed { name: "bar", versions: vec!["1.0"] }))
            .register(Arc::new(Fixed { name: "foo", versions: vec!["1.0"] }))
            .build();
        assert_eq!(reg.len(), 4);
        let mut listed = reg.protocols();
        assert_eq!(listed.len(), 3);
        listed.sort_by(|a, b| by_protocol_name(a, b));
        assert_eq!(listed[0].protocol_name(), "bar");
        assert_eq!(listed[2].version().to_string(), "1.1");
    }

    #[test]
    fn context_collects_data_and_replies() {
        let reg = registry(&["1.0"]);
        let identity = AgentIdentity::default();
        let mut interaction = None;
        let env = Envelope::new(r#"{"@type": "https://x.org/foo/1.0/do-thing", "@id": "m1"}"#);
        let mt = env.parsed_type().unwrap();
        let info = reg.find_handler(&mt).unwrap();

        let mut ctx = HandlerContext::new(env.thread_id(), &mut interaction, &reg, &identity);
        assert!(info.handler.handle(&env, &mt, &mut ctx).unwrap());
        let outbox = ctx.into_outbox();
        assert_eq!(outbox.len(), 1);
        assert!(outbox[0].endpoint.is_none());

        let saved = interaction.unwrap();
        assert_eq!(saved.thid, "m1");
        assert_eq!(saved.data, json!({"seen": true}));
    }
}
