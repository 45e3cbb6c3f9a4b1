//! Connections protocol: invitation, request, response, ack.
//!
//! Each side keeps its half of the connections state machine in the
//! interaction store, keyed by the invitation's `@id`, which every later
//! message threads to. A message that is illegal in the current state is a
//! protocol anomaly; the runtime answers it with a problem report and the
//! stored state is left untouched.

use chrono::Utc;
use dcomm_core::connections::{self, events, INVITEE, INVITER};
use dcomm_core::trust::TrustContext;
use dcomm_core::{
    identifiers_match, AgentIdentity, DcommError, DcommResult, Envelope, Handler, HandlerContext,
    Interaction, MachineSnapshot, Message, MessageTypeUri, Outcome, ProtocolIdentifierUri,
    ProtocolSupport, StateMachine,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{sov_protocol, sov_type};

pub const INVITATION: &str = "invitation";
pub const REQUEST: &str = "request";
pub const RESPONSE: &str = "response";
pub const ACK: &str = "ack";
pub const PROBLEM_REPORT: &str = "problem_report";

pub fn protocol() -> ProtocolIdentifierUri {
    sov_protocol("connections", 1, 0)
}

/// What one side remembers about a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionData {
    pub state_machine: MachineSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub their_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub their_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub their_key: Option<String>,
}

impl ConnectionData {
    fn new(machine: &StateMachine) -> Self {
        Self {
            state_machine: machine.snapshot(),
            their_label: None,
            their_endpoint: None,
            their_key: None,
        }
    }
}

/// Map an incoming message name onto the machine event it triggers.
fn received_event(message_name: &str) -> Option<&'static str> {
    [
        (INVITATION, events::RECEIVE_INVITATION),
        (REQUEST, events::RECEIVE_CONN_REQ),
        (RESPONSE, events::RECEIVE_CONN_RESP),
        (ACK, events::RECEIVE_ACK),
        (PROBLEM_REPORT, events::RECEIVE_ERROR),
    ]
    .into_iter()
    .find(|(name, _)| identifiers_match(name, message_name))
    .map(|(_, event)| event)
}

/// Fire `event`, treating a vetoed transition like an illegal one.
fn step(machine: &mut StateMachine, event: &str) -> DcommResult<()> {
    match machine.handle(event)? {
        Outcome::Moved { .. } => Ok(()),
        Outcome::Aborted { reason } => Err(anomaly(machine, reason)),
    }
}

fn anomaly(machine: &StateMachine, detail: impl Into<String>) -> DcommError {
    DcommError::ProtocolAnomaly {
        protocol: machine.protocol().to_string(),
        role: machine.role().to_string(),
        state: machine.state().to_string(),
        detail: detail.into(),
    }
}

/// Our half of the `connection` block offered in requests and responses.
fn my_connection(identity: &AgentIdentity) -> DcommResult<Value> {
    let endpoint = identity
        .endpoint
        .as_deref()
        .ok_or_else(|| DcommError::Config("agent has no endpoint to offer peers".to_string()))?;
    Ok(json!({
        "endpoint": endpoint,
        "verkey": identity.verkey,
    }))
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Build a fresh invitation and the inviter-side interaction that goes with it.
///
/// The invitation is delivered out of band; whoever accepts it threads
/// their request to its `@id`.
pub fn create_invitation(identity: &AgentIdentity) -> DcommResult<(Value, Interaction)> {
    let endpoint = identity
        .endpoint
        .as_deref()
        .ok_or_else(|| DcommError::Config("agent has no endpoint to put in an invitation".to_string()))?;
    let keys: Vec<&str> = identity.verkey.as_deref().into_iter().collect();

    let msg = Message::new(sov_type(&protocol(), INVITATION))
        .with_field("label", identity.label.as_str())
        .with_field("recipientKeys", json!(keys))
        .with_field("serviceEndpoint", endpoint);
    let thid = msg.id().to_string();

    // Transition: null -> invited
    let mut machine = connections::inviter()?;
    step(&mut machine, events::SEND_INVITATION)?;

    let mut interaction = Interaction::new(thid, serde_json::to_value(ConnectionData::new(&machine))?);
    interaction.last_sent = Some(Utc::now());
    Ok((msg.finish()?, interaction))
}

pub struct ConnectionsHandler;

impl ConnectionsHandler {
    fn on_invitation(
        &self,
        env: &Envelope,
        obj: &Value,
        machine: &mut StateMachine,
        data: &mut ConnectionData,
        ctx: &mut HandlerContext<'_>,
    ) -> DcommResult<()> {
        // Two invitation shapes are in circulation: keys+endpoint, and key+endpoint.
        let keys: Vec<String> = match obj.get("recipientKeys").and_then(Value::as_array) {
            Some(list) => list.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            None => str_field(obj, "key").map(str::to_string).into_iter().collect(),
        };
        let endpoint = str_field(obj, "serviceEndpoint").or_else(|| str_field(obj, "endpoint"));
        let Some(endpoint) = endpoint.filter(|_| !keys.is_empty()) else {
            return Err(anomaly(
                machine,
                "Invitation needs recipientKeys and serviceEndpoint; connecting with public DIDs isn't supported.",
            ));
        };

        let request = Message::reply_to(sov_type(&protocol(), REQUEST), env)
            .with_field("label", ctx.identity.label.as_str())
            .with_field("connection", my_connection(ctx.identity)?);
        ctx.send(request, Some(endpoint.to_string()), keys.clone())?;

        // Transition: invited -> requested
        step(machine, events::SEND_CONN_REQ)?;
        data.their_label = str_field(obj, "label").map(str::to_string);
        data.their_endpoint = Some(endpoint.to_string());
        data.their_key = keys.into_iter().next();
        Ok(())
    }

    fn on_request(
        &self,
        env: &Envelope,
        obj: &Value,
        machine: &mut StateMachine,
        data: &mut ConnectionData,
        ctx: &mut HandlerContext<'_>,
    ) -> DcommResult<()> {
        let conn = obj.get("connection").cloned().unwrap_or(Value::Null);
        let Some(endpoint) = str_field(&conn, "endpoint") else {
            return Err(anomaly(machine, "request carries no connection endpoint."));
        };
        let their_key = str_field(&conn, "verkey").map(str::to_string);

        let response = Message::reply_to(sov_type(&protocol(), RESPONSE), env)
            .with_field("label", ctx.identity.label.as_str())
            .with_field("connection", my_connection(ctx.identity)?);
        ctx.send(response, Some(endpoint.to_string()), their_key.iter().cloned().collect())?;

        // Transition: requested -> responded
        step(machine, events::SEND_CONN_RESP)?;
        data.their_label = str_field(obj, "label").map(str::to_string);
        data.their_endpoint = Some(endpoint.to_string());
        data.their_key = their_key;
        Ok(())
    }

    fn on_response(
        &self,
        env: &Envelope,
        obj: &Value,
        machine: &mut StateMachine,
        data: &mut ConnectionData,
        ctx: &mut HandlerContext<'_>,
    ) -> DcommResult<()> {
        let conn = obj.get("connection").cloned().unwrap_or(Value::Null);
        if let Some(endpoint) = str_field(&conn, "endpoint") {
            data.their_endpoint = Some(endpoint.to_string());
        }
        if let Some(key) = str_field(&conn, "verkey") {
            data.their_key = Some(key.to_string());
        }
        if let Some(label) = str_field(obj, "label") {
            data.their_label = Some(label.to_string());
        }

        let ack = Message::reply_to(sov_type(&protocol(), ACK), env).with_field("status", "OK");
        ctx.send(ack, data.their_endpoint.clone(), data.their_key.iter().cloned().collect())?;

        // Transition: responded -> complete
        step(machine, events::SEND_ACK)?;
        tracing::info!(peer = ?data.their_label, "Connection complete");
        Ok(())
    }
}

impl Handler for ConnectionsHandler {
    fn supported(&self) -> Vec<ProtocolSupport> {
        vec![ProtocolSupport::new(
            protocol(),
            &[INVITATION, REQUEST, RESPONSE, ACK, PROBLEM_REPORT],
            &[INVITER, INVITEE],
        )]
    }

    fn handle(
        &self,
        env: &Envelope,
        msg_type: &MessageTypeUri,
        ctx: &mut HandlerContext<'_>,
    ) -> DcommResult<bool> {
        let name = msg_type.message_name();
        let Some(event) = received_event(name) else {
            return Ok(false);
        };

        // Resume the thread's machine, or start as invitee: an inviter always
        // has a stored thread from the invitation it created.
        let (mut machine, mut data) = match ctx.data() {
            Some(stored) => {
                let data: ConnectionData = serde_json::from_value(stored.clone())?;
                let mut machine = connections::for_role(&data.state_machine.role)?;
                machine.restore(&data.state_machine)?;
                (machine, data)
            }
            None => {
                let machine = connections::invitee()?;
                let data = ConnectionData::new(&machine);
                (machine, data)
            }
        };

        // The trust gate only applies to a step that would otherwise be legal,
        // and reports the state the peer found us in.
        let gated = event == events::RECEIVE_CONN_REQ || event == events::RECEIVE_CONN_RESP;
        if gated && machine.legal_events().contains(&event) {
            let secure = TrustContext::CONFIDENTIALITY | TrustContext::INTEGRITY;
            if env.trust().trust_for(secure) != Some(true) {
                return Err(anomaly(
                    &machine,
                    format!("{name} message must have confidentiality and integrity for protocol to be secure."),
                ));
            }
        }

        // Rejects messages that make no sense in the current state.
        step(&mut machine, event)?;

        let empty = Value::Null;
        let obj = env.obj().unwrap_or(&empty);
        match event {
            events::RECEIVE_INVITATION => self.on_invitation(env, obj, &mut machine, &mut data, ctx)?,
            events::RECEIVE_CONN_REQ => self.on_request(env, obj, &mut machine, &mut data, ctx)?,
            events::RECEIVE_CONN_RESP => self.on_response(env, obj, &mut machine, &mut data, ctx)?,
            events::RECEIVE_ACK => {
                tracing::info!(peer = ?data.their_label, "Connection complete");
            }
            _ => {
                let explain = str_field(obj, "explain").unwrap_or("(no explanation)");
                tracing::warn!(state = machine.state(), "Peer abandoned connection step: {}", explain);
            }
        }

        data.state_machine = machine.snapshot();
        ctx.set_data(serde_json::to_value(&data)?);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcomm_core::connections::states;
    use dcomm_core::{HandlerRegistry, Outbound};

    struct Side {
        identity: AgentIdentity,
        interaction: Option<Interaction>,
    }

    impl Side {
        fn new(label: &str) -> Self {
            Self {
                identity: AgentIdentity {
                    label: label.to_string(),
                    verkey: Some(format!("{label}-key")),
                    endpoint: Some(format!("ram://{label}")),
                },
                interaction: None,
            }
        }

        fn receive(&mut self, message: &Value, secure: bool) -> DcommResult<Vec<Outbound>> {
            let mut env = Envelope::new(serde_json::to_vec(message).unwrap());
            if secure {
                // As if it had arrived packed by a service that guarantees both.
                env.trust_mut()
                    .affirm(TrustContext::CONFIDENTIALITY | TrustContext::INTEGRITY);
            }
            let msg_type = env.parsed_type().unwrap();
            let registry = HandlerRegistry::default();
            // Work on a copy so a failure leaves stored state alone, like the store's transaction.
            let mut working = self.interaction.clone();
            let mut ctx = HandlerContext::new(env.thread_id(), &mut working, &registry, &self.identity);
            assert!(ConnectionsHandler.handle(&env, &msg_type, &mut ctx)?);
            let out = ctx.into_outbox();
            self.interaction = working;
            Ok(out)
        }

        fn state(&self) -> String {
            let data: ConnectionData =
                serde_json::from_value(self.interaction.as_ref().unwrap().data.clone()).unwrap();
            data.state_machine.state
        }
    }

    #[test]
    fn full_handshake() {
        let mut alice = Side::new("alice");
        let mut bob = Side::new("bob");

        let (invitation, stored) = create_invitation(&alice.identity).unwrap();
        assert_eq!(invitation["recipientKeys"], json!(["alice-key"]));
        assert_eq!(invitation["serviceEndpoint"], "ram://alice");
        alice.interaction = Some(stored);
        assert_eq!(alice.state(), states::INVITED);

        let out = bob.receive(&invitation, false).unwrap();
        assert_eq!(bob.state(), states::REQUESTED);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].endpoint.as_deref(), Some("ram://alice"));
        assert_eq!(out[0].recipient_keys, vec!["alice-key".to_string()]);
        let request = out[0].message.clone();
        assert_eq!(request["~thread"]["thid"], invitation["@id"]);
        assert_eq!(request["connection"]["endpoint"], "ram://bob");

        let out = alice.receive(&request, true).unwrap();
        assert_eq!(alice.state(), states::RESPONDED);
        assert_eq!(out[0].endpoint.as_deref(), Some("ram://bob"));
        assert_eq!(out[0].recipient_keys, vec!["bob-key".to_string()]);
        let response = out[0].message.clone();

        let out = bob.receive(&response, true).unwrap();
        assert_eq!(bob.state(), states::COMPLETE);
        let ack = out[0].message.clone();
        assert!(ack["@type"].as_str().unwrap().ends_with("connections/1.0/ack"));

        let out = alice.receive(&ack, false).unwrap();
        assert!(out.is_empty());
        assert_eq!(alice.state(), states::COMPLETE);
    }

    #[test]
    fn request_without_encryption_is_an_anomaly() {
        let mut alice = Side::new("alice");
        let mut bob = Side::new("bob");
        let (invitation, stored) = create_invitation(&alice.identity).unwrap();
        alice.interaction = Some(stored);
        let request = bob.receive(&invitation, false).unwrap()[0].message.clone();

        let err = alice.receive(&request, false).unwrap_err();
        match err {
            DcommError::ProtocolAnomaly { detail, role, state, .. } => {
                assert_eq!(role, INVITER);
                // Named after the state the request arrived in, not where it would lead.
                assert_eq!(state, states::INVITED);
                assert!(detail.contains("confidentiality and integrity"));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Not advanced.
        assert_eq!(alice.state(), states::INVITED);
    }

    #[test]
    fn request_out_of_the_blue_is_an_anomaly() {
        let mut carol = Side::new("carol");
        let request = json!({
            "@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/connections/1.0/request",
            "@id": "r-1",
            "connection": {"endpoint": "ram://x"},
        });
        let err = carol.receive(&request, true).unwrap_err();
        assert!(err.to_string().contains("Can't receive_conn_req from null."));
        assert!(carol.interaction.is_none());
    }

    #[test]
    fn invitation_without_keys_is_refused() {
        let mut bob = Side::new("bob");
        let invitation = json!({
            "@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/connections/1.0/invitation",
            "@id": "i-1",
            "did": "did:sov:public",
        });
        let err = bob.receive(&invitation, false).unwrap_err();
        assert!(matches!(err, DcommError::ProtocolAnomaly { .. }));
        assert!(bob.interaction.is_none());
    }

    #[test]
    fn legacy_invitation_shape() {
        let mut bob = Side::new("bob");
        let invitation = json!({
            "@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/connections/1.0/invitation",
            "@id": "i-2",
            "key": "k",
            "endpoint": "ram://legacy",
        });
        let out = bob.receive(&invitation, false).unwrap();
        assert_eq!(out[0].endpoint.as_deref(), Some("ram://legacy"));
        assert_eq!(out[0].recipient_keys, vec!["k".to_string()]);
    }

    #[test]
    fn problem_report_rewinds_to_invited() {
        let alice = Side::new("alice");
        let mut bob = Side::new("bob");
        let (invitation, _) = create_invitation(&alice.identity).unwrap();
        bob.receive(&invitation, false).unwrap();
        let report = json!({
            "@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/connections/1.0/problem_report",
            "@id": "pr-1",
            "~thread": {"thid": invitation["@id"]},
            "explain": "busy",
        });
        bob.receive(&report, false).unwrap();
        assert_eq!(bob.state(), states::INVITED);
    }
}
