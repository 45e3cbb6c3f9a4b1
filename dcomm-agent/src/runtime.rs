//! Agent runtime: poll transports, classify, dispatch, persist, reply.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dcomm_core::trust::TrustContext;
use dcomm_core::{
    problem_report, AgentIdentity, Crypto, DcommError, DcommResult, Envelope, HandlerContext,
    HandlerRegistry, Interaction, InteractionStore, Outbound, PassthroughCrypto, ProblemCode,
};
use dcomm_transport::{Direction, Transport, TransportOptions, TransportRegistry};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, Unroutable};
use crate::protocols::{self, connections};

/// Sends that fail with a retryable error are attempted this many times.
const SEND_ATTEMPTS: u32 = 3;

/// Double the poll delay, capped at `max`.
pub fn next_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// A running agent.
pub struct Agent {
    config: AgentConfig,
    identity: AgentIdentity,
    handlers: HandlerRegistry,
    transports: TransportRegistry,
    store: InteractionStore,
    crypto: Arc<dyn Crypto>,
    cancel: CancellationToken,
}

impl Agent {
    /// Create the agent folder (and default queue) and open its store.
    pub fn new(config: AgentConfig) -> DcommResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.folder)?;
        if config.endpoints.is_empty() {
            std::fs::create_dir_all(config.queue_path())?;
        }
        let store = InteractionStore::open(config.store_path())?
            .with_retention(config.retention())
            .with_cleanup_interval(config.cleanup_interval());
        Ok(Self::with_store(config, store))
    }

    /// Build around an already-open store, with the built-in handlers.
    pub fn with_store(config: AgentConfig, store: InteractionStore) -> Self {
        let identity = AgentIdentity {
            label: config.label.clone(),
            verkey: config.verkey.clone(),
            endpoint: config.public_endpoint(),
        };
        let transports = TransportRegistry::builtin_with(TransportOptions {
            max_message_size: config.max_message_size,
        });
        Self {
            config,
            identity,
            handlers: protocols::builtin_registry(),
            transports,
            store,
            crypto: Arc::new(PassthroughCrypto::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_crypto(mut self, crypto: Arc<dyn Crypto>) -> Self {
        self.crypto = crypto;
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn store(&self) -> &InteractionStore {
        &self.store
    }

    /// Token that stops every poll loop once cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Load every configured endpoint, owner side.
    pub fn open_endpoints(&self) -> DcommResult<Vec<Arc<dyn Transport>>> {
        self.config
            .resolved_endpoints()
            .iter()
            .map(|uri| self.transports.load(uri, Direction::Srcward))
            .collect()
    }

    /// Create a connection invitation and remember our side of it.
    pub fn invite(&self) -> DcommResult<Value> {
        let (invitation, interaction) = connections::create_invitation(&self.identity)?;
        self.store.put(&interaction)?;
        info!(thid = %interaction.thid, "Created invitation");
        Ok(invitation)
    }

    /// Poll every endpoint concurrently until cancelled.
    pub async fn run(self: Arc<Self>) -> DcommResult<()> {
        let endpoints = self.open_endpoints()?;
        let mut tasks = JoinSet::new();
        for transport in endpoints {
            info!(endpoint = transport.endpoint(), "Polling");
            let agent = Arc::clone(&self);
            tasks.spawn(async move { agent.poll(transport).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Poll task failed");
            }
        }
        info!("Agent stopped");
        Ok(())
    }

    /// Poll one transport until cancelled, backing off while it is idle.
    pub async fn poll(&self, transport: Arc<dyn Transport>) {
        let initial = self.config.poll.initial();
        let max = self.config.poll.max();
        let mut delay = initial;

        while !self.cancel.is_cancelled() {
            match self.poll_once(&transport).await {
                Ok(true) => {
                    delay = initial;
                    continue;
                }
                Ok(false) => {}
                Err(e) => warn!(endpoint = transport.endpoint(), error = %e, "Receive failed"),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_delay(delay, max);
        }
        debug!(endpoint = transport.endpoint(), "Poll loop finished");
    }

    /// Take and handle at most one message. Returns whether one was taken.
    pub async fn poll_once(&self, transport: &Arc<dyn Transport>) -> DcommResult<bool> {
        let Some(env) = transport.receive(None).await? else {
            return Ok(false);
        };
        if let Err(e) = self.handle_envelope(env, transport).await {
            error!(error = %e, "Failed to handle message");
        }
        self.maybe_cleanup();
        Ok(true)
    }

    /// Run one envelope through classification, dispatch and reply.
    pub async fn handle_envelope(&self, mut env: Envelope, arrival: &Arc<dyn Transport>) -> DcommResult<()> {
        info!("Received {}", env);

        if env.raw().len() > self.config.max_message_size
            || env.trust().trust_for(TrustContext::SIZE_OK) == Some(false)
        {
            let reason = format!("Message exceeds {} bytes.", self.config.max_message_size);
            return self.reject(&env, arrival, &reason).await;
        }

        if env.ciphertext().is_some() {
            match self.crypto.unpack(env.raw()).await {
                Ok(unpacked) => env.apply_unpacked(unpacked, self.crypto.guarantees()),
                Err(e) => {
                    warn!(error = %e, "Can't unpack {}", env);
                    return self.unroutable(&env, "unpack failed").await;
                }
            }
        }

        if env.obj().is_none() {
            return self.reject(&env, arrival, "Message is not a JSON object.").await;
        }

        let msg_type = match env.parsed_type() {
            Ok(msg_type) => msg_type,
            Err(e) => {
                return self
                    .answer_problem(&env, arrival, &e.to_string(), e.problem_code())
                    .await
            }
        };

        let Some(info) = self.handlers.find_handler(&msg_type) else {
            return self.unroutable(&env, "no handler for this type").await;
        };
        debug!(protocol = %info.protocol, "Dispatching {}", env);

        let thid = env.thread_id().map(str::to_string);
        let received_at = env.in_time();
        let dispatch = |interaction: &mut Option<Interaction>| -> DcommResult<(bool, Vec<Outbound>)> {
            let mut ctx = HandlerContext::new(thid.as_deref(), interaction, &self.handlers, &self.identity);
            let handled = info.handler.handle(&env, &msg_type, &mut ctx)?;
            let outbox = ctx.into_outbox();
            if let Some(current) = interaction.as_mut() {
                current.last_received = Some(received_at);
            }
            Ok((handled, outbox))
        };
        // Read-modify-write of a thread is atomic; unthreaded messages have nothing to persist.
        let result = match thid.as_deref() {
            Some(t) => self.store.transact(t, dispatch),
            None => dispatch(&mut None),
        };

        match result {
            Ok((true, outbox)) => {
                let mut delivered = 0;
                for out in outbox {
                    match self.deliver(out, &env, arrival).await {
                        Ok(()) => delivered += 1,
                        Err(e) => warn!(error = %e, "Failed to deliver reply to {}", env),
                    }
                }
                if delivered > 0 {
                    if let Some(t) = thid.as_deref() {
                        self.mark_sent(t)?;
                    }
                }
                Ok(())
            }
            Ok((false, _)) => self.unroutable(&env, "handler declined it").await,
            Err(e @ DcommError::UnknownEvent { .. }) => {
                // A protocol definition bug, not the peer's fault.
                error!(error = %e, "Handler fired an undeclared event for {}", env);
                Err(e)
            }
            Err(e @ DcommError::ProtocolAnomaly { .. }) => {
                warn!(error = %e, "Protocol anomaly in {}", env);
                self.answer_problem(&env, arrival, &e.to_string(), e.problem_code())
                    .await
            }
            Err(e) => {
                error!(error = %e, "Handler failed on {}", env);
                self.answer_problem(&env, arrival, &e.to_string(), e.problem_code())
                    .await
            }
        }
    }

    /// Pack (when keys are known) and send one queued message.
    async fn deliver(&self, out: Outbound, incoming: &Envelope, arrival: &Arc<dyn Transport>) -> DcommResult<()> {
        let plaintext = serde_json::to_vec(&out.message)?;
        let keys = if out.recipient_keys.is_empty() && out.endpoint.is_none() {
            // A plain reply goes back packed for whoever proved they sent it.
            incoming.sender_key().map(|k| vec![k.to_string()]).unwrap_or_default()
        } else {
            out.recipient_keys
        };
        let payload = if keys.is_empty() {
            plaintext
        } else {
            self.crypto
                .pack(&plaintext, self.identity.verkey.as_deref(), &keys)
                .await?
        };

        let transport = match &out.endpoint {
            Some(uri) => self.transports.load(uri, Direction::Destward)?,
            None => Arc::clone(arrival),
        };
        let id = self.send_with_retry(&transport, &payload).await?;
        debug!(id = %id, endpoint = transport.endpoint(), packed = !keys.is_empty(), "Sent message");
        Ok(())
    }

    async fn send_with_retry(&self, transport: &Arc<dyn Transport>, payload: &[u8]) -> DcommResult<String> {
        let mut delay = self.config.poll.initial();
        let mut attempt = 1;
        loop {
            match transport.send(payload, None).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_retryable() && attempt < SEND_ATTEMPTS => {
                    warn!(attempt, error = %e, endpoint = transport.endpoint(), "Send failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay, self.config.poll.max());
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn mark_sent(&self, thid: &str) -> DcommResult<()> {
        self.store.transact(thid, |interaction| {
            if let Some(current) = interaction.as_mut() {
                current.last_sent = Some(Utc::now());
            }
            Ok(())
        })
    }

    async fn reject(&self, env: &Envelope, arrival: &Arc<dyn Transport>, reason: &str) -> DcommResult<()> {
        warn!("Rejected {}: {}", env, reason);
        self.answer_problem(env, arrival, reason, ProblemCode::MalformedMessage)
            .await
    }

    /// Reply with a problem report, if there is any way to correlate one.
    async fn answer_problem(
        &self,
        env: &Envelope,
        arrival: &Arc<dyn Transport>,
        explain: &str,
        code: ProblemCode,
    ) -> DcommResult<()> {
        if env.thread_id().is_none() && env.sender_key().is_none() {
            warn!("No way to answer {}: {}", env, explain);
            return Ok(());
        }
        let out = Outbound {
            message: problem_report(Some(env), explain, Some(code))?.finish()?,
            recipient_keys: Vec::new(),
            endpoint: None,
        };
        self.deliver(out, env, arrival).await
    }

    async fn unroutable(&self, env: &Envelope, reason: &str) -> DcommResult<()> {
        match self.config.unroutable {
            Unroutable::Drop => {
                warn!("Dropping {} ({})", env, reason);
                Ok(())
            }
            Unroutable::Quarantine => {
                let dir = self.config.quarantine_path();
                tokio::fs::create_dir_all(&dir).await?;
                let path = dir.join(format!("{}.msg", uuid::Uuid::new_v4()));
                tokio::fs::write(&path, env.raw()).await?;
                warn!(path = %path.display(), "Quarantined {} ({})", env, reason);
                Ok(())
            }
        }
    }

    fn maybe_cleanup(&self) {
        match self.store.cleanup(false) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Cleaned up stale interactions"),
            Err(e) => warn!(error = %e, "Interaction cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::connections::ConnectionData;
    use async_trait::async_trait;
    use dcomm_core::connections::states;
    use dcomm_core::message::SOV_DOC_URI;
    use dcomm_core::{
        Handler, Message, MessageTypeUri, ProtocolIdentifierUri, ProtocolSupport, Semver, Unpacked,
        PROBLEM_REPORT_TYPE,
    };
    use dcomm_transport::RamTransport;
    use serde_json::json;

    /// Pass-through packing, but claiming real guarantees, so trust-gated
    /// steps can be exercised end to end.
    struct TrustedPassthrough(PassthroughCrypto);

    #[async_trait]
    impl Crypto for TrustedPassthrough {
        async fn pack(&self, plaintext: &[u8], sender_key: Option<&str>, recipients: &[String]) -> DcommResult<Vec<u8>> {
            self.0.pack(plaintext, sender_key, recipients).await
        }

        async fn unpack(&self, wire: &[u8]) -> DcommResult<Unpacked> {
            self.0.unpack(wire).await
        }
    }

    fn unique(name: &str) -> String {
        format!("ram://{name}-{}", uuid::Uuid::new_v4())
    }

    fn agent(dir: &std::path::Path, endpoint: &str, label: &str) -> Agent {
        let config = AgentConfig::with_folder(dir)
            .with_label(label)
            .with_verkey(format!("{label}-key"))
            .with_endpoints(vec![endpoint.to_string()]);
        Agent::with_store(config, InteractionStore::open_in_memory().unwrap())
    }

    async fn reply_to(peer: &RamTransport) -> Value {
        let env = peer.receive(None).await.unwrap().expect("a reply");
        serde_json::from_slice(env.raw()).unwrap()
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let max = Duration::from_millis(4000);
        let mut d = Duration::from_millis(250);
        let mut seen = Vec::new();
        for _ in 0..6 {
            d = next_delay(d, max);
            seen.push(d.as_millis());
        }
        assert_eq!(seen, vec![500, 1000, 2000, 4000, 4000, 4000]);
    }

    #[tokio::test]
    async fn trust_ping_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let uri = unique("ping");
        let agent = agent(dir.path(), &uri, "pinger");
        let endpoints = agent.open_endpoints().unwrap();
        let peer = RamTransport::new(&uri, Direction::Destward);

        peer.send(
            br#"{"@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/trust_ping/1.0/ping", "@id": "ping-1"}"#,
            None,
        )
        .await
        .unwrap();
        assert!(agent.poll_once(&endpoints[0]).await.unwrap());
        assert!(!agent.poll_once(&endpoints[0]).await.unwrap());

        let reply = reply_to(&peer).await;
        assert!(reply["@type"].as_str().unwrap().ends_with("trust_ping/1.0/ping_response"));
        assert_eq!(reply["~thread"]["thid"], "ping-1");
    }

    #[tokio::test]
    async fn anomaly_is_answered_with_problem_report() {
        let dir = tempfile::tempdir().unwrap();
        let uri = unique("anomaly");
        let agent = agent(dir.path(), &uri, "a");
        let endpoints = agent.open_endpoints().unwrap();
        let peer = RamTransport::new(&uri, Direction::Destward);

        let request = json!({
            "@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/connections/1.0/request",
            "@id": "req-1",
            "connection": {"endpoint": "ram://nowhere"},
        });
        peer.send(&serde_json::to_vec(&request).unwrap(), None).await.unwrap();
        agent.poll_once(&endpoints[0]).await.unwrap();

        let report = reply_to(&peer).await;
        assert_eq!(report["@type"], PROBLEM_REPORT_TYPE);
        assert_eq!(report["~thread"]["thid"], "req-1");
        assert_eq!(report["explain~l10n"]["code"], "protocol_anomaly");
        assert!(report["explain"].as_str().unwrap().contains("Can't receive_conn_req from null."));
        // Nothing persisted for the rejected thread.
        assert!(agent.store().get("req-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_type_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let uri = unique("malformed");
        let agent = agent(dir.path(), &uri, "m");
        let endpoints = agent.open_endpoints().unwrap();
        let peer = RamTransport::new(&uri, Direction::Destward);

        peer.send(br#"{"@type": "garbage", "@id": "g-1"}"#, None).await.unwrap();
        agent.poll_once(&endpoints[0]).await.unwrap();
        let report = reply_to(&peer).await;
        assert_eq!(report["explain~l10n"]["code"], "malformed_type");
        assert_eq!(report["~thread"]["thid"], "g-1");
    }

    #[tokio::test]
    async fn oversize_is_rejected_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let uri = unique("oversize");
        let mut config = AgentConfig::with_folder(dir.path()).with_endpoints(vec![uri.clone()]);
        config.max_message_size = 64;
        let agent = Agent::with_store(config, InteractionStore::open_in_memory().unwrap());
        let endpoints = agent.open_endpoints().unwrap();
        let peer = RamTransport::new(&uri, Direction::Destward);

        let big = json!({
            "@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/trust_ping/1.0/ping",
            "@id": "big-1",
            "padding": "x".repeat(200),
        });
        peer.send(&serde_json::to_vec(&big).unwrap(), None).await.unwrap();
        agent.poll_once(&endpoints[0]).await.unwrap();
        let report = reply_to(&peer).await;
        assert_eq!(report["@type"], PROBLEM_REPORT_TYPE);
        assert_eq!(report["explain~l10n"]["code"], "malformed_message");
    }

    #[tokio::test]
    async fn garbage_without_identity_is_dropped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let uri = unique("garbage");
        let agent = agent(dir.path(), &uri, "g");
        let endpoints = agent.open_endpoints().unwrap();
        let peer = RamTransport::new(&uri, Direction::Destward);

        peer.send(b"hello there", None).await.unwrap();
        assert!(agent.poll_once(&endpoints[0]).await.unwrap());
        assert!(peer.receive(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unroutable_messages_are_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let uri = unique("quarantine");
        let config = AgentConfig::with_folder(dir.path())
            .with_endpoints(vec![uri.clone()])
            .with_unroutable(Unroutable::Quarantine);
        let agent = Agent::with_store(config, InteractionStore::open_in_memory().unwrap());
        let endpoints = agent.open_endpoints().unwrap();
        let peer = RamTransport::new(&uri, Direction::Destward);

        let raw = br#"{"@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/tictactoe/1.0/move", "@id": "t-1"}"#;
        peer.send(raw, None).await.unwrap();
        agent.poll_once(&endpoints[0]).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path().join("quarantine"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(&files[0]).unwrap(), raw.to_vec());
        assert!(peer.receive(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connection_handshake_between_two_agents() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let alice_uri = unique("alice");
        let bob_uri = unique("bob");
        let crypto: Arc<dyn Crypto> = Arc::new(TrustedPassthrough(PassthroughCrypto::new()));
        let alice = agent(dir_a.path(), &alice_uri, "alice").with_crypto(crypto.clone());
        let bob = agent(dir_b.path(), &bob_uri, "bob").with_crypto(crypto);
        let alice_in = alice.open_endpoints().unwrap();
        let bob_in = bob.open_endpoints().unwrap();

        let invitation = alice.invite().unwrap();
        let thid = invitation["@id"].as_str().unwrap().to_string();

        // Out of band: hand the invitation to bob.
        let courier = RamTransport::new(&bob_uri, Direction::Destward);
        courier
            .send(&serde_json::to_vec(&invitation).unwrap(), None)
            .await
            .unwrap();

        assert!(bob.poll_once(&bob_in[0]).await.unwrap()); // invitation -> request
        assert!(alice.poll_once(&alice_in[0]).await.unwrap()); // request -> response
        assert!(bob.poll_once(&bob_in[0]).await.unwrap()); // response -> ack
        assert!(alice.poll_once(&alice_in[0]).await.unwrap()); // ack

        let state_of = |agent: &Agent| {
            let interaction = agent.store().get(&thid).unwrap().unwrap();
            let data: ConnectionData = serde_json::from_value(interaction.data).unwrap();
            (data.state_machine.state, interaction.last_received, data.their_label)
        };
        let (state, received, peer) = state_of(&alice);
        assert_eq!(state, states::COMPLETE);
        assert!(received.is_some());
        assert_eq!(peer.as_deref(), Some("bob"));
        let (state, _, peer) = state_of(&bob);
        assert_eq!(state, states::COMPLETE);
        assert_eq!(peer.as_deref(), Some("alice"));
        assert!(bob.store().get(&thid).unwrap().unwrap().last_sent.is_some());
    }

    #[tokio::test]
    async fn plaintext_request_is_not_trusted() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let alice_uri = unique("alice-pt");
        let bob_uri = unique("bob-pt");
        // The development crypto guarantees nothing, so the request fails the trust gate.
        let alice = agent(dir_a.path(), &alice_uri, "alice");
        let bob = agent(dir_b.path(), &bob_uri, "bob");
        let alice_in = alice.open_endpoints().unwrap();
        let bob_in = bob.open_endpoints().unwrap();

        let invitation = alice.invite().unwrap();
        let thid = invitation["@id"].as_str().unwrap().to_string();
        RamTransport::new(&bob_uri, Direction::Destward)
            .send(&serde_json::to_vec(&invitation).unwrap(), None)
            .await
            .unwrap();
        bob.poll_once(&bob_in[0]).await.unwrap();
        alice.poll_once(&alice_in[0]).await.unwrap();

        let interaction = alice.store().get(&thid).unwrap().unwrap();
        let data: ConnectionData = serde_json::from_value(interaction.data).unwrap();
        assert_eq!(data.state_machine.state, states::INVITED);
    }

    /// Remembers the thread, then tries to forward to an endpoint no transport serves.
    struct Forwarder;

    impl Handler for Forwarder {
        fn supported(&self) -> Vec<ProtocolSupport> {
            vec![ProtocolSupport::new(
                ProtocolIdentifierUri::new(SOV_DOC_URI, "forward", Semver::major_minor(1, 0)),
                &["forward"],
                &["mediator"],
            )]
        }

        fn handle(&self, _env: &Envelope, _msg_type: &MessageTypeUri, ctx: &mut HandlerContext<'_>) -> DcommResult<bool> {
            ctx.set_data(json!({"forwarded": true}));
            ctx.send(Message::new("x/1.0/y"), Some("nowhere://far".to_string()), Vec::new())?;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn failed_delivery_does_not_stamp_last_sent() {
        let dir = tempfile::tempdir().unwrap();
        let uri = unique("forward");
        let agent = agent(dir.path(), &uri, "mediator")
            .with_handlers(HandlerRegistry::builder().register(Arc::new(Forwarder)).build());
        let endpoints = agent.open_endpoints().unwrap();
        let peer = RamTransport::new(&uri, Direction::Destward);

        peer.send(
            br#"{"@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/forward/1.0/forward", "@id": "f-1"}"#,
            None,
        )
        .await
        .unwrap();
        agent.poll_once(&endpoints[0]).await.unwrap();

        let interaction = agent.store().get("f-1").unwrap().unwrap();
        assert_eq!(interaction.data, json!({"forwarded": true}));
        assert!(interaction.last_received.is_some());
        assert!(interaction.last_sent.is_none());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let uri = unique("run");
        let agent = Arc::new(agent(dir.path(), &uri, "runner"));
        let token = agent.cancellation_token();
        let handle = tokio::spawn(Arc::clone(&agent).run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let finished = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(finished.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn default_endpoint_is_a_folder_queue() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::new(AgentConfig::with_folder(dir.path())).unwrap();
        assert!(dir.path().join("queue").is_dir());
        assert!(dir.path().join("interactions.db").is_file());
        let endpoints = agent.open_endpoints().unwrap();
        assert_eq!(endpoints.len(), 1);
        assert!(!agent.poll_once(&endpoints[0]).await.unwrap());
    }
}
