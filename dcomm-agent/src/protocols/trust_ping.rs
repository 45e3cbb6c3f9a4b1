//! Trust ping: prove a channel works end to end.

use dcomm_core::{
    identifiers_match, DcommResult, Envelope, Handler, HandlerContext, Message, MessageTypeUri,
    ProtocolIdentifierUri, ProtocolSupport,
};

use super::{sov_protocol, sov_type};

pub const PING: &str = "ping";
pub const PING_RESPONSE: &str = "ping_response";

pub fn protocol() -> ProtocolIdentifierUri {
    sov_protocol("trust_ping", 1, 0)
}

pub fn ping_type() -> String {
    sov_type(&protocol(), PING)
}

pub struct TrustPingHandler;

impl Handler for TrustPingHandler {
    fn supported(&self) -> Vec<ProtocolSupport> {
        vec![ProtocolSupport::new(protocol(), &[PING, PING_RESPONSE], &["sender", "receiver"])]
    }

    fn handle(
        &self,
        env: &Envelope,
        msg_type: &MessageTypeUri,
        ctx: &mut HandlerContext<'_>,
    ) -> DcommResult<bool> {
        let name = msg_type.message_name();
        if identifiers_match(name, PING) {
            // Only an explicit `false` silences the response.
            let wanted = env
                .obj()
                .and_then(|o| o.get("response_requested"))
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            if wanted {
                ctx.reply(Message::reply_to(sov_type(&protocol(), PING_RESPONSE), env))?;
            }
            return Ok(true);
        }
        if identifiers_match(name, PING_RESPONSE) {
            tracing::info!(thid = ?env.thid(), "Ping answered");
            return Ok(true);
        }
        Ok(false)
    }
}
