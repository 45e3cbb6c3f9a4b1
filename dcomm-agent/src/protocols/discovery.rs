//! Protocol discovery: tell a peer which protocols we speak.

use dcomm_core::{
    identifiers_match, DcommResult, Envelope, Handler, HandlerContext, HandlerRegistry, Message,
    MessageTypeUri, ProtocolIdentifierUri, ProtocolSupport,
};
use regex::Regex;
use serde_json::{json, Value};

use super::{sov_protocol, sov_type};

pub const QUERY: &str = "query";
pub const DISCLOSE: &str = "disclose";

pub fn protocol() -> ProtocolIdentifierUri {
    sov_protocol("protocol-discovery", 1, 0)
}

pub fn query_type() -> String {
    sov_type(&protocol(), QUERY)
}

/// Turn a `*` wildcard pattern into an anchored regex.
fn wildcard(query: &str) -> DcommResult<Regex> {
    let pattern = query
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{pattern}$"))
        .map_err(|e| dcomm_core::DcommError::Rejected(format!("Bad discovery query \"{query}\": {e}")))
}

/// Protocols in `registry` whose identifier matches `query`, in registration order.
pub fn disclose(registry: &HandlerRegistry, query: &str) -> DcommResult<Vec<Value>> {
    let pat = wildcard(query)?;
    Ok(registry
        .protocols()
        .into_iter()
        .filter(|info| pat.is_match(&info.protocol.to_string()))
        .map(|info| {
            json!({
                "pid": info.protocol.to_string(),
                "roles": info.roles,
            })
        })
        .collect())
}

pub struct DiscoveryHandler;

impl Handler for DiscoveryHandler {
    fn supported(&self) -> Vec<ProtocolSupport> {
        vec![ProtocolSupport::new(protocol(), &[QUERY, DISCLOSE], &["requester", "responder"])]
    }

    fn handle(
        &self,
        env: &Envelope,
        msg_type: &MessageTypeUri,
        ctx: &mut HandlerContext<'_>,
    ) -> DcommResult<bool> {
        let name = msg_type.message_name();
        if identifiers_match(name, QUERY) {
            let query = env
                .obj()
                .and_then(|o| o.get("query"))
                .and_then(|q| q.as_str())
                .unwrap_or("*");
            let protocols = disclose(ctx.registry, query)?;
            tracing::debug!(query, matched = protocols.len(), "Answering discovery query");
            let reply = Message::reply_to(sov_type(&protocol(), DISCLOSE), env)
                .with_field("protocols", Value::Array(protocols));
            ctx.reply(reply)?;
            return Ok(true);
        }
        if identifiers_match(name, DISCLOSE) {
            let count = env
                .obj()
                .and_then(|o| o.get("protocols"))
                .and_then(|p| p.as_array())
                .map_or(0, Vec::len);
            tracing::info!(protocols = count, "Peer disclosed protocols");
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::builtin_registry;
    use dcomm_core::AgentIdentity;

    #[test]
    fn wildcard_query_filters_registry() {
        let registry = builtin_registry();
        let all = disclose(&registry, "*").unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(
            all[0]["pid"],
            "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/trust_ping/1.0"
        );

        let some = disclose(&registry, "*connections*").unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0]["roles"], json!(["inviter", "invitee"]));

        // Regex metacharacters in the query are literal.
        assert!(disclose(&registry, "did:sov:(.*)").unwrap().is_empty());
    }

    #[test]
    fn query_is_answered_in_thread() {
        let registry = builtin_registry();
        let identity = AgentIdentity::default();
        let env = Envelope::new(format!(
            r#"{{"@type": "{}", "@id": "q-1", "query": "*trust_ping*"}}"#,
            query_type()
        ));
        let msg_type = env.parsed_type().unwrap();
        let mut interaction = None;
        let mut ctx = HandlerContext::new(env.thread_id(), &mut interaction, &registry, &identity);
        assert!(DiscoveryHandler.handle(&env, &msg_type, &mut ctx).unwrap());

        let out = ctx.into_outbox();
        assert_eq!(out.len(), 1);
        let reply = &out[0].message;
        assert!(reply["@type"].as_str().unwrap().ends_with("protocol-discovery/1.0/disclose"));
        assert_eq!(reply["~thread"]["thid"], "q-1");
        assert_eq!(reply["protocols"].as_array().unwrap().len(), 1);
    }
}
