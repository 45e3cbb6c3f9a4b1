//! Incoming problem reports are logged, nothing more.

use dcomm_core::message::SOV_DOC_URI;
use dcomm_core::{
    DcommResult, Envelope, Handler, HandlerContext, MessageTypeUri, ProtocolIdentifierUri,
    ProtocolSupport, Semver,
};

pub const PROBLEM_REPORT: &str = "problem-report";

pub fn protocol() -> ProtocolIdentifierUri {
    ProtocolIdentifierUri::new(SOV_DOC_URI, "notification", Semver::major_minor(1, 0))
}

pub struct ProblemReportHandler;

impl Handler for ProblemReportHandler {
    fn supported(&self) -> Vec<ProtocolSupport> {
        vec![ProtocolSupport::new(protocol(), &[PROBLEM_REPORT], &["notified"])]
    }

    fn handle(
        &self,
        env: &Envelope,
        _msg_type: &MessageTypeUri,
        _ctx: &mut HandlerContext<'_>,
    ) -> DcommResult<bool> {
        let explain = env
            .obj()
            .and_then(|o| o.get("explain"))
            .and_then(|v| v.as_str())
            .unwrap_or("(no explanation)");
        let code = env
            .obj()
            .and_then(|o| o.get("explain~l10n"))
            .and_then(|l| l.get("code"))
            .and_then(|c| c.as_str());
        tracing::warn!(thid = ?env.thid(), code = ?code, "Peer reported a problem: {}", explain);
        Ok(true)
    }
}
