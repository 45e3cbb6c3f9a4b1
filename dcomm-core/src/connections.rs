//! Connection-establishment state machines for both roles.
//!
//! ```text
//! null -> invited -> requested -> responded -> complete
//! ```
//!
//! Both roles declare every event, so a peer sending a message meant for the
//! other role is an anomaly, not a definition bug.

use crate::error::{DcommError, DcommResult};
use crate::state::StateMachine;

pub const PROTOCOL: &str = "connections/1.0";

pub const INVITER: &str = "inviter";
pub const INVITEE: &str = "invitee";

pub mod states {
    pub const NULL: &str = "null";
    pub const INVITED: &str = "invited";
    pub const REQUESTED: &str = "requested";
    pub const RESPONDED: &str = "responded";
    pub const COMPLETE: &str = "complete";

    pub const ALL: &[&str] = &[NULL, INVITED, REQUESTED, RESPONDED, COMPLETE];
}

pub mod events {
    pub const SEND_INVITATION: &str = "send_invitation";
    pub const RECEIVE_INVITATION: &str = "receive_invitation";
    pub const SEND_CONN_REQ: &str = "send_conn_req";
    pub const RECEIVE_CONN_REQ: &str = "receive_conn_req";
    pub const SEND_CONN_RESP: &str = "send_conn_resp";
    pub const RECEIVE_CONN_RESP: &str = "receive_conn_resp";
    pub const SEND_ACK: &str = "send_ack";
    pub const RECEIVE_ACK: &str = "receive_ack";
    pub const SEND_ERROR: &str = "send_error";
    pub const RECEIVE_ERROR: &str = "receive_error";

    pub const ALL: &[&str] = &[
        SEND_INVITATION,
        RECEIVE_INVITATION,
        SEND_CONN_REQ,
        RECEIVE_CONN_REQ,
        SEND_CONN_RESP,
        RECEIVE_CONN_RESP,
        SEND_ACK,
        RECEIVE_ACK,
        SEND_ERROR,
        RECEIVE_ERROR,
    ];
}

use events::*;
use states::*;

fn base(role: &str) -> DcommResult<StateMachine> {
    let mut sm = StateMachine::new(PROTOCOL, role, states::ALL, events::ALL, NULL)?;
    sm.add_transition(SEND_ERROR, &[REQUESTED], NULL)?;
    sm.add_transition(RECEIVE_ERROR, &[REQUESTED, RESPONDED], INVITED)?;
    Ok(sm)
}

/// The side that publishes an invitation and answers requests.
pub fn inviter() -> DcommResult<StateMachine> {
    let mut sm = base(INVITER)?;
    sm.add_transition(SEND_INVITATION, &[NULL, INVITED], INVITED)?;
    sm.add_transition(RECEIVE_CONN_REQ, &[INVITED, REQUESTED, RESPONDED], REQUESTED)?;
    sm.add_transition(SEND_CONN_RESP, &[REQUESTED], RESPONDED)?;
    sm.add_transition(RECEIVE_ACK, &[RESPONDED, COMPLETE], COMPLETE)?;
    Ok(sm)
}

/// The side that accepts an invitation and sends a request.
pub fn invitee() -> DcommResult<StateMachine> {
    let mut sm = base(INVITEE)?;
    sm.add_transition(RECEIVE_INVITATION, &[NULL, INVITED], INVITED)?;
    sm.add_transition(SEND_CONN_REQ, &[INVITED, REQUESTED, RESPONDED], REQUESTED)?;
    sm.add_transition(RECEIVE_CONN_RESP, &[REQUESTED], RESPONDED)?;
    sm.add_transition(SEND_ACK, &[RESPONDED, COMPLETE], COMPLETE)?;
    // Complaining about a response we already accepted doesn't undo the connection.
    sm.add_transition(SEND_ERROR, &[RESPONDED, COMPLETE], COMPLETE)?;
    Ok(sm)
}

/// Build the machine for a role name.
pub fn for_role(role: &str) -> DcommResult<StateMachine> {
    match role {
        INVITER => inviter(),
        INVITEE => invitee(),
        other => Err(DcommError::Format(format!(
            "\"{other}\" is not a role of {PROTOCOL}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(sm: &mut StateMachine, steps: &[&str]) {
        for step in steps {
            sm.handle(step).unwrap();
        }
    }

    #[test]
    fn inviter_happy_path() {
        let mut sm = inviter().unwrap();
        run(&mut sm, &[SEND_INVITATION, RECEIVE_CONN_REQ, SEND_CONN_RESP, RECEIVE_ACK]);
        assert_eq!(sm.state(), COMPLETE);
        // Duplicate acks are tolerated.
        sm.handle(RECEIVE_ACK).unwrap();
        assert_eq!(sm.state(), COMPLETE);
    }

    #[test]
    fn invitee_happy_path() {
        let mut sm = invitee().unwrap();
        run(&mut sm, &[RECEIVE_INVITATION, SEND_CONN_REQ, RECEIVE_CONN_RESP, SEND_ACK]);
        assert_eq!(sm.state(), COMPLETE);
    }

    #[test]
    fn repeated_request_restarts_negotiation() {
        let mut sm = inviter().unwrap();
        run(&mut sm, &[SEND_INVITATION, RECEIVE_CONN_REQ, SEND_CONN_RESP, RECEIVE_CONN_REQ]);
        assert_eq!(sm.state(), REQUESTED);
    }

    #[test]
    fn error_edges_collapse_back() {
        let mut sm = invitee().unwrap();
        run(&mut sm, &[RECEIVE_INVITATION, SEND_CONN_REQ, RECEIVE_ERROR]);
        assert_eq!(sm.state(), INVITED);

        let mut sm = inviter().unwrap();
        run(&mut sm, &[SEND_INVITATION, RECEIVE_CONN_REQ, SEND_ERROR]);
        assert_eq!(sm.state(), NULL);
    }

    #[test]
    fn invitee_error_after_response_keeps_connection() {
        let mut sm = invitee().unwrap();
        run(&mut sm, &[RECEIVE_INVITATION, SEND_CONN_REQ, RECEIVE_CONN_RESP, SEND_ERROR]);
        assert_eq!(sm.state(), COMPLETE);
        sm.handle(SEND_ERROR).unwrap();
        assert_eq!(sm.state(), COMPLETE);

        // Before a response the shared edge still applies.
        let mut sm = invitee().unwrap();
        run(&mut sm, &[RECEIVE_INVITATION, SEND_CONN_REQ, SEND_ERROR]);
        assert_eq!(sm.state(), NULL);
    }

    #[test]
    fn out_of_order_is_anomaly_not_unknown() {
        let mut sm = inviter().unwrap();
        assert!(matches!(sm.handle(RECEIVE_ACK), Err(DcommError::ProtocolAnomaly { .. })));
        assert!(matches!(
            sm.handle(RECEIVE_INVITATION),
            Err(DcommError::ProtocolAnomaly { .. })
        ));
        assert_eq!(sm.state(), NULL);

        let mut sm = invitee().unwrap();
        assert!(matches!(sm.handle(RECEIVE_CONN_RESP), Err(DcommError::ProtocolAnomaly { .. })));
    }

    #[test]
    fn role_lookup() {
        assert_eq!(for_role(INVITEE).unwrap().role(), INVITEE);
        assert!(for_role("bystander").is_err());
    }
}
