//! # dcomm-core
//!
//! Core library for DComm, a DIDComm-style agent messaging substrate.
//!
//! This crate provides the pieces between "bytes arrived" and "a protocol
//! handler ran": semantic versions and message-type URIs, the trust context,
//! the message envelope, a generic protocol state machine, the handler
//! registry with version-tolerant dispatch, and the interaction store.

pub mod connections;
pub mod crypto;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod identifiers;
pub mod interaction;
pub mod message;
pub mod semver;
pub mod state;
pub mod trust;

pub use crypto::{Crypto, PassthroughCrypto, Unpacked};
pub use dispatch::{
    AgentIdentity, Handler, HandlerContext, HandlerInfo, HandlerRegistry, Outbound,
    ProtocolSupport,
};
pub use envelope::{is_likely_json, is_likely_wire_format, Envelope, MAX_MESSAGE_SIZE};
pub use error::{DcommError, DcommResult, ProblemCode};
pub use identifiers::{compare_identifiers, identifiers_match, MessageTypeUri, ProtocolIdentifierUri};
pub use interaction::{Interaction, InteractionStore};
pub use message::{problem_report, Message, MessageHeader, PROBLEM_REPORT_TYPE};
pub use semver::Semver;
pub use state::{MachineSnapshot, Outcome, StateMachine};
pub use trust::TrustContext;
