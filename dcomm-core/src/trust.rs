//! Trust context: what has been proven about one message.
//!
//! Each flag is three-valued. A flag is *affirmed* once proven, *denied* once
//! disproven, and *undefined* until someone evaluates it. Policy code must
//! not read an undefined flag as "false"; [`TrustContext::trust_for`] returns
//! `None` for that case so the distinction survives.

use std::fmt;

/// Flag bits. Order in [`FLAG_TABLE`] is the rendering order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrustContext {
    affirmed: u32,
    denied: u32,
}

impl TrustContext {
    /// Payload is within the size ceiling.
    pub const SIZE_OK: u32 = 1 << 0;
    /// Payload parsed as a JSON object.
    pub const DESERIALIZE_OK: u32 = 1 << 1;
    /// Content was encrypted in transit.
    pub const CONFIDENTIALITY: u32 = 1 << 2;
    /// Content was tamper-evident in transit.
    pub const INTEGRITY: u32 = 1 << 3;
    /// Sender key was proven by the crypto service.
    pub const AUTHENTICATED_ORIGIN: u32 = 1 << 4;
    /// Sender cannot later disown the message.
    pub const NON_REPUDIATION: u32 = 1 << 5;

    /// Create with every flag undefined.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark flags proven.
    pub fn affirm(&mut self, mask: u32) -> &mut Self {
        self.affirmed |= mask;
        self.denied &= !mask;
        self
    }

    /// Mark flags disproven.
    pub fn deny(&mut self, mask: u32) -> &mut Self {
        self.denied |= mask;
        self.affirmed &= !mask;
        self
    }

    /// Forget any evaluation of these flags.
    pub fn undefine(&mut self, mask: u32) -> &mut Self {
        self.affirmed &= !mask;
        self.denied &= !mask;
        self
    }

    /// `Some(false)` if any flag in `mask` is denied, `Some(true)` if all are
    /// affirmed, `None` while some are still undefined.
    pub fn trust_for(&self, mask: u32) -> Option<bool> {
        if self.denied & mask != 0 {
            Some(false)
        } else if self.affirmed & mask == mask {
            Some(true)
        } else {
            None
        }
    }

    pub fn affirmed_bits(&self) -> u32 {
        self.affirmed
    }

    pub fn denied_bits(&self) -> u32 {
        self.denied
    }

    /// True iff any flag is affirmed.
    pub fn any_affirmed(&self) -> bool {
        self.affirmed != 0
    }

    /// One letter per affirmed flag, in table order.
    pub fn initials(&self) -> String {
        self.affirmed_names()
            .filter_map(|name| name.chars().next())
            .collect()
    }

    /// Comma-joined names of affirmed flags, in table order.
    pub fn labels(&self) -> String {
        self.affirmed_names().collect::<Vec<_>>().join(", ")
    }

    fn affirmed_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        FLAG_TABLE
            .iter()
            .filter(|(bit, _)| self.affirmed & bit != 0)
            .map(|(_, name)| *name)
    }
}

/// Every known flag with its display name. Rendering is derived from this table.
pub const FLAG_TABLE: &[(u32, &str)] = &[
    (TrustContext::SIZE_OK, "size_ok"),
    (TrustContext::DESERIALIZE_OK, "deserialize_ok"),
    (TrustContext::CONFIDENTIALITY, "confidentiality"),
    (TrustContext::INTEGRITY, "integrity"),
    (TrustContext::AUTHENTICATED_ORIGIN, "authenticated_origin"),
    (TrustContext::NON_REPUDIATION, "non_repudiation"),
];

impl fmt::Display for TrustContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any_affirmed() {
            write!(f, "{}", self.labels())
        } else {
            write!(f, "zero trust")
        }
    }
}
