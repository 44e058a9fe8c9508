use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const SYSTEM_ACTOR_ID: &str = "system";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Write,
    Approve,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Approve => "approve",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "approve" => Some(Self::Approve),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity attached to every core call. Authentication happens upstream;
/// the core only checks the capability set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_id: String,
    pub role: String,
    pub capabilities: BTreeSet<Capability>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl Actor {
    pub fn new(
        actor_id: impl Into<String>,
        role: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            role: role.into(),
            capabilities: capabilities.into_iter().collect(),
            ip_address: None,
            user_agent: None,
        }
    }

    /// Internal actor used for time-driven transitions such as expiry.
    pub fn system() -> Self {
        Self::new(SYSTEM_ACTOR_ID, "system", [Capability::Read])
    }

    pub fn with_origin(
        mut self,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}
