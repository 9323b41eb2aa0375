//! Identity types shared by snapshots, commands and event envelopes.
//!
//! An aggregate is addressed by `(type, identifier)` and carries a version that
//! grows by exactly one with every successful mutation. Events are routed by the
//! [`RootContextIdentifier`] of the top-level business context they belong to.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of an aggregate type, e.g. `USER` or `PROJECT`.
///
/// Values are trimmed and upper-cased so that `"user"` and `" USER "` address the
/// same listener.
///
/// ```rust
/// use klio::AggregateType;
///
/// let ty = AggregateType::try_new(" user ").unwrap();
/// assert_eq!(ty.as_ref(), "USER");
/// assert!(AggregateType::try_new("   ").is_err());
/// ```
#[nutype(
    sanitize(trim, uppercase),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Display,
        Serialize,
        Deserialize,
        TryFrom
    )
)]
pub struct AggregateType(String);

/// Version of an aggregate.
///
/// `0` means "not yet persisted"; the first persisted state is version `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateVersion(u64);

impl AggregateVersion {
    pub const INITIAL: AggregateVersion = AggregateVersion(0);

    pub fn new(version: u64) -> Self {
        Self(version)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_initial(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for AggregateVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique address of one aggregate at one version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateIdentifier {
    #[serde(rename = "type")]
    pub aggregate_type: AggregateType,
    pub identifier: Uuid,
    pub version: AggregateVersion,
}

impl AggregateIdentifier {
    pub fn new(aggregate_type: AggregateType, identifier: Uuid, version: AggregateVersion) -> Self {
        Self {
            aggregate_type,
            identifier,
            version,
        }
    }

    pub fn with_version(&self, version: AggregateVersion) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }
}

impl std::fmt::Display for AggregateIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}@{}", self.aggregate_type, self.identifier, self.version)
    }
}

/// The top-level context (tenant, project, ...) an aggregate belongs to.
///
/// All events sharing a root context land on the same log partition and are
/// therefore delivered in publish order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RootContextIdentifier(pub Uuid);

impl RootContextIdentifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Stable partition assignment for a log with `partitions` partitions.
    pub fn partition(&self, partitions: u32) -> u32 {
        if partitions == 0 {
            return 0;
        }
        (self.0.as_u128() % u128::from(partitions)) as u32
    }
}

impl Default for RootContextIdentifier {
    fn default() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RootContextIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const SYSTEM_ACTOR: Uuid = Uuid::from_u128(0xc37d_a4f9_7b55_4b2c_9d6c_5d0f_7a1e_0001);

/// The identity a command is executed on behalf of.
///
/// Internal housekeeping runs as [`Actor::system`], which is an ordinary value
/// passed at the call site rather than ambient state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(Uuid);

impl Actor {
    pub fn new(identifier: Uuid) -> Self {
        Self(identifier)
    }

    pub fn system() -> Self {
        Self(SYSTEM_ACTOR)
    }

    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_ACTOR
    }

    pub fn identifier(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_system() {
            write!(f, "system")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
