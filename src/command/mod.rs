//! The command-handling pipeline.
//!
//! A command handler is a linear sequence of steps over a loaded snapshot:
//! version assertion, authorization, preconditions, a pure mutation, and
//! finally the emission of an event through an [`EventBus`]. Every step
//! consumes the handler and returns it; the first failing step records its
//! error and all later steps become no-ops, so the chain reads top to bottom
//! without intermediate `?`.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::Utc;
//! use klio::{
//!     Actor, AggregateType, AggregateVersion, CommandHandler, Committed, EventName, InMemoryLog,
//!     InMemoryOutbox, InMemorySnapshotStore, LocalEventBus, OutboxRelay, RootContextIdentifier,
//!     Snapshot,
//! };
//! use serde::{Deserialize, Serialize};
//! use uuid::Uuid;
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct Project {
//!     name: String,
//!     archived: bool,
//! }
//!
//! # async fn example() -> Result<(), klio::Error> {
//! let log = Arc::new(InMemoryLog::new());
//! log.create_topic("project", 4).await?;
//! let outbox = Arc::new(InMemoryOutbox::new());
//! let store = InMemorySnapshotStore::<Project>::with_outbox("project", outbox.clone());
//! let bus = LocalEventBus::new(store, Arc::new(OutboxRelay::new(outbox, log)));
//!
//! let owner = Actor::new(Uuid::new_v4());
//! let draft = Snapshot::new(
//!     AggregateType::try_new("PROJECT").unwrap(),
//!     Uuid::new_v4(),
//!     RootContextIdentifier::new(),
//!     Project { name: "Tower".into(), archived: false },
//!     owner,
//!     Utc::now(),
//! );
//!
//! let created = CommandHandler::create(draft, owner)
//!     .check_precondition("PROJECT_NAME_REQUIRED", |p| !p.name.is_empty())
//!     .emit_event(EventName::Created)
//!     .to(&bus)
//!     .await?;
//!
//! let Committed::Changed(snapshot) = created else { unreachable!() };
//! assert_eq!(snapshot.version(), AggregateVersion::new(1));
//!
//! let archived = CommandHandler::of(snapshot, owner)
//!     .assert_version_matches(AggregateVersion::new(1))
//!     .check_authorization("NOT_PROJECT_OWNER", &|actor: &Actor, s: &Snapshot<Project>| {
//!         s.auditing_information.created_by == *actor
//!     })
//!     .apply_changes(|p| Project { archived: true, ..p.clone() })
//!     .emit_event(EventName::Updated)
//!     .if_snapshot_was_changed()
//!     .to(&bus)
//!     .await?;
//!
//! assert_eq!(archived.version(), Some(AggregateVersion::new(2)));
//! # Ok(())
//! # }
//! # tokio::runtime::Runtime::new().unwrap().block_on(example()).unwrap();
//! ```

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::event::{EventKey, EventName, Payload};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::{Actor, AggregateType, AggregateVersion, Error};

/// A request to change one aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct Command<C> {
    pub aggregate_type: AggregateType,
    pub target: Uuid,
    /// Client-supplied optimistic lock (e.g. an `If-Match` header).
    pub expected_version: Option<AggregateVersion>,
    pub actor: Actor,
    pub payload: C,
}

impl<C> Command<C> {
    pub fn new(aggregate_type: AggregateType, target: Uuid, actor: Actor, payload: C) -> Self {
        Self {
            aggregate_type,
            target,
            expected_version: None,
            actor,
            payload,
        }
    }

    pub fn expecting(self, version: AggregateVersion) -> Self {
        Self {
            expected_version: Some(version),
            ..self
        }
    }
}

/// Decides whether an actor may act on the current state of an aggregate.
pub trait Authorizer<P>: Send + Sync {
    fn is_authorized(&self, actor: &Actor, snapshot: &Snapshot<P>) -> bool;
}

impl<P, F> Authorizer<P> for F
where
    F: Fn(&Actor, &Snapshot<P>) -> bool + Send + Sync,
{
    fn is_authorized(&self, actor: &Actor, snapshot: &Snapshot<P>) -> bool {
        self(actor, snapshot)
    }
}

/// Outcome of a successful pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum Committed<P> {
    /// Persisted and published at a new version.
    Changed(Snapshot<P>),
    /// The mutation was a no-op; nothing was persisted or published.
    Unchanged(Snapshot<P>),
    /// The aggregate was deleted; this is the published tombstone key.
    Deleted(EventKey),
}

impl<P> Committed<P> {
    pub fn snapshot(&self) -> Option<&Snapshot<P>> {
        match self {
            Committed::Changed(snapshot) | Committed::Unchanged(snapshot) => Some(snapshot),
            Committed::Deleted(_) => None,
        }
    }

    pub fn version(&self) -> Option<AggregateVersion> {
        self.snapshot().map(Snapshot::version)
    }

    pub fn is_changed(&self) -> bool {
        !matches!(self, Committed::Unchanged(_))
    }
}

/// Intermediate state of one command's execution.
#[derive(Debug)]
pub struct CommandHandler<P> {
    original: Option<Snapshot<P>>,
    snapshot: Snapshot<P>,
    actor: Actor,
    at: DateTime<Utc>,
    failure: Option<Error>,
}

impl<P: Payload> CommandHandler<P> {
    /// Starts a pipeline over a persisted snapshot.
    pub fn of(snapshot: Snapshot<P>, actor: Actor) -> Self {
        Self {
            original: Some(snapshot.clone()),
            snapshot,
            actor,
            at: Utc::now(),
            failure: None,
        }
    }

    /// Starts a pipeline for an aggregate that does not exist yet.
    pub fn create(snapshot: Snapshot<P>, actor: Actor) -> Self {
        let failure = (!snapshot.version().is_initial()).then(|| Error::StaleCommand {
            identifier: snapshot.id(),
            expected: AggregateVersion::INITIAL,
            actual: snapshot.version(),
        });
        Self {
            original: None,
            snapshot,
            actor,
            at: Utc::now(),
            failure,
        }
    }

    /// Loads the command's target and checks its expected version.
    pub async fn load<S, C>(store: &S, command: &Command<C>) -> Result<Self, Error>
    where
        S: SnapshotStore<P>,
    {
        let snapshot = store
            .find_or_fail(&command.aggregate_type, command.target)
            .await?;
        let handler = Self::of(snapshot, command.actor);
        Ok(match command.expected_version {
            Some(version) => handler.assert_version_matches(version),
            None => handler,
        })
    }

    /// Overrides the timestamp recorded in the auditing information.
    pub fn at(self, at: DateTime<Utc>) -> Self {
        Self { at, ..self }
    }

    pub fn snapshot(&self) -> &Snapshot<P> {
        &self.snapshot
    }

    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    pub fn actor(&self) -> Actor {
        self.actor
    }

    fn step(mut self, check: impl FnOnce(&Self) -> Option<Error>) -> Self {
        if self.failure.is_none() {
            self.failure = check(&self);
        }
        self
    }

    pub fn assert_version_matches(self, expected: AggregateVersion) -> Self {
        self.step(|handler| {
            let actual = handler.snapshot.version();
            (actual != expected).then(|| Error::StaleCommand {
                identifier: handler.snapshot.id(),
                expected,
                actual,
            })
        })
    }

    /// The system actor passes every authorization check.
    pub fn check_authorization(
        self,
        reason: &str,
        authorizer: &impl Authorizer<P>,
    ) -> Self {
        self.step(|handler| {
            let allowed = handler.actor.is_system()
                || authorizer.is_authorized(&handler.actor, &handler.snapshot);
            (!allowed).then(|| Error::Authorization {
                actor: handler.actor,
                reason: reason.to_string(),
            })
        })
    }

    pub fn check_precondition(self, reason: &str, predicate: impl FnOnce(&P) -> bool) -> Self {
        self.step(|handler| {
            (!predicate(&handler.snapshot.payload)).then(|| Error::precondition(reason))
        })
    }

    pub fn apply_changes(mut self, mutator: impl FnOnce(&P) -> P) -> Self {
        if self.failure.is_none() {
            self.snapshot.payload = mutator(&self.snapshot.payload);
        }
        self
    }

    /// Runs `effect` against the current working state, e.g. to stage a blob upload.
    pub fn with_side_effects(self, effect: impl FnOnce(&P)) -> Self {
        if self.failure.is_none() {
            effect(&self.snapshot.payload);
        }
        self
    }

    pub fn emit_event(self, name: impl Into<EventName>) -> PendingEmission<P> {
        PendingEmission {
            handler: self,
            emission: Emission::Event(name.into()),
            only_if_changed: false,
        }
    }

    /// Deletes the aggregate; `final_event` is published before the tombstone.
    pub fn emit_tombstone(self, final_event: Option<EventName>) -> PendingEmission<P> {
        PendingEmission {
            handler: self,
            emission: Emission::Tombstone(final_event),
            only_if_changed: false,
        }
    }

    /// Ends the pipeline without emitting anything.
    pub fn into_result(self) -> Result<Snapshot<P>, Error> {
        match self.failure {
            Some(error) => Err(error),
            None => Ok(self.snapshot),
        }
    }

    fn was_changed(&self) -> bool {
        self.original
            .as_ref()
            .is_none_or(|original| original.payload != self.snapshot.payload)
    }

    fn audited(&self) -> Snapshot<P> {
        let mut snapshot = self.snapshot.clone();
        snapshot.auditing_information = match self.original {
            None => crate::event::AuditingInformation::created(self.actor, self.at),
            Some(_) => snapshot.auditing_information.modified(self.actor, self.at),
        };
        snapshot
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Emission {
    Event(EventName),
    Tombstone(Option<EventName>),
}

/// A handler with its emission decided, waiting to be committed.
#[derive(Debug)]
pub struct PendingEmission<P> {
    handler: CommandHandler<P>,
    emission: Emission,
    only_if_changed: bool,
}

impl<P: Payload> PendingEmission<P> {
    /// Skips persistence and publication when the mutation left the payload equal.
    pub fn if_snapshot_was_changed(self) -> Self {
        Self {
            only_if_changed: true,
            ..self
        }
    }

    pub fn failure(&self) -> Option<&Error> {
        self.handler.failure()
    }

    pub fn snapshot(&self) -> &Snapshot<P> {
        self.handler.snapshot()
    }

    /// Persists and publishes through `bus`.
    ///
    /// Conflicts surface as [`Error::Concurrency`]; reloading and retrying is
    /// the caller's decision (see [`crate::execute`]).
    #[tracing::instrument(skip_all, fields(aggregate = %self.handler.snapshot.identifier, actor = %self.handler.actor))]
    pub async fn to<B: EventBus<P>>(self, bus: &B) -> Result<Committed<P>, Error> {
        let mut handler = self.handler;
        if let Some(error) = handler.failure.take() {
            return Err(error);
        }

        match self.emission {
            Emission::Event(name) => {
                if self.only_if_changed && !handler.was_changed() {
                    tracing::debug!("no changes, skipping event");
                    return Ok(Committed::Unchanged(handler.snapshot));
                }
                let mut next = handler.audited();
                next.identifier = next.identifier.with_version(next.version().next());
                bus.emit(next.clone(), name).await?;
                Ok(Committed::Changed(next))
            }
            Emission::Tombstone(final_event) => {
                if handler.original.is_none() {
                    return Err(Error::NotFound {
                        identifier: handler.snapshot.id(),
                    });
                }
                let last = handler.audited();
                let key = bus.emit_tombstone(last, final_event).await?;
                Ok(Committed::Deleted(key))
            }
        }
    }
}
