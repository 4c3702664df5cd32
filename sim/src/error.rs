//! Error types for the bonding and batch layers.

use crate::bonding::{BondId, EntityId, SiteId};
use crate::physics::ActorHandle;
use thiserror::Error;

/// Result alias used across the crate.
pub type SimResult<T> = Result<T, SimError>;

/// Errors raised by the bond manager, the physics boundary and the batch runner.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    #[error("entity {entity} has no bonding site {site}")]
    SiteNotFound { entity: EntityId, site: SiteId },

    #[error("site {site} on entity {entity} cannot accept a bond: {reason}")]
    SiteUnavailable {
        entity: EntityId,
        site: SiteId,
        reason: &'static str,
    },

    #[error("bond {0} not found")]
    BondNotFound(BondId),

    #[error("unknown bond type '{0}'")]
    UnknownBondType(String),

    #[error("actor {0:?} not found in scene")]
    ActorNotFound(ActorHandle),

    #[error("joint creation failed for bond type '{0}'")]
    JointCreationFailed(String),

    #[error("invalid actor description: {0}")]
    InvalidActor(String),

    #[error("scene factory failed: {0}")]
    SceneFactory(String),

    #[error("no scene factory set")]
    MissingSceneFactory,

    #[error("replicate panicked: {0}")]
    ReplicatePanic(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
