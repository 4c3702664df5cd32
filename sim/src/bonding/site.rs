//! Bonding site definitions.

use super::properties::PropertyMap;
use super::SiteId;
use crate::physics::Pose;
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// A point on an entity, in its body frame, where bonds can form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BondingSiteDef {
    /// Identifier, unique within the owning entity.
    pub site_id: SiteId,
    /// Offset from the entity origin.
    pub local_position: Vec3,
    /// Preferred bond direction (unit vector).
    pub local_direction: Vec3,
    /// Maximum simultaneous bonds at this site.
    pub max_valency: u32,
    pub site_type: String,
    /// Site types this site accepts; empty accepts any.
    pub compatible_types: Vec<String>,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl Default for BondingSiteDef {
    fn default() -> Self {
        Self {
            site_id: 0,
            local_position: Vec3::ZERO,
            local_direction: Vec3::X,
            max_valency: 1,
            site_type: "default".to_string(),
            compatible_types: Vec::new(),
            properties: PropertyMap::new(),
        }
    }
}

impl BondingSiteDef {
    /// Site at `position` pointing along `direction` (normalized here).
    pub fn new(site_id: SiteId, position: Vec3, direction: Vec3) -> Self {
        Self {
            site_id,
            local_position: position,
            local_direction: direction.normalize_or_zero(),
            ..Default::default()
        }
    }

    pub fn with_valency(mut self, max_valency: u32) -> Self {
        self.max_valency = max_valency;
        self
    }

    pub fn with_type(mut self, site_type: impl Into<String>, compatible: &[&str]) -> Self {
        self.site_type = site_type.into();
        self.compatible_types = compatible.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn set_local_direction(&mut self, direction: Vec3) {
        self.local_direction = direction.normalize_or_zero();
    }

    /// Whether this site accepts a partner of `other_type`.
    pub fn is_compatible_with(&self, other_type: &str) -> bool {
        self.compatible_types.is_empty() || self.compatible_types.iter().any(|t| t == other_type)
    }

    #[inline]
    pub fn world_position(&self, pose: &Pose) -> Vec3 {
        pose.transform_point(self.local_position)
    }

    #[inline]
    pub fn world_direction(&self, pose: &Pose) -> Vec3 {
        pose.rotate(self.local_direction)
    }
}
