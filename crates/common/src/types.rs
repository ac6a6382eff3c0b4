use crate::serializer::{Field, Serializer};
use glam::{Affine3A, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Spatial transform: position, rotation, scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    pub fn to_affine(&self) -> Affine3A {
        Affine3A::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Decompose an affine matrix. Shear introduced by non-uniform parent
    /// scale is not representable and is dropped.
    pub fn from_affine(affine: Affine3A) -> Self {
        let (scale, rotation, position) = affine.to_scale_rotation_translation();
        Self {
            position,
            rotation,
            scale,
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Field for Transform {
    fn serialize_field(&mut self, s: &mut dyn Serializer, name: Option<&str>) -> bool {
        if !s.begin_object(name) {
            return false;
        }
        let mut ok = s.value(&mut self.position, Some("Position"));
        ok &= s.value(&mut self.rotation, Some("Rotation"));
        ok &= s.value(&mut self.scale, Some("Scale"));
        s.end_object();
        ok
    }
}

bitflags::bitflags! {
    /// Per-node flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u32 {
        /// Components of this node (and its subtree) take part in updates.
        const ACTIVE = 1 << 0;
        /// Authoring hint: the node is not expected to move.
        const STATIC = 1 << 1;
        /// Id 0, owned by its structural parent, never persisted.
        const TRANSIENT = 1 << 2;
    }
}

impl NodeFlags {
    /// Flags that survive a serialization round-trip.
    pub const PERSISTED: NodeFlags = NodeFlags::ACTIVE.union(NodeFlags::STATIC);
}

/// One stage of the per-frame update sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UpdatePhase {
    GatherActive,
    PrePhysics,
    Hierarchy,
    Physics,
    PostPhysics,
    PreRender,
    /// Runs every phase of [`UpdatePhase::SEQUENCE`] in order.
    All,
}

impl UpdatePhase {
    /// The fixed order phases run in within one frame.
    pub const SEQUENCE: [UpdatePhase; 6] = [
        UpdatePhase::GatherActive,
        UpdatePhase::PrePhysics,
        UpdatePhase::Hierarchy,
        UpdatePhase::Physics,
        UpdatePhase::PostPhysics,
        UpdatePhase::PreRender,
    ];
}

/// Lifecycle shared by worlds, scenes, nodes and components.
///
/// `Shutdown -> Init -> PostInit -> Shutdown`, re-enterable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum LifecycleState {
    #[default]
    Shutdown,
    Init,
    PostInit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_default_is_identity() {
        let t = Transform::default();
        assert_eq!(t.position, Vec3::ZERO);
        assert_eq!(t.rotation, Quat::IDENTITY);
        assert_eq!(t.scale, Vec3::ONE);
        assert_eq!(t.to_affine(), Affine3A::IDENTITY);
    }

    #[test]
    fn transform_affine_round_trip() {
        let t = Transform {
            position: Vec3::new(1.0, -2.0, 3.5),
            rotation: Quat::from_rotation_y(0.75),
            scale: Vec3::splat(2.0),
        };
        let back = Transform::from_affine(t.to_affine());
        assert!(back.position.abs_diff_eq(t.position, 1e-5));
        assert!(back.rotation.abs_diff_eq(t.rotation, 1e-5));
        assert!(back.scale.abs_diff_eq(t.scale, 1e-5));
    }

    #[test]
    fn transient_flag_is_not_persisted() {
        let flags = NodeFlags::ACTIVE | NodeFlags::TRANSIENT;
        assert_eq!(flags & NodeFlags::PERSISTED, NodeFlags::ACTIVE);
    }

    #[test]
    fn phase_sequence_excludes_all() {
        assert!(!UpdatePhase::SEQUENCE.contains(&UpdatePhase::All));
        assert_eq!(UpdatePhase::SEQUENCE[0], UpdatePhase::GatherActive);
        assert_eq!(UpdatePhase::SEQUENCE[5], UpdatePhase::PreRender);
    }
}
