//! Stock components built only on the public component contract.
//!
//! # Invariants
//! - Updates touch only their own node's transforms; anything structural
//!   goes through the batch's command buffer.
//! - A component holding a reference to another node subscribes to that
//!   node's OnShutdown and drops the reference when notified.

use glam::{Affine3A, Quat, Vec3};
use scenery_common::{SceneGlobalId, SceneId, Serializer, UpdatePhase};
use scenery_kernel::{
    Behavior, ComponentBatch, ComponentContext, ComponentRegistry, ComponentType,
    GlobalReference, NodeAddress, NodeEvent, RegistryError, SceneCommand, SceneNode, ScenePath,
};
use std::collections::HashMap;

/// Register every stock class.
pub fn register_stock_components(registry: &mut ComponentRegistry) -> Result<(), RegistryError> {
    registry.register::<Spin>()?;
    registry.register::<Follow>()?;
    Ok(())
}

/// Rotates its node about `axis` at `speed` radians per second during
/// PrePhysics.
#[derive(Debug, Clone, PartialEq)]
pub struct Spin {
    pub axis: Vec3,
    pub speed: f32,
}

impl Default for Spin {
    fn default() -> Self {
        Self {
            axis: Vec3::Y,
            speed: 1.0,
        }
    }
}

impl Behavior for Spin {
    fn serialize(&mut self, s: &mut dyn Serializer) -> bool {
        let mut ok = s.value(&mut self.axis, Some("Axis"));
        ok &= s.value(&mut self.speed, Some("Speed"));
        ok
    }
}

impl ComponentType for Spin {
    const NAME: &'static str = "Spin";

    fn update(batch: &mut ComponentBatch<'_>, dt: f32, phase: UpdatePhase) {
        if phase != UpdatePhase::PrePhysics {
            return;
        }
        batch.for_each::<Spin>(|mut instance| {
            let Some(axis) = instance.component.axis.try_normalize() else {
                return;
            };
            let step = Quat::from_axis_angle(axis, instance.component.speed * dt);
            let local = instance.node.local_mut();
            local.rotation = (step * local.rotation).normalize();
        });
    }
}

/// Moves its node toward another node's world position plus `offset`
/// during PostPhysics.
///
/// The target may live in a nested scene; its global id is relative to the
/// follower's scene. When the target shuts down the reference is dropped,
/// and with `destroy_with_target` the follower's node is destroyed too.
#[derive(Debug, Clone, Default)]
pub struct Follow {
    pub target: GlobalReference<SceneNode>,
    pub offset: Vec3,
    /// Exponential approach rate per second; 0 snaps.
    pub stiffness: f32,
    pub destroy_with_target: bool,
    lost: bool,
    released: bool,
}

impl Follow {
    pub fn new(target: SceneGlobalId) -> Self {
        Self {
            target: GlobalReference::new(target),
            ..Self::default()
        }
    }

    /// Whether the target shut down while followed.
    pub fn lost_target(&self) -> bool {
        self.lost
    }

    fn blend(&self, dt: f32) -> f32 {
        if self.stiffness <= 0.0 {
            1.0
        } else {
            1.0 - (-self.stiffness * dt).exp()
        }
    }
}

impl Behavior for Follow {
    fn post_init(&mut self, ctx: &mut ComponentContext<'_>) -> bool {
        self.lost = false;
        self.released = false;
        if self.target.id().local == SceneId::TRANSIENT {
            return true;
        }
        if !ctx.scene.resolve_global(&mut self.target) {
            tracing::warn!(target_id = %self.target.id(), "follow target does not resolve");
            return true;
        }
        let listener = ctx.address();
        let Some(address) = self.target.handle().cloned() else {
            return true;
        };
        let Some(node) = ctx
            .scene
            .scene_at_mut(&address.hosts)
            .and_then(|scene| scene.node_mut(address.key))
        else {
            return false;
        };
        match node.register_callback(NodeEvent::Shutdown, listener) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%err, "follow could not subscribe to its target");
                false
            }
        }
    }

    fn shutdown(&mut self, ctx: &mut ComponentContext<'_>) {
        let listener = ctx.address();
        let Some(address) = self.target.handle().cloned() else {
            return;
        };
        let node = ctx
            .scene
            .scene_at_mut(&address.hosts)
            .and_then(|scene| scene.node_mut(address.key));
        if let Some(node) = node {
            if node.unregister_callback(NodeEvent::Shutdown, &listener).is_err() {
                tracing::trace!("follow target already dropped its callbacks");
            }
        }
    }

    fn serialize(&mut self, s: &mut dyn Serializer) -> bool {
        let mut ok = self.target.serialize(s, Some("Target"), "");
        ok &= s.value(&mut self.offset, Some("Offset"));
        ok &= s.value(&mut self.stiffness, Some("Stiffness"));
        ok &= s.value(&mut self.destroy_with_target, Some("DestroyWithTarget"));
        ok
    }

    fn on_node_event(&mut self, event: NodeEvent, source: SceneId) {
        if event == NodeEvent::Shutdown && source == self.target.id().local {
            tracing::debug!(%source, "follow target shut down");
            self.target.clear();
            self.lost = true;
        }
    }
}

impl ComponentType for Follow {
    const NAME: &'static str = "Follow";

    fn update(batch: &mut ComponentBatch<'_>, dt: f32, phase: UpdatePhase) {
        if phase != UpdatePhase::PostPhysics {
            return;
        }
        // Goal positions in each follower's parent space, gathered before
        // the mutable pass.
        let mut goals = HashMap::with_capacity(batch.len());
        for address in batch.addresses() {
            let Some(follow) = batch.component::<Follow>(address) else {
                continue;
            };
            let Some(target) = follow.target.handle() else {
                continue;
            };
            let hosts: ScenePath = address.hosts.iter().chain(&target.hosts).copied().collect();
            let Some(target_world) = batch.node(&hosts, target.key).map(SceneNode::world) else {
                continue;
            };
            let parent_world = batch
                .component_node(address)
                .and_then(SceneNode::parent)
                .and_then(|parent| batch.node(&address.hosts, parent))
                .map(SceneNode::world)
                .unwrap_or(Affine3A::IDENTITY);
            let goal = Vec3::from(target_world.translation) + follow.offset;
            goals.insert(address.clone(), parent_world.inverse().transform_point3(goal));
        }

        batch.for_each::<Follow>(|mut instance| {
            let follow = &mut *instance.component;
            if follow.lost {
                if follow.destroy_with_target && !follow.released {
                    follow.released = true;
                    let node = NodeAddress::new(instance.address.hosts.clone(), instance.node.key());
                    instance.commands.push(SceneCommand::DestroyNode(node));
                }
                return;
            }
            let Some(goal) = goals.get(instance.address) else {
                return;
            };
            let t = follow.blend(dt);
            let local = instance.node.local_mut();
            local.position = local.position.lerp(*goal, t);
        });
    }
}
