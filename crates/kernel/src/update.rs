//! Per-phase scene work: active-list gathering and world transforms.

use crate::command::{ApplyReport, CommandBuffer};
use crate::reference::{Address, LocalReference, NodeKey};
use crate::registry::ComponentRegistry;
use crate::scene::Scene;
use glam::Affine3A;
use scenery_common::{LifecycleState, UpdatePhase};

impl Scene {
    /// Run one update phase over this scene tree.
    ///
    /// GatherActive rebuilds the registry's active lists, Hierarchy
    /// recomputes world transforms; every phase then dispatches the batched
    /// class updates and applies the commands they queued. `All` runs the
    /// whole sequence in order.
    pub fn update(
        &mut self,
        dt: f32,
        phase: UpdatePhase,
        registry: &mut ComponentRegistry,
    ) -> ApplyReport {
        if phase == UpdatePhase::All {
            let mut report = ApplyReport::default();
            for phase in UpdatePhase::SEQUENCE {
                report.merge(self.update(dt, phase, registry));
            }
            return report;
        }
        let _span = tracing::trace_span!("scene_update", ?phase).entered();
        match phase {
            UpdatePhase::GatherActive => {
                registry.clear_active();
                let gathered = self.gather_active(registry);
                tracing::trace!(gathered, "gathered active components");
            }
            UpdatePhase::Hierarchy => self.update_hierarchy(Affine3A::IDENTITY),
            _ => {}
        }
        let mut commands = CommandBuffer::new();
        registry.dispatch(dt, phase, self, &mut commands);
        let mut report = self.apply_commands(&mut commands, registry);
        report.merge(self.flush_deferred(registry));
        report
    }

    /// Push every PostInit component reachable through active nodes onto
    /// its class's active list. Inactive nodes prune their subtree.
    pub(crate) fn gather_active(&self, registry: &mut ComponentRegistry) -> usize {
        let mut gathered = 0;
        self.traverse(None, |visit| {
            if !visit.node.is_active() {
                return false;
            }
            for key in visit.node.components() {
                let Some(slot) = visit.scene.component(key) else {
                    continue;
                };
                if slot.state() != LifecycleState::PostInit {
                    continue;
                }
                let address = Address::new(visit.hosts.iter().copied().collect(), key);
                if registry.set_active(slot.class(), address) {
                    gathered += 1;
                }
            }
            true
        });
        gathered
    }

    /// Recompute `world` for every node, top-down from the root with
    /// `host_world` as the root's parent. Detached nodes are their own
    /// roots. Nested scenes follow, each under its host's new world.
    pub(crate) fn update_hierarchy(&mut self, host_world: Affine3A) {
        let root = self.root;
        let mut stack: Vec<(NodeKey, Affine3A)> = self
            .nodes
            .iter()
            .filter(|(key, node)| *key != root && node.parent().is_none())
            .map(|(key, _)| (key, Affine3A::IDENTITY))
            .collect();
        stack.push((root, host_world));
        while let Some((key, parent_world)) = stack.pop() {
            let Some(node) = self.nodes.get_mut(key) else {
                continue;
            };
            let world = parent_world * node.local.to_affine();
            node.world = world;
            stack.extend(
                node.children
                    .iter()
                    .filter_map(LocalReference::handle)
                    .map(|child| (child, world)),
            );
        }
        for host in self.hosts.clone() {
            let Some(node) = self.nodes.get_mut(host) else {
                continue;
            };
            let world = node.world;
            if let Some(child) = node.child_scene.as_deref_mut() {
                child.update_hierarchy(world);
            }
        }
    }
}
