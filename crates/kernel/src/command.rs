//! Deferred structural operations.
//!
//! Anything that adds, removes or re-links objects while a traversal or a
//! batched update is running is queued here and applied between phases, in
//! FIFO order.

use crate::error::SceneError;
use crate::reference::{ComponentAddress, NodeAddress};
use crate::registry::{ClassId, ComponentRegistry};
use crate::scene::Scene;
use scenery_common::SceneId;

/// A structural change addressed relative to the scene that applies it.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneCommand {
    DestroyNode(NodeAddress),
    DestroyComponent(ComponentAddress),
    /// Reparent preserving world pose. Both nodes must share a scene.
    Reparent {
        node: NodeAddress,
        parent: NodeAddress,
    },
    AddComponent {
        node: NodeAddress,
        class: ClassId,
        id: SceneId,
    },
    SetActive {
        node: NodeAddress,
        active: bool,
    },
}

/// FIFO queue of pending structural changes.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<SceneCommand>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: SceneCommand) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SceneCommand> {
        self.commands.iter()
    }

    pub(crate) fn take(&mut self) -> Vec<SceneCommand> {
        std::mem::take(&mut self.commands)
    }
}

/// Outcome of applying a command buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: usize,
}

impl ApplyReport {
    pub fn merge(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.failed += other.failed;
    }
}

impl Scene {
    /// Apply and drain `buffer`. Failed commands are logged and skipped.
    pub fn apply_commands(
        &mut self,
        buffer: &mut CommandBuffer,
        registry: &ComponentRegistry,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        for command in buffer.take() {
            match self.apply_command(&command, registry) {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    tracing::warn!(?command, %err, "skipping deferred command");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Apply the deferred queues of this scene and every nested scene.
    pub fn flush_deferred(&mut self, registry: &ComponentRegistry) -> ApplyReport {
        let mut pending = std::mem::take(&mut self.deferred);
        let mut report = self.apply_commands(&mut pending, registry);
        for host in self.hosts.clone() {
            if let Some(child) = self
                .nodes
                .get_mut(host)
                .and_then(|node| node.child_scene.as_deref_mut())
            {
                report.merge(child.flush_deferred(registry));
            }
        }
        report
    }

    fn apply_command(
        &mut self,
        command: &SceneCommand,
        registry: &ComponentRegistry,
    ) -> Result<(), SceneError> {
        match command {
            SceneCommand::DestroyNode(node) => self
                .scene_at_mut(&node.hosts)
                .ok_or(SceneError::StaleScene)?
                .destroy_node(node.key),
            SceneCommand::DestroyComponent(component) => self
                .scene_at_mut(&component.hosts)
                .ok_or(SceneError::StaleScene)?
                .destroy_component(component.key),
            SceneCommand::Reparent { node, parent } => {
                if node.hosts != parent.hosts {
                    return Err(SceneError::CrossScene);
                }
                self.scene_at_mut(&node.hosts)
                    .ok_or(SceneError::StaleScene)?
                    .set_parent(node.key, Some(parent.key))
            }
            SceneCommand::AddComponent { node, class, id } => self
                .scene_at_mut(&node.hosts)
                .ok_or(SceneError::StaleScene)?
                .add_component(node.key, *id, *class, registry)
                .map(|_| ()),
            SceneCommand::SetActive { node, active } => {
                let scene = self
                    .scene_at_mut(&node.hosts)
                    .ok_or(SceneError::StaleScene)?;
                let target = scene
                    .node_mut(node.key)
                    .ok_or(SceneError::StaleNode(node.key))?;
                target.set_active(*active);
                Ok(())
            }
        }
    }
}
