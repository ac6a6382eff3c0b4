use crate::node::NodeEvent;
use crate::reference::{ComponentKey, NodeKey};
use crate::registry::ClassId;
use scenery_common::{LifecycleState, SceneId};

/// Precondition violations on scene, node and component operations.
///
/// The object the operation targeted is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SceneError {
    #[error("scene id {0} is already in use in this scene")]
    DuplicateId(SceneId),
    #[error("scene id 0000 is reserved for transient objects")]
    ReservedId,
    #[error("no free scene id left in this scene")]
    IdSpaceExhausted,
    #[error("node handle {0:?} is stale or belongs to another scene")]
    StaleNode(NodeKey),
    #[error("component handle {0:?} is stale or belongs to another scene")]
    StaleComponent(ComponentKey),
    #[error("no scene at the given host path")]
    StaleScene,
    #[error("component class {0} is not registered")]
    UnknownClass(ClassId),
    #[error("node {0} cannot be its own parent")]
    SelfParent(SceneId),
    #[error("node {node} cannot be parented under its own descendant {parent}")]
    HierarchyCycle { node: SceneId, parent: SceneId },
    #[error("a node can only be parented to a node of the same scene")]
    CrossScene,
    #[error("operation is not permitted on the scene root")]
    RootNode,
    #[error("node {0} already hosts a child scene")]
    ChildSceneOccupied(SceneId),
    #[error("{object} lifecycle violation: expected {expected}, found {found:?}")]
    Lifecycle {
        object: &'static str,
        expected: &'static str,
        found: LifecycleState,
    },
    #[error("a {0:?} callback is already registered for this listener")]
    DuplicateCallback(NodeEvent),
    #[error("no {0:?} callback is registered for this listener")]
    UnknownCallback(NodeEvent),
}

/// Check `found == expected`, reporting a lifecycle violation otherwise.
pub(crate) fn expect_state(
    object: &'static str,
    found: LifecycleState,
    expected: LifecycleState,
) -> Result<(), SceneError> {
    if found == expected {
        return Ok(());
    }
    let expected = match expected {
        LifecycleState::Shutdown => "Shutdown",
        LifecycleState::Init => "Init",
        LifecycleState::PostInit => "PostInit",
    };
    Err(SceneError::Lifecycle {
        object,
        expected,
        found,
    })
}
