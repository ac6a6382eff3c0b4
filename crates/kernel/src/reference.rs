//! Handles, addresses and lazily resolved references.

use crate::component::ComponentSlot;
use crate::node::SceneNode;
use crate::scene::Scene;
use scenery_common::{SceneGlobalId, SceneId, Serializer};
use smallvec::SmallVec;
use std::fmt;
use std::marker::PhantomData;

slotmap::new_key_type! {
    /// Generational handle of a node inside its scene's pool.
    pub struct NodeKey;
    /// Generational handle of a component inside its scene's pool.
    pub struct ComponentKey;
}

/// Host node handles leading from an ancestor scene to a nested scene.
/// Empty for the ancestor itself.
pub type ScenePath = SmallVec<[NodeKey; 2]>;

/// A pool handle qualified by the scene it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address<K> {
    pub hosts: ScenePath,
    pub key: K,
}

impl<K> Address<K> {
    pub fn new(hosts: ScenePath, key: K) -> Self {
        Self { hosts, key }
    }

    /// An object of the addressing scene itself.
    pub fn local(key: K) -> Self {
        Self {
            hosts: ScenePath::new(),
            key,
        }
    }
}

pub type NodeAddress = Address<NodeKey>;
pub type ComponentAddress = Address<ComponentKey>;

/// Object kinds a reference can point at.
pub trait Referent: Sized {
    type Key: slotmap::Key;

    /// Live object carrying `id`, if any.
    fn lookup(scene: &Scene, id: SceneId) -> Option<Self::Key>;
    /// Id of the live object behind `key`, if the key is still alive.
    fn id_of(scene: &Scene, key: Self::Key) -> Option<SceneId>;
    /// Human-readable label written next to the id.
    fn label(scene: &Scene, key: Self::Key) -> String;
}

impl Referent for SceneNode {
    type Key = NodeKey;

    fn lookup(scene: &Scene, id: SceneId) -> Option<NodeKey> {
        scene.node_by_id(id)
    }

    fn id_of(scene: &Scene, key: NodeKey) -> Option<SceneId> {
        scene.node(key).map(SceneNode::id)
    }

    fn label(scene: &Scene, key: NodeKey) -> String {
        scene
            .node(key)
            .map(|node| node.name().to_owned())
            .unwrap_or_default()
    }
}

impl Referent for ComponentSlot {
    type Key = ComponentKey;

    fn lookup(scene: &Scene, id: SceneId) -> Option<ComponentKey> {
        scene.component_by_id(id)
    }

    fn id_of(scene: &Scene, key: ComponentKey) -> Option<SceneId> {
        scene.component(key).map(ComponentSlot::id)
    }

    fn label(scene: &Scene, key: ComponentKey) -> String {
        scene
            .component(key)
            .map(|slot| slot.class_name().to_owned())
            .unwrap_or_default()
    }
}

/// Id of an object in the same scene plus a cached handle.
///
/// The handle is never persisted; reading a reference clears it.
pub struct LocalReference<T: Referent> {
    id: SceneId,
    handle: Option<T::Key>,
    _referent: PhantomData<fn() -> T>,
}

impl<T: Referent> LocalReference<T> {
    /// An unresolved reference to `id`.
    pub fn new(id: SceneId) -> Self {
        Self {
            id,
            handle: None,
            _referent: PhantomData,
        }
    }

    /// A reference whose handle is already known. Required for transient
    /// objects, which cannot be found by id.
    pub fn resolved(id: SceneId, key: T::Key) -> Self {
        Self {
            id,
            handle: Some(key),
            _referent: PhantomData,
        }
    }

    pub fn id(&self) -> SceneId {
        self.id
    }

    pub fn handle(&self) -> Option<T::Key> {
        self.handle
    }

    pub fn is_resolved(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_transient(&self) -> bool {
        self.id.is_transient()
    }

    /// Point at a different id; drops the cached handle.
    pub fn set(&mut self, id: SceneId) {
        self.id = id;
        self.handle = None;
    }

    pub(crate) fn set_handle(&mut self, handle: Option<T::Key>) {
        self.handle = handle;
    }

    /// Writes `[id, label]`; reads the id, ignores the label and clears the
    /// cached handle.
    pub fn serialize(&mut self, s: &mut dyn Serializer, name: Option<&str>, label: &str) -> bool {
        let reading = s.is_reading();
        let mut len = if reading { 0 } else { 2 };
        if !s.begin_array(&mut len, name) {
            return false;
        }
        let mut ok = if len == 0 {
            s.report_error(format!("empty reference {}", name.unwrap_or("")));
            false
        } else {
            s.value(&mut self.id, None)
        };
        if !reading {
            let mut label = label.to_owned();
            ok &= s.value(&mut label, None);
        }
        s.end_array();
        if reading {
            self.handle = None;
        }
        ok
    }
}

impl<T: Referent> Clone for LocalReference<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Referent> Copy for LocalReference<T> {}

impl<T: Referent> PartialEq for LocalReference<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.handle == other.handle
    }
}

impl<T: Referent> Default for LocalReference<T> {
    fn default() -> Self {
        Self::new(SceneId::TRANSIENT)
    }
}

impl<T: Referent> fmt::Debug for LocalReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalReference")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Id of an object anywhere below the resolving scene plus a cached address.
///
/// The cache is tagged with the subtree revision it was resolved against and
/// is discarded once nesting below the resolving scene changes.
pub struct GlobalReference<T: Referent> {
    id: SceneGlobalId,
    handle: Option<Address<T::Key>>,
    revision: u64,
}

impl<T: Referent> GlobalReference<T> {
    pub fn new(id: SceneGlobalId) -> Self {
        Self {
            id,
            handle: None,
            revision: 0,
        }
    }

    pub fn id(&self) -> SceneGlobalId {
        self.id
    }

    pub fn handle(&self) -> Option<&Address<T::Key>> {
        self.handle.as_ref()
    }

    pub fn is_resolved(&self) -> bool {
        self.handle.is_some()
    }

    pub fn set(&mut self, id: SceneGlobalId) {
        self.id = id;
        self.handle = None;
    }

    /// Drop the cached address, keeping the id.
    pub fn clear(&mut self) {
        self.handle = None;
    }

    pub(crate) fn cached(&self, revision: u64) -> Option<&Address<T::Key>> {
        self.handle.as_ref().filter(|_| self.revision == revision)
    }

    pub(crate) fn set_handle(&mut self, handle: Option<Address<T::Key>>, revision: u64) {
        self.handle = handle;
        self.revision = revision;
    }

    /// Writes `[globalId, label]`; reads the id and clears the cached address.
    pub fn serialize(&mut self, s: &mut dyn Serializer, name: Option<&str>, label: &str) -> bool {
        let reading = s.is_reading();
        let mut len = if reading { 0 } else { 2 };
        if !s.begin_array(&mut len, name) {
            return false;
        }
        let mut ok = if len == 0 {
            s.report_error(format!("empty reference {}", name.unwrap_or("")));
            false
        } else {
            s.value(&mut self.id, None)
        };
        if !reading {
            let mut label = label.to_owned();
            ok &= s.value(&mut label, None);
        }
        s.end_array();
        if reading {
            self.handle = None;
        }
        ok
    }
}

impl<T: Referent> Clone for GlobalReference<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handle: self.handle.clone(),
            revision: self.revision,
        }
    }
}

impl<T: Referent> Default for GlobalReference<T> {
    fn default() -> Self {
        Self::new(SceneGlobalId::default())
    }
}

impl<T: Referent> fmt::Debug for GlobalReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalReference")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .finish()
    }
}
