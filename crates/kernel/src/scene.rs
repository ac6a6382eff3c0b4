use crate::command::{CommandBuffer, SceneCommand};
use crate::component::{Behavior, ComponentSlot};
use crate::error::SceneError;
use crate::node::{NodeEvent, Notification, SceneNode};
use crate::reference::{
    Address, ComponentKey, GlobalReference, LocalReference, NodeKey, Referent, ScenePath,
};
use crate::registry::{ClassId, ComponentClass, ComponentRegistry};
use glam::Affine3A;
use scenery_common::{
    LifecycleState, NodeFlags, SceneGlobalId, SceneId, SceneInstanceId, Transform,
};
use slotmap::SlotMap;
use std::collections::{HashMap, HashSet};

/// Scene instance bookkeeping reported to the owning world.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceEvent {
    Attached {
        path: String,
        instance: SceneInstanceId,
    },
    Released {
        path: String,
        instance: SceneInstanceId,
    },
}

/// Events produced inside a scene tree, drained by whoever drives it.
#[derive(Debug, Default)]
pub struct Outbox {
    pub notifications: Vec<Notification>,
    pub instances: Vec<InstanceEvent>,
}

impl Outbox {
    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty() && self.instances.is_empty()
    }

    fn append(&mut self, other: &mut Outbox) {
        self.notifications.append(&mut other.notifications);
        self.instances.append(&mut other.instances);
    }
}

/// A node reached by [`Scene::traverse`].
pub struct Visit<'a> {
    /// Host path from the traversing scene to `scene`.
    pub hosts: &'a [NodeKey],
    pub scene: &'a Scene,
    pub key: NodeKey,
    pub node: &'a SceneNode,
    pub depth: usize,
}

/// Folded scene path id -> host chain, for every scene nested below one
/// scene. Derived data; rebuilt when the subtree revision moves.
#[derive(Debug, Clone, Default)]
pub struct GlobalAddressMap {
    revision: u64,
    paths: HashMap<SceneId, ScenePath>,
    ambiguous: HashSet<SceneId>,
}

impl GlobalAddressMap {
    fn build(scene: &Scene, revision: u64) -> Self {
        let mut map = Self {
            revision,
            ..Self::default()
        };
        let mut stack = vec![(SceneId::TRANSIENT, ScenePath::new(), scene)];
        while let Some((path_id, hosts, current)) = stack.pop() {
            for &host in &current.hosts {
                let Some(node) = current.nodes.get(host) else {
                    continue;
                };
                let Some(child) = node.child_scene.as_deref() else {
                    continue;
                };
                let child_id = SceneId::fold(path_id, node.id);
                let mut child_hosts = hosts.clone();
                child_hosts.push(host);
                map.insert(child_id, child_hosts.clone());
                stack.push((child_id, child_hosts, child));
            }
        }
        tracing::trace!(scenes = map.paths.len(), ambiguous = map.ambiguous.len(), "rebuilt global address map");
        map
    }

    fn insert(&mut self, id: SceneId, hosts: ScenePath) {
        if id.is_transient() {
            tracing::warn!(?hosts, "nested scene path folds to 0000; it is not globally addressable");
            return;
        }
        if self.ambiguous.contains(&id) {
            return;
        }
        match self.paths.get(&id) {
            Some(existing) if *existing != hosts => {
                tracing::warn!(path = %id, "two nested scenes fold to the same path id; both are unaddressable");
                self.paths.remove(&id);
                self.ambiguous.insert(id);
            }
            Some(_) => {}
            None => {
                self.paths.insert(id, hosts);
            }
        }
    }

    /// Host chain for a folded path id. `None` for unknown or ambiguous ids.
    pub fn resolve(&self, id: SceneId) -> Option<&ScenePath> {
        self.paths.get(&id)
    }

    pub fn is_ambiguous(&self, id: SceneId) -> bool {
        self.ambiguous.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

/// A pool of nodes and components addressed by local [`SceneId`]s, with one
/// root node. May be nested inside another scene through a host node.
pub struct Scene {
    pub(crate) instance: SceneInstanceId,
    pub(crate) source: Option<String>,
    pub(crate) state: LifecycleState,
    pub(crate) root: NodeKey,
    pub(crate) root_id: SceneId,
    pub(crate) nodes: SlotMap<NodeKey, SceneNode>,
    pub(crate) node_ids: HashMap<SceneId, NodeKey>,
    pub(crate) components: SlotMap<ComponentKey, ComponentSlot>,
    pub(crate) component_ids: HashMap<SceneId, ComponentKey>,
    /// Nodes currently owning a child scene.
    pub(crate) hosts: Vec<NodeKey>,
    /// Bumped on every nesting change of this scene.
    pub(crate) revision: u64,
    pub(crate) addresses: Option<GlobalAddressMap>,
    /// Path of this scene from the scene its lifecycle was driven from.
    pub(crate) path: ScenePath,
    pub(crate) deferred: CommandBuffer,
    pub(crate) outbox: Outbox,
}

impl Scene {
    /// An empty scene holding only its root node (id 0001, active).
    pub fn new() -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(SceneNode::new(SceneId::ROOT, "Root", NodeFlags::ACTIVE));
        let mut node_ids = HashMap::new();
        node_ids.insert(SceneId::ROOT, root);
        Self {
            instance: SceneInstanceId::new(),
            source: None,
            state: LifecycleState::Shutdown,
            root,
            root_id: SceneId::ROOT,
            nodes,
            node_ids,
            components: SlotMap::with_key(),
            component_ids: HashMap::new(),
            hosts: Vec::new(),
            revision: 0,
            addresses: None,
            path: ScenePath::new(),
            deferred: CommandBuffer::default(),
            outbox: Outbox::default(),
        }
    }

    pub fn instance(&self) -> SceneInstanceId {
        self.instance
    }

    /// Path of the authored file this scene was loaded from.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn set_source(&mut self, path: Option<String>) {
        self.source = path;
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn root(&self) -> NodeKey {
        self.root
    }

    pub fn root_id(&self) -> SceneId {
        self.root_id
    }

    pub fn node(&self, key: NodeKey) -> Option<&SceneNode> {
        self.nodes.get(key)
    }

    pub fn node_mut(&mut self, key: NodeKey) -> Option<&mut SceneNode> {
        self.nodes.get_mut(key)
    }

    pub fn node_by_id(&self, id: SceneId) -> Option<NodeKey> {
        self.node_ids.get(&id).copied()
    }

    pub fn component(&self, key: ComponentKey) -> Option<&ComponentSlot> {
        self.components.get(key)
    }

    pub fn component_mut(&mut self, key: ComponentKey) -> Option<&mut ComponentSlot> {
        self.components.get_mut(key)
    }

    pub fn component_by_id(&self, id: SceneId) -> Option<ComponentKey> {
        self.component_ids.get(&id).copied()
    }

    /// A component together with the node it is attached to.
    pub(crate) fn component_with_node_mut(
        &mut self,
        key: ComponentKey,
    ) -> Option<(&mut ComponentSlot, NodeKey, &mut SceneNode)> {
        let slot = self.components.get_mut(key)?;
        let parent = slot.parent?;
        let node = self.nodes.get_mut(parent)?;
        Some((slot, parent, node))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeKey, &SceneNode)> {
        self.nodes.iter()
    }

    pub fn components(&self) -> impl Iterator<Item = (ComponentKey, &ComponentSlot)> {
        self.components.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    fn id_in_use(&self, id: SceneId) -> bool {
        self.node_ids.contains_key(&id) || self.component_ids.contains_key(&id)
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Create a permanent node. It is brought up to the scene's lifecycle
    /// state immediately.
    pub fn create_node(
        &mut self,
        id: SceneId,
        name: impl Into<String>,
        parent: Option<NodeKey>,
    ) -> Result<NodeKey, SceneError> {
        if id.is_transient() {
            return Err(SceneError::ReservedId);
        }
        if self.id_in_use(id) {
            return Err(SceneError::DuplicateId(id));
        }
        if let Some(parent) = parent {
            if !self.nodes.contains_key(parent) {
                return Err(SceneError::StaleNode(parent));
            }
        }
        let key = self.nodes.insert(SceneNode::new(id, name, NodeFlags::ACTIVE));
        self.node_ids.insert(id, key);
        if let Some(parent) = parent {
            self.link(key, parent);
        }
        tracing::trace!(%id, "created node");
        self.bring_up_node(key)?;
        Ok(key)
    }

    /// Create a node with id 0000, owned by `parent` and never persisted.
    pub fn create_transient_node(
        &mut self,
        name: impl Into<String>,
        parent: NodeKey,
    ) -> Result<NodeKey, SceneError> {
        if !self.nodes.contains_key(parent) {
            return Err(SceneError::StaleNode(parent));
        }
        let flags = NodeFlags::ACTIVE | NodeFlags::TRANSIENT;
        let key = self
            .nodes
            .insert(SceneNode::new(SceneId::TRANSIENT, name, flags));
        self.link(key, parent);
        self.bring_up_node(key)?;
        Ok(key)
    }

    /// Shut down (if needed) and free a node. Its transient children and
    /// components go with it; permanent children become unparented.
    pub fn destroy_node(&mut self, key: NodeKey) -> Result<(), SceneError> {
        if key == self.root {
            return Err(SceneError::RootNode);
        }
        self.remove_node(key, true)
    }

    pub(crate) fn remove_node(
        &mut self,
        key: NodeKey,
        destroy_components: bool,
    ) -> Result<(), SceneError> {
        let node = self.nodes.get(key).ok_or(SceneError::StaleNode(key))?;
        if node.state != LifecycleState::Shutdown {
            self.shutdown_node(key)?;
        }
        // Transient children of a node that never ran are still owned by it.
        let transient: Vec<NodeKey> = self
            .nodes
            .get(key)
            .map(|node| {
                node.children
                    .iter()
                    .filter(|child| child.is_transient())
                    .filter_map(LocalReference::handle)
                    .collect()
            })
            .unwrap_or_default();
        for child in transient {
            if let Err(err) = self.remove_node(child, true) {
                tracing::warn!(%err, "failed to destroy transient child");
            }
        }

        self.unlink(key);
        let Some(node) = self.nodes.remove(key) else {
            return Ok(());
        };
        if !node.id.is_transient() && self.node_ids.get(&node.id) == Some(&key) {
            self.node_ids.remove(&node.id);
        }
        for child in node.children.iter().filter_map(LocalReference::handle) {
            if let Some(child_node) = self.nodes.get_mut(child) {
                if child_node.parent() == Some(key) {
                    child_node.parent = None;
                }
            }
        }
        for component in &node.components {
            let Some(component_key) = component
                .handle()
                .or_else(|| self.component_ids.get(&component.id()).copied())
            else {
                continue;
            };
            if component.is_transient() || destroy_components {
                if let Err(err) = self.remove_component(component_key) {
                    tracing::warn!(%err, "failed to destroy component of destroyed node");
                }
            } else if let Some(slot) = self.components.get_mut(component_key) {
                if slot.parent == Some(key) {
                    slot.parent = None;
                }
            }
        }
        if let Some(child) = node.child_scene {
            self.release_child_scene(key, child);
        }
        tracing::debug!(id = %node.id, name = %node.name, "destroyed node");
        Ok(())
    }

    /// Link `child` under `parent` and derive its world from the parent's.
    pub(crate) fn link(&mut self, child: NodeKey, parent: NodeKey) {
        let Some(parent_node) = self.nodes.get(parent) else {
            return;
        };
        let (parent_id, parent_world) = (parent_node.id, parent_node.world);
        let Some(node) = self.nodes.get_mut(child) else {
            return;
        };
        node.parent = Some(LocalReference::resolved(parent_id, parent));
        node.world = parent_world * node.local.to_affine();
        let child_id = node.id;
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node
                .children
                .push(LocalReference::resolved(child_id, child));
        }
    }

    fn unlink(&mut self, child: NodeKey) {
        let Some(node) = self.nodes.get_mut(child) else {
            return;
        };
        let id = node.id;
        let parent = node
            .parent
            .take()
            .and_then(|parent| parent.handle().or_else(|| self.node_ids.get(&parent.id()).copied()));
        let Some(parent_node) = parent.and_then(|parent| self.nodes.get_mut(parent)) else {
            return;
        };
        parent_node
            .children
            .retain(|c| c.handle() != Some(child) && (id.is_transient() || c.id() != id));
    }

    /// Move `key` under `parent` (or unparent it), keeping its world pose.
    pub fn set_parent(&mut self, key: NodeKey, parent: Option<NodeKey>) -> Result<(), SceneError> {
        if key == self.root {
            return Err(SceneError::RootNode);
        }
        let node = self.nodes.get(key).ok_or(SceneError::StaleNode(key))?;
        let (id, old_world) = (node.id, node.world);
        let parent_world = match parent {
            Some(parent) => {
                if parent == key {
                    return Err(SceneError::SelfParent(id));
                }
                let parent_node = self.nodes.get(parent).ok_or(SceneError::StaleNode(parent))?;
                if self.is_ancestor(key, parent) {
                    return Err(SceneError::HierarchyCycle {
                        node: id,
                        parent: parent_node.id,
                    });
                }
                parent_node.world
            }
            None => Affine3A::IDENTITY,
        };
        self.unlink(key);
        if let Some(parent) = parent {
            self.link(key, parent);
        }
        if let Some(node) = self.nodes.get_mut(key) {
            node.local = Transform::from_affine(parent_world.inverse() * old_world);
            node.world = old_world;
        }
        Ok(())
    }

    /// Whether `ancestor` is on the parent chain of `node`.
    pub fn is_ancestor(&self, ancestor: NodeKey, node: NodeKey) -> bool {
        let mut current = self.nodes.get(node).and_then(SceneNode::parent);
        for _ in 0..self.nodes.len() {
            match current {
                Some(key) if key == ancestor => return true,
                Some(key) => current = self.nodes.get(key).and_then(SceneNode::parent),
                None => return false,
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    /// Create a component of a registered class and attach it to `node`.
    pub fn add_component(
        &mut self,
        node: NodeKey,
        id: SceneId,
        class: ClassId,
        registry: &ComponentRegistry,
    ) -> Result<ComponentKey, SceneError> {
        let class = registry.class(class).ok_or(SceneError::UnknownClass(class))?;
        self.insert_component(node, id, class, (class.create)())
    }

    /// Attach a pre-built instance of `class`.
    pub fn insert_component(
        &mut self,
        node: NodeKey,
        id: SceneId,
        class: &ComponentClass,
        behavior: Box<dyn Behavior>,
    ) -> Result<ComponentKey, SceneError> {
        if id.is_transient() {
            return Err(SceneError::ReservedId);
        }
        if self.id_in_use(id) {
            return Err(SceneError::DuplicateId(id));
        }
        if !self.nodes.contains_key(node) {
            return Err(SceneError::StaleNode(node));
        }
        let key = self
            .components
            .insert(ComponentSlot::new(id, class.id, class.name, behavior));
        self.component_ids.insert(id, key);
        self.attach_component(node, key)?;
        Ok(key)
    }

    /// Attach a never-persisted instance of `class`.
    pub fn add_transient_component(
        &mut self,
        node: NodeKey,
        class: &ComponentClass,
        behavior: Box<dyn Behavior>,
    ) -> Result<ComponentKey, SceneError> {
        if !self.nodes.contains_key(node) {
            return Err(SceneError::StaleNode(node));
        }
        let key = self.components.insert(ComponentSlot::new(
            SceneId::TRANSIENT,
            class.id,
            class.name,
            behavior,
        ));
        self.attach_component(node, key)?;
        Ok(key)
    }

    fn attach_component(&mut self, node: NodeKey, key: ComponentKey) -> Result<(), SceneError> {
        let slot = self
            .components
            .get_mut(key)
            .ok_or(SceneError::StaleComponent(key))?;
        slot.parent = Some(node);
        let id = slot.id;
        let target = self.nodes.get_mut(node).ok_or(SceneError::StaleNode(node))?;
        target.components.push(LocalReference::resolved(id, key));
        let state = target.state;
        if state != LifecycleState::Shutdown {
            self.init_component(key)?;
        }
        if state == LifecycleState::PostInit {
            self.post_init_component(key)?;
        }
        Ok(())
    }

    /// Shut down (if needed) and free a component.
    pub fn destroy_component(&mut self, key: ComponentKey) -> Result<(), SceneError> {
        self.remove_component(key)
    }

    pub(crate) fn remove_component(&mut self, key: ComponentKey) -> Result<(), SceneError> {
        let slot = self
            .components
            .get(key)
            .ok_or(SceneError::StaleComponent(key))?;
        if slot.state != LifecycleState::Shutdown {
            self.shutdown_component(key)?;
        }
        let Some(slot) = self.components.remove(key) else {
            return Ok(());
        };
        if !slot.id.is_transient() && self.component_ids.get(&slot.id) == Some(&key) {
            self.component_ids.remove(&slot.id);
        }
        if let Some(parent) = slot.parent.and_then(|parent| self.nodes.get_mut(parent)) {
            parent
                .components
                .retain(|c| c.handle() != Some(key) && (slot.id.is_transient() || c.id() != slot.id));
        }
        tracing::trace!(id = %slot.id, class = slot.class_name, "destroyed component");
        Ok(())
    }

    /// `max(existing ids) + 1`, or the lowest free id once that overflows.
    pub fn find_unique_node_id(&self) -> Result<SceneId, SceneError> {
        self.next_free_id()
    }

    /// Node and component ids share one space, so this agrees with
    /// [`Scene::find_unique_node_id`].
    pub fn find_unique_component_id(&self) -> Result<SceneId, SceneError> {
        self.next_free_id()
    }

    fn next_free_id(&self) -> Result<SceneId, SceneError> {
        let max = self
            .node_ids
            .keys()
            .chain(self.component_ids.keys())
            .map(|id| id.raw())
            .max()
            .unwrap_or(0);
        if let Some(next) = max.checked_add(1) {
            return Ok(SceneId(next));
        }
        (1..=u16::MAX)
            .map(SceneId)
            .find(|id| !self.id_in_use(*id))
            .ok_or(SceneError::IdSpaceExhausted)
    }

    // ------------------------------------------------------------------
    // References
    // ------------------------------------------------------------------

    /// Resolve a same-scene reference. Idempotent: a still-valid cached
    /// handle is kept as is.
    pub fn resolve_reference<T: Referent>(&self, reference: &mut LocalReference<T>) -> bool {
        if let Some(key) = reference.handle() {
            if T::id_of(self, key) == Some(reference.id()) {
                return true;
            }
        }
        let handle = if reference.is_transient() {
            None
        } else {
            T::lookup(self, reference.id())
        };
        reference.set_handle(handle);
        handle.is_some()
    }

    /// Resolve a reference to an object anywhere in this scene's subtree.
    pub fn resolve_global<T: Referent>(&mut self, reference: &mut GlobalReference<T>) -> bool {
        let revision = self.subtree_revision();
        let id = reference.id();
        if let Some(address) = reference.cached(revision) {
            let live = self
                .scene_at(&address.hosts)
                .and_then(|scene| T::id_of(scene, address.key));
            if live == Some(id.local) {
                return true;
            }
        }
        let address = self.lookup_global::<T>(id);
        let found = address.is_some();
        reference.set_handle(address, revision);
        found
    }

    fn lookup_global<T: Referent>(&mut self, id: SceneGlobalId) -> Option<Address<T::Key>> {
        if id.local.is_transient() {
            return None;
        }
        let hosts = if id.scene.is_transient() {
            ScenePath::new()
        } else {
            self.address_map().resolve(id.scene)?.clone()
        };
        let key = T::lookup(self.scene_at(&hosts)?, id.local)?;
        Some(Address::new(hosts, key))
    }

    /// The derived path map, rebuilt if nesting changed since last use.
    pub fn address_map(&mut self) -> &GlobalAddressMap {
        let revision = self.subtree_revision();
        let map = match self.addresses.take() {
            Some(map) if map.revision == revision => map,
            _ => GlobalAddressMap::build(self, revision),
        };
        self.addresses.insert(map)
    }

    /// Sum of the nesting revisions of this scene and every nested scene.
    /// Strictly increases on any nesting change below this scene.
    pub fn subtree_revision(&self) -> u64 {
        self.child_scenes()
            .fold(self.revision, |acc, (_, child)| {
                acc.wrapping_add(child.subtree_revision())
            })
    }

    /// Global id of `local` in the scene at `hosts`, as seen from here.
    pub fn global_id_of(&self, hosts: &[NodeKey], local: SceneId) -> Option<SceneGlobalId> {
        let mut scene = self;
        let mut path = SceneId::TRANSIENT;
        for &host in hosts {
            let node = scene.nodes.get(host)?;
            path = SceneId::fold(path, node.id);
            scene = node.child_scene.as_deref()?;
        }
        Some(SceneGlobalId::new(path, local))
    }

    // ------------------------------------------------------------------
    // Nesting
    // ------------------------------------------------------------------

    pub fn scene_at(&self, hosts: &[NodeKey]) -> Option<&Scene> {
        let mut scene = self;
        for &host in hosts {
            scene = scene.nodes.get(host)?.child_scene.as_deref()?;
        }
        Some(scene)
    }

    pub fn scene_at_mut(&mut self, hosts: &[NodeKey]) -> Option<&mut Scene> {
        let mut scene = self;
        for &host in hosts {
            scene = scene.nodes.get_mut(host)?.child_scene.as_deref_mut()?;
        }
        Some(scene)
    }

    /// Directly nested scenes with their host nodes.
    pub fn child_scenes(&self) -> impl Iterator<Item = (NodeKey, &Scene)> {
        self.hosts.iter().filter_map(|&host| {
            self.nodes
                .get(host)
                .and_then(|node| node.child_scene.as_deref())
                .map(|child| (host, child))
        })
    }

    /// Nest `scene` under `host`, bringing it up to the host's lifecycle state.
    pub fn attach_child_scene(&mut self, host: NodeKey, scene: Scene) -> Result<(), SceneError> {
        let node = self.nodes.get_mut(host).ok_or(SceneError::StaleNode(host))?;
        if node.child_scene.is_some() {
            return Err(SceneError::ChildSceneOccupied(node.id));
        }
        let host_state = node.state;
        let mut scene = Box::new(scene);
        let mut pending = scene.take_outbox();
        self.outbox.append(&mut pending);
        for (path, instance) in scene.sourced_instances() {
            self.outbox
                .instances
                .push(InstanceEvent::Attached { path, instance });
        }
        node.child_scene = Some(scene);
        self.hosts.push(host);
        self.revision = self.revision.wrapping_add(1);

        if host_state == LifecycleState::Shutdown {
            return Ok(());
        }
        let mut path = self.path.clone();
        path.push(host);
        if let Some(child) = self
            .nodes
            .get_mut(host)
            .and_then(|node| node.child_scene.as_deref_mut())
        {
            if child.state == LifecycleState::Shutdown {
                child.init_at(path)?;
                if host_state == LifecycleState::PostInit {
                    child.post_init()?;
                }
            }
        }
        Ok(())
    }

    /// Remove and return the scene nested under `host`, shut down.
    pub fn detach_child_scene(&mut self, host: NodeKey) -> Option<Scene> {
        let mut child = self.nodes.get_mut(host)?.child_scene.take()?;
        if child.state != LifecycleState::Shutdown {
            if let Err(err) = child.shutdown() {
                tracing::warn!(%err, "child scene failed to shut down cleanly");
            }
        }
        self.release_bookkeeping(host, &mut child);
        Some(*child)
    }

    pub(crate) fn release_child_scene(&mut self, host: NodeKey, mut child: Box<Scene>) {
        self.release_bookkeeping(host, &mut child);
    }

    fn release_bookkeeping(&mut self, host: NodeKey, child: &mut Scene) {
        let mut pending = child.take_outbox();
        self.outbox.append(&mut pending);
        for (path, instance) in child.sourced_instances() {
            self.outbox
                .instances
                .push(InstanceEvent::Released { path, instance });
        }
        self.hosts.retain(|&h| h != host);
        self.revision = self
            .revision
            .wrapping_add(child.subtree_revision())
            .wrapping_add(1);
    }

    /// This scene and every nested scene that came from a file.
    pub fn sourced_instances(&self) -> Vec<(String, SceneInstanceId)> {
        let mut found = Vec::new();
        let mut stack = vec![self];
        while let Some(scene) = stack.pop() {
            if let Some(path) = &scene.source {
                found.push((path.clone(), scene.instance));
            }
            stack.extend(scene.child_scenes().map(|(_, child)| child));
        }
        found
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// Iterative depth-first walk from `start` (default: the root).
    ///
    /// Children of a node are visited only if `visitor` returned true for it.
    /// A hosted child scene's root follows the host's own children.
    pub fn traverse(&self, start: Option<NodeKey>, mut visitor: impl FnMut(Visit<'_>) -> bool) {
        let mut stack = vec![(ScenePath::new(), start.unwrap_or(self.root), 0usize)];
        while let Some((hosts, key, depth)) = stack.pop() {
            let Some(scene) = self.scene_at(&hosts) else {
                continue;
            };
            let Some(node) = scene.nodes.get(key) else {
                continue;
            };
            let descend = visitor(Visit {
                hosts: &hosts,
                scene,
                key,
                node,
                depth,
            });
            if !descend {
                continue;
            }
            if let Some(child) = node.child_scene.as_deref() {
                let mut nested = hosts.clone();
                nested.push(key);
                stack.push((nested, child.root, depth + 1));
            }
            for child in node.children.iter().rev().filter_map(LocalReference::handle) {
                stack.push((hosts.clone(), child, depth + 1));
            }
        }
    }

    // ------------------------------------------------------------------
    // Deferred work and notifications
    // ------------------------------------------------------------------

    /// Queue a structural change, addressed relative to this scene, for the
    /// next [`Scene::flush_deferred`].
    pub fn defer(&mut self, command: SceneCommand) {
        self.deferred.push(command);
    }

    pub fn deferred(&self) -> &CommandBuffer {
        &self.deferred
    }

    pub(crate) fn fire(&mut self, key: NodeKey, event: NodeEvent) {
        let Some(node) = self.nodes.get(key) else {
            return;
        };
        for (_, listener) in node.callbacks.iter().filter(|(e, _)| *e == event) {
            self.outbox.notifications.push(Notification {
                event,
                source: node.id,
                listener: listener.clone(),
            });
        }
    }

    /// Fire the node's OnEdit callbacks.
    pub fn notify_edited(&mut self, key: NodeKey) -> Result<(), SceneError> {
        if !self.nodes.contains_key(key) {
            return Err(SceneError::StaleNode(key));
        }
        self.fire(key, NodeEvent::Edit);
        Ok(())
    }

    /// Drain pending events of this scene and every nested scene.
    pub fn take_outbox(&mut self) -> Outbox {
        let mut outbox = std::mem::take(&mut self.outbox);
        for host in self.hosts.clone() {
            if let Some(child) = self
                .nodes
                .get_mut(host)
                .and_then(|node| node.child_scene.as_deref_mut())
            {
                let mut nested = child.take_outbox();
                outbox.append(&mut nested);
            }
        }
        outbox
    }

    /// Hand notifications to their listeners. Listener addresses are
    /// relative to this scene. Returns the number delivered.
    pub fn deliver(&mut self, notifications: Vec<Notification>) -> usize {
        let mut delivered = 0;
        for notification in notifications {
            let listener = self
                .scene_at_mut(&notification.listener.hosts)
                .and_then(|scene| scene.components.get_mut(notification.listener.key))
                .and_then(|slot| slot.behavior.as_deref_mut());
            match listener {
                Some(behavior) => {
                    behavior.on_node_event(notification.event, notification.source);
                    delivered += 1;
                }
                None => tracing::debug!(
                    event = ?notification.event,
                    source = %notification.source,
                    "listener gone before delivery"
                ),
            }
        }
        delivered
    }

    /// Deliver every pending notification in the tree. Instance events stay
    /// queued for the owning world.
    pub fn deliver_notifications(&mut self) -> usize {
        let mut outbox = self.take_outbox();
        let notifications = std::mem::take(&mut outbox.notifications);
        self.outbox.instances.append(&mut outbox.instances);
        self.deliver(notifications)
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("instance", &self.instance)
            .field("source", &self.source)
            .field("state", &self.state)
            .field("nodes", &self.nodes.len())
            .field("components", &self.components.len())
            .field("child_scenes", &self.hosts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentType;

    #[derive(Default)]
    struct Probe {
        seen: Vec<(NodeEvent, SceneId)>,
    }

    impl Behavior for Probe {
        fn on_node_event(&mut self, event: NodeEvent, source: SceneId) {
            self.seen.push((event, source));
        }
    }

    impl ComponentType for Probe {
        const NAME: &'static str = "Probe";
    }

    fn probe(scene: &mut Scene, node: NodeKey, id: u16) -> ComponentKey {
        let class = ComponentClass::of::<Probe>();
        scene
            .insert_component(node, SceneId(id), &class, Box::new(Probe::default()))
            .unwrap()
    }

    fn seen(scene: &Scene, key: ComponentKey) -> Vec<(NodeEvent, SceneId)> {
        scene.component(key).unwrap().get::<Probe>().unwrap().seen.clone()
    }

    /// Scene with a child scene (holding node 5) under host node 2.
    fn nested() -> (Scene, NodeKey) {
        let mut scene = Scene::new();
        let root = scene.root();
        let host = scene.create_node(SceneId(2), "host", Some(root)).unwrap();
        let mut child = Scene::new();
        let child_root = child.root();
        child.create_node(SceneId(5), "inner", Some(child_root)).unwrap();
        scene.attach_child_scene(host, child).unwrap();
        (scene, host)
    }

    #[test]
    fn new_scene_has_a_root() {
        let scene = Scene::new();
        assert_eq!(scene.node_count(), 1);
        assert_eq!(scene.root_id(), SceneId(1));
        assert_eq!(scene.node_by_id(SceneId(1)), Some(scene.root()));
        assert_eq!(scene.state(), LifecycleState::Shutdown);
    }

    #[test]
    fn ids_are_unique_across_nodes_and_components() {
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId(2), "a", Some(root)).unwrap();
        assert_eq!(
            scene.create_node(SceneId(2), "again", Some(root)),
            Err(SceneError::DuplicateId(SceneId(2)))
        );
        assert_eq!(
            scene.create_node(SceneId::TRANSIENT, "zero", Some(root)),
            Err(SceneError::ReservedId)
        );
        let class = ComponentClass::of::<Probe>();
        assert_eq!(
            scene
                .insert_component(a, SceneId(2), &class, Box::new(Probe::default()))
                .err(),
            Some(SceneError::DuplicateId(SceneId(2)))
        );
        probe(&mut scene, a, 9);
        assert_eq!(scene.find_unique_node_id(), Ok(SceneId(10)));
        assert_eq!(scene.find_unique_component_id(), Ok(SceneId(10)));
    }

    #[test]
    fn unique_id_falls_back_to_lowest_free() {
        let mut scene = Scene::new();
        let root = scene.root();
        scene.create_node(SceneId(u16::MAX), "last", Some(root)).unwrap();
        assert_eq!(scene.find_unique_node_id(), Ok(SceneId(2)));
    }

    #[test]
    fn root_cannot_be_destroyed_or_reparented() {
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId(2), "a", Some(root)).unwrap();
        assert_eq!(scene.destroy_node(root), Err(SceneError::RootNode));
        assert_eq!(scene.set_parent(root, Some(a)), Err(SceneError::RootNode));
    }

    #[test]
    fn destroy_frees_transients_and_unparents_permanent_children() {
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId(2), "a", Some(root)).unwrap();
        let b = scene.create_node(SceneId(3), "b", Some(a)).unwrap();
        let t = scene.create_transient_node("t", a).unwrap();
        probe(&mut scene, a, 4);
        scene.init().unwrap();

        scene.destroy_node(a).unwrap();
        assert!(scene.node(a).is_none());
        assert!(scene.node(t).is_none());
        assert_eq!(scene.node(b).unwrap().parent(), None);
        assert!(scene.component_by_id(SceneId(4)).is_none());
        assert!(scene.node(root).unwrap().children().all(|child| child != a));
        assert_eq!(scene.node_count(), 2);
    }

    #[test]
    fn stale_keys_stay_stale_after_slot_reuse() {
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId(2), "a", Some(root)).unwrap();
        scene.destroy_node(a).unwrap();
        let b = scene.create_node(SceneId(2), "b", Some(root)).unwrap();
        assert_ne!(a, b);
        assert!(scene.node(a).is_none());
        assert_eq!(scene.destroy_node(a), Err(SceneError::StaleNode(a)));
        assert_eq!(scene.node(b).unwrap().name(), "b");
    }

    #[test]
    fn parenting_rejects_cycles() {
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId(2), "a", Some(root)).unwrap();
        let b = scene.create_node(SceneId(3), "b", Some(a)).unwrap();
        assert_eq!(scene.set_parent(a, Some(a)), Err(SceneError::SelfParent(SceneId(2))));
        assert_eq!(
            scene.set_parent(a, Some(b)),
            Err(SceneError::HierarchyCycle {
                node: SceneId(2),
                parent: SceneId(3)
            })
        );
        assert!(scene.is_ancestor(a, b));
        assert_eq!(scene.node(a).unwrap().parent(), Some(root));
    }

    #[test]
    fn local_resolution_is_idempotent_and_tracks_destruction() {
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId(2), "a", Some(root)).unwrap();
        let mut reference = LocalReference::<SceneNode>::new(SceneId(2));
        assert!(scene.resolve_reference(&mut reference));
        assert_eq!(reference.handle(), Some(a));
        assert!(scene.resolve_reference(&mut reference));
        assert_eq!(reference.handle(), Some(a));

        scene.destroy_node(a).unwrap();
        assert!(!scene.resolve_reference(&mut reference));
        assert_eq!(reference.handle(), None);
        assert_eq!(reference.id(), SceneId(2));

        let mut transient = LocalReference::<SceneNode>::new(SceneId::TRANSIENT);
        assert!(!scene.resolve_reference(&mut transient));
    }

    #[test]
    fn global_reference_reaches_into_nested_scene() {
        let (mut scene, host) = nested();
        let id = scene.global_id_of(&[host], SceneId(5)).unwrap();
        assert_eq!(id, SceneGlobalId::new(SceneId::fold(SceneId(0), SceneId(2)), SceneId(5)));

        let mut reference = GlobalReference::<SceneNode>::new(id);
        assert!(scene.resolve_global(&mut reference));
        let address = reference.handle().unwrap().clone();
        assert_eq!(&address.hosts[..], &[host]);
        assert_eq!(
            scene.scene_at(&address.hosts).unwrap().node(address.key).unwrap().name(),
            "inner"
        );

        let inner = scene.scene_at_mut(&[host]).unwrap();
        inner.destroy_node(address.key).unwrap();
        assert!(!scene.resolve_global(&mut reference));
    }

    #[test]
    fn global_reference_with_local_scene_id() {
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId(7), "a", Some(root)).unwrap();
        let mut reference = GlobalReference::<SceneNode>::new(SceneGlobalId::local(SceneId(7)));
        assert!(scene.resolve_global(&mut reference));
        assert_eq!(reference.handle().map(|address| address.key), Some(a));
    }

    #[test]
    fn colliding_path_ids_are_ambiguous() {
        let collided = SceneId::fold(SceneId(0), SceneId(145));
        assert_eq!(collided, SceneId::fold(SceneId(0), SceneId(246)));

        let mut scene = Scene::new();
        let root = scene.root();
        for id in [145, 246] {
            let host = scene.create_node(SceneId(id), "host", Some(root)).unwrap();
            scene.attach_child_scene(host, Scene::new()).unwrap();
        }
        let map = scene.address_map();
        assert!(map.is_ambiguous(collided));
        assert!(map.resolve(collided).is_none());

        let mut reference = GlobalReference::<SceneNode>::new(SceneGlobalId::new(collided, SceneId(1)));
        assert!(!scene.resolve_global(&mut reference));
    }

    #[test]
    fn nesting_changes_move_the_revision() {
        let (mut scene, host) = nested();
        let attached = scene.subtree_revision();
        assert_eq!(scene.address_map().len(), 1);

        let child = scene.detach_child_scene(host).unwrap();
        assert!(scene.subtree_revision() > attached);
        assert_eq!(child.node_count(), 2);
        assert!(scene.address_map().is_empty());
        assert!(scene.detach_child_scene(host).is_none());
    }

    #[test]
    fn hosting_twice_is_rejected() {
        let (mut scene, host) = nested();
        assert_eq!(
            scene.attach_child_scene(host, Scene::new()),
            Err(SceneError::ChildSceneOccupied(SceneId(2)))
        );
    }

    #[test]
    fn sourced_instances_report_attach_and_release() {
        let mut scene = Scene::new();
        let root = scene.root();
        let host = scene.create_node(SceneId(2), "host", Some(root)).unwrap();
        let mut child = Scene::new();
        child.set_source(Some("props/lamp.json".into()));
        let instance = child.instance();
        scene.attach_child_scene(host, child).unwrap();
        scene.detach_child_scene(host).unwrap();

        let path = "props/lamp.json".to_owned();
        assert_eq!(
            scene.take_outbox().instances,
            vec![
                InstanceEvent::Attached {
                    path: path.clone(),
                    instance
                },
                InstanceEvent::Released { path, instance },
            ]
        );
    }

    #[test]
    fn attached_scene_follows_host_state() {
        let mut scene = Scene::new();
        let root = scene.root();
        let host = scene.create_node(SceneId(2), "host", Some(root)).unwrap();
        scene.init().unwrap();
        scene.post_init().unwrap();
        scene.attach_child_scene(host, Scene::new()).unwrap();
        let child = scene.scene_at(&[host]).unwrap();
        assert_eq!(child.state(), LifecycleState::PostInit);

        let detached = scene.detach_child_scene(host).unwrap();
        assert_eq!(detached.state(), LifecycleState::Shutdown);
    }

    #[test]
    fn duplicate_callbacks_are_rejected() {
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId(2), "a", Some(root)).unwrap();
        let listener = probe(&mut scene, root, 3);
        let node = scene.node_mut(a).unwrap();
        node.register_callback(NodeEvent::Edit, Address::local(listener)).unwrap();
        assert_eq!(
            node.register_callback(NodeEvent::Edit, Address::local(listener)),
            Err(SceneError::DuplicateCallback(NodeEvent::Edit))
        );
        assert_eq!(
            node.unregister_callback(NodeEvent::Shutdown, &Address::local(listener)),
            Err(SceneError::UnknownCallback(NodeEvent::Shutdown))
        );
        assert_eq!(node.callback_count(NodeEvent::Edit), 1);
    }

    #[test]
    fn callbacks_are_delivered_through_the_outbox() {
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId(2), "a", Some(root)).unwrap();
        let listener = probe(&mut scene, root, 3);
        let node = scene.node_mut(a).unwrap();
        node.register_callback(NodeEvent::Edit, Address::local(listener)).unwrap();
        node.register_callback(NodeEvent::Shutdown, Address::local(listener)).unwrap();
        scene.init().unwrap();

        scene.notify_edited(a).unwrap();
        assert!(seen(&scene, listener).is_empty());
        assert_eq!(scene.deliver_notifications(), 1);

        scene.destroy_node(a).unwrap();
        assert_eq!(scene.deliver_notifications(), 1);
        assert_eq!(
            seen(&scene, listener),
            vec![(NodeEvent::Edit, SceneId(2)), (NodeEvent::Shutdown, SceneId(2))]
        );
    }

    #[test]
    fn notifications_to_destroyed_listeners_are_dropped() {
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId(2), "a", Some(root)).unwrap();
        let listener = probe(&mut scene, root, 3);
        scene
            .node_mut(a)
            .unwrap()
            .register_callback(NodeEvent::Edit, Address::local(listener))
            .unwrap();
        scene.notify_edited(a).unwrap();
        scene.destroy_component(listener).unwrap();
        assert_eq!(scene.deliver_notifications(), 0);
    }

    #[test]
    fn traversal_visits_children_in_order_then_child_scene() {
        let (mut scene, host) = nested();
        let root = scene.root();
        scene.create_node(SceneId(3), "under-host", Some(host)).unwrap();
        scene.create_node(SceneId(4), "sibling", Some(root)).unwrap();

        let mut names = Vec::new();
        scene.traverse(None, |visit| {
            names.push((visit.node.name().to_owned(), visit.depth, visit.hosts.len()));
            true
        });
        let expected = [
            ("Root", 0, 0),
            ("host", 1, 0),
            ("under-host", 2, 0),
            ("Root", 2, 1),
            ("inner", 3, 1),
            ("sibling", 1, 0),
        ];
        let expected: Vec<_> = expected
            .iter()
            .map(|(name, depth, hosts)| (name.to_string(), *depth, *hosts))
            .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn traversal_prunes_when_visitor_declines() {
        let (scene, _) = nested();
        let mut count = 0;
        scene.traverse(None, |visit| {
            count += 1;
            visit.node.name() != "host"
        });
        assert_eq!(count, 2);
    }
}
