//! Component classes, active instance lists and batched dispatch.

use crate::command::CommandBuffer;
use crate::component::{Behavior, ComponentType};
use crate::node::{NodeMut, SceneNode};
use crate::reference::{ComponentAddress, NodeKey};
use crate::scene::Scene;
use scenery_common::{UpdatePhase, fnv1a_32};
use std::collections::HashMap;
use std::fmt;

/// FNV-1a 32 hash of a class name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl ClassId {
    pub fn of(name: &str) -> Self {
        Self(fnv1a_32(name.as_bytes()))
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl fmt::Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassId({:08x})", self.0)
    }
}

pub type CreateFn = fn() -> Box<dyn Behavior>;
pub type UpdateFn = fn(&mut ComponentBatch<'_>, f32, UpdatePhase);

/// Factory and batched update function of one component class.
#[derive(Clone)]
pub struct ComponentClass {
    pub name: &'static str,
    pub id: ClassId,
    pub create: CreateFn,
    pub update: UpdateFn,
}

fn create_default<T: ComponentType>() -> Box<dyn Behavior> {
    Box::new(T::default())
}

impl ComponentClass {
    pub fn new(name: &'static str, create: CreateFn, update: UpdateFn) -> Self {
        Self {
            name,
            id: ClassId::of(name),
            create,
            update,
        }
    }

    pub fn of<T: ComponentType>() -> Self {
        Self::new(T::NAME, create_default::<T>, T::update)
    }
}

impl fmt::Debug for ComponentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentClass")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

/// Errors from class registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("component class '{0}' is already registered")]
    DuplicateClass(&'static str),
    #[error("component class '{name}' hashes to the same id as '{existing}'")]
    HashCollision {
        name: &'static str,
        existing: &'static str,
    },
}

/// Registered classes plus, per class, the instances active this frame.
///
/// Owned by a [`World`](crate::World); independent worlds never share one.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    classes: Vec<ComponentClass>,
    by_id: HashMap<ClassId, usize>,
    active: Vec<Vec<ComponentAddress>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: ComponentType>(&mut self) -> Result<ClassId, RegistryError> {
        self.register_class(ComponentClass::of::<T>())
    }

    pub fn register_class(&mut self, class: ComponentClass) -> Result<ClassId, RegistryError> {
        if let Some(&index) = self.by_id.get(&class.id) {
            let existing = self.classes[index].name;
            return Err(if existing == class.name {
                RegistryError::DuplicateClass(class.name)
            } else {
                RegistryError::HashCollision {
                    name: class.name,
                    existing,
                }
            });
        }
        let id = class.id;
        tracing::debug!(class = class.name, %id, "registered component class");
        self.by_id.insert(id, self.classes.len());
        self.classes.push(class);
        self.active.push(Vec::new());
        Ok(id)
    }

    pub fn class(&self, id: ClassId) -> Option<&ComponentClass> {
        self.by_id.get(&id).map(|&index| &self.classes[index])
    }

    pub fn class_by_name(&self, name: &str) -> Option<&ComponentClass> {
        self.class(ClassId::of(name))
            .filter(|class| class.name == name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ComponentClass> {
        self.classes.iter()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// A fresh instance of `id`, or `None` for an unknown class.
    pub fn create(&self, id: ClassId) -> Option<Box<dyn Behavior>> {
        self.class(id).map(|class| (class.create)())
    }

    /// Empty every active list. Run once per frame before GatherActive.
    pub fn clear_active(&mut self) {
        for list in &mut self.active {
            list.clear();
        }
    }

    /// Add an instance to its class's active list. Returns false for an
    /// unknown class.
    pub fn set_active(&mut self, class: ClassId, address: ComponentAddress) -> bool {
        match self.by_id.get(&class) {
            Some(&index) => {
                self.active[index].push(address);
                true
            }
            None => false,
        }
    }

    /// Remove an instance from its class's active list.
    pub fn set_inactive(&mut self, class: ClassId, address: &ComponentAddress) -> bool {
        let Some(&index) = self.by_id.get(&class) else {
            return false;
        };
        let list = &mut self.active[index];
        let before = list.len();
        list.retain(|entry| entry != address);
        list.len() != before
    }

    pub fn active(&self, class: ClassId) -> &[ComponentAddress] {
        self.by_id
            .get(&class)
            .map(|&index| self.active[index].as_slice())
            .unwrap_or(&[])
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().map(Vec::len).sum()
    }

    /// Run every class's batched update over its active list.
    ///
    /// Active addresses are relative to `scene`.
    pub fn dispatch(
        &self,
        dt: f32,
        phase: UpdatePhase,
        scene: &mut Scene,
        commands: &mut CommandBuffer,
    ) {
        for (class, entries) in self.classes.iter().zip(&self.active) {
            if entries.is_empty() {
                continue;
            }
            let _span =
                tracing::trace_span!("dispatch", class = class.name, count = entries.len())
                    .entered();
            let mut batch = ComponentBatch {
                scene: &mut *scene,
                entries,
                commands: &mut *commands,
            };
            (class.update)(&mut batch, dt, phase);
        }
    }
}

/// One active instance handed to a batched update.
pub struct Instance<'a, T> {
    pub component: &'a mut T,
    pub node: NodeMut<'a>,
    pub address: &'a ComponentAddress,
    pub commands: &'a mut CommandBuffer,
}

/// The active instances of one class for one phase.
pub struct ComponentBatch<'a> {
    scene: &'a mut Scene,
    entries: &'a [ComponentAddress],
    commands: &'a mut CommandBuffer,
}

impl<'a> ComponentBatch<'a> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn addresses(&self) -> &[ComponentAddress] {
        self.entries
    }

    /// Structural changes requested by the update, applied after the phase.
    pub fn commands(&mut self) -> &mut CommandBuffer {
        self.commands
    }

    /// Read any node below the batch's scene, e.g. a target another
    /// instance follows. `hosts` is relative to the batch's scene.
    pub fn node(&self, hosts: &[NodeKey], key: NodeKey) -> Option<&SceneNode> {
        self.scene.scene_at(hosts)?.node(key)
    }

    /// Read an instance without mutable access, for passes that gather
    /// data before [`ComponentBatch::for_each`].
    pub fn component<T: Behavior>(&self, address: &ComponentAddress) -> Option<&T> {
        self.scene
            .scene_at(&address.hosts)?
            .component(address.key)?
            .get::<T>()
    }

    /// The node an instance is attached to.
    pub fn component_node(&self, address: &ComponentAddress) -> Option<&SceneNode> {
        let scene = self.scene.scene_at(&address.hosts)?;
        scene.node(scene.component(address.key)?.parent()?)
    }

    /// Visit every live instance of `T` in list order. Instances destroyed
    /// since GatherActive are skipped. Returns the number visited.
    pub fn for_each<T: Behavior>(&mut self, mut f: impl FnMut(Instance<'_, T>)) -> usize {
        let entries = self.entries;
        let mut visited = 0;
        for address in entries {
            let Some(scene) = self.scene.scene_at_mut(&address.hosts) else {
                continue;
            };
            let Some((slot, key, node)) = scene.component_with_node_mut(address.key) else {
                continue;
            };
            let Some(component) = slot
                .behavior
                .as_deref_mut()
                .and_then(|behavior| behavior.downcast_mut::<T>())
            else {
                tracing::debug!(class = slot.class_name, "active instance has unexpected type");
                continue;
            };
            f(Instance {
                component,
                node: NodeMut::new(key, node),
                address,
                commands: &mut *self.commands,
            });
            visited += 1;
        }
        visited
    }
}
