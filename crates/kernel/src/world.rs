use crate::command::ApplyReport;
use crate::component::ComponentSlot;
use crate::error::SceneError;
use crate::reference::{GlobalReference, NodeAddress, ScenePath};
use crate::registry::{ComponentRegistry, RegistryError};
use crate::scene::{InstanceEvent, Scene};
use crate::serialize::{SceneLoader, SerializeContext};
use scenery_common::{LifecycleState, SceneInstanceId, Serializer, UpdatePhase, fnv1a_64, path_hash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Runtime settings of a [`World`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Deepest child-scene nesting accepted while loading.
    pub max_nesting_depth: u32,
    /// Step used by [`World::run_for`].
    pub fixed_timestep: f32,
    /// Phase order of `UpdatePhase::All`. Must equal [`UpdatePhase::SEQUENCE`].
    pub phases: Vec<UpdatePhase>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: SerializeContext::DEFAULT_MAX_DEPTH,
            fixed_timestep: 1.0 / 60.0,
            phases: UpdatePhase::SEQUENCE.to_vec(),
        }
    }
}

impl WorldConfig {
    pub fn validate(&self) -> Result<(), WorldError> {
        if self.phases != UpdatePhase::SEQUENCE {
            return Err(WorldError::PhaseOrder {
                expected: UpdatePhase::SEQUENCE.to_vec(),
                found: self.phases.clone(),
            });
        }
        if !self.fixed_timestep.is_finite() || self.fixed_timestep <= 0.0 {
            return Err(WorldError::InvalidTimestep(self.fixed_timestep));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorldError {
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("instance {instance} of {path:?} is already registered")]
    DuplicateInstance {
        path: String,
        instance: SceneInstanceId,
    },
    #[error("instance {instance} of {path:?} was never registered")]
    UnknownInstance {
        path: String,
        instance: SceneInstanceId,
    },
    #[error("world lifecycle violation: expected {expected:?}, found {found:?}")]
    Lifecycle {
        expected: LifecycleState,
        found: LifecycleState,
    },
    #[error("update phases must run in order {expected:?}, configured {found:?}")]
    PhaseOrder {
        expected: Vec<UpdatePhase>,
        found: Vec<UpdatePhase>,
    },
    #[error("timestep must be finite and positive, got {0}")]
    InvalidTimestep(f32),
}

/// The "current" component for each view role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewRole {
    DrawCamera,
    CullCamera,
    InputConsumer,
}

impl ViewRole {
    pub const ALL: [ViewRole; 3] = [
        ViewRole::DrawCamera,
        ViewRole::CullCamera,
        ViewRole::InputConsumer,
    ];

    fn index(self) -> usize {
        match self {
            ViewRole::DrawCamera => 0,
            ViewRole::CullCamera => 1,
            ViewRole::InputConsumer => 2,
        }
    }
}

#[derive(Debug, Clone)]
struct InstanceList {
    path: String,
    instances: Vec<SceneInstanceId>,
}

/// Top-level runtime context.
///
/// Owns the root scene and the component registry, drives the update
/// sequence, and tracks every live scene instance that came from a file.
pub struct World {
    config: WorldConfig,
    state: LifecycleState,
    root: Scene,
    registry: ComponentRegistry,
    /// Path hash -> live instances of that scene file.
    instances: BTreeMap<u64, InstanceList>,
    views: [Option<GlobalReference<ComponentSlot>>; 3],
    frame: u64,
    /// Instance events seen so far, oldest first.
    events: Vec<InstanceEvent>,
}

impl World {
    /// A world with default settings, an empty root scene and no classes.
    pub fn new() -> Self {
        Self {
            config: WorldConfig::default(),
            state: LifecycleState::Shutdown,
            root: Scene::new(),
            registry: ComponentRegistry::new(),
            instances: BTreeMap::new(),
            views: [None, None, None],
            frame: 0,
            events: Vec::new(),
        }
    }

    pub fn with_config(config: WorldConfig) -> Result<Self, WorldError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new()
        })
    }

    pub fn with_registry(self, registry: ComponentRegistry) -> Self {
        Self { registry, ..self }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Completed `UpdatePhase::All` frames (or PreRender phases).
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn root(&self) -> &Scene {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Scene {
        &mut self.root
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ComponentRegistry {
        &mut self.registry
    }

    /// The scene at `hosts` together with the registry, for callers that
    /// create components.
    pub fn scene_and_registry_mut(
        &mut self,
        hosts: &[crate::NodeKey],
    ) -> Option<(&mut Scene, &ComponentRegistry)> {
        let scene = self.root.scene_at_mut(hosts)?;
        Some((scene, &self.registry))
    }

    pub fn serialize_context(&self) -> SerializeContext<'_> {
        SerializeContext::new(&self.registry).with_max_depth(self.config.max_nesting_depth)
    }

    /// Replace the root scene. Only allowed while shut down; returns the
    /// previous root.
    pub fn set_root_scene(&mut self, scene: Scene) -> Result<Scene, WorldError> {
        self.expect_state(LifecycleState::Shutdown)?;
        let previous = std::mem::replace(&mut self.root, scene);
        for (path, instance) in previous.sourced_instances() {
            self.record(InstanceEvent::Released { path, instance });
        }
        for (path, instance) in self.root.sourced_instances() {
            self.record(InstanceEvent::Attached { path, instance });
        }
        self.views = [None, None, None];
        self.sync_outbox();
        Ok(previous)
    }

    fn expect_state(&self, expected: LifecycleState) -> Result<(), WorldError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(WorldError::Lifecycle {
                expected,
                found: self.state,
            })
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn init(&mut self) -> Result<(), WorldError> {
        self.expect_state(LifecycleState::Shutdown)?;
        let _span = tracing::info_span!("world_init").entered();
        self.root.init()?;
        self.state = LifecycleState::Init;
        self.sync_outbox();
        Ok(())
    }

    pub fn post_init(&mut self) -> Result<(), WorldError> {
        self.expect_state(LifecycleState::Init)?;
        self.root.post_init()?;
        self.state = LifecycleState::PostInit;
        self.sync_outbox();
        self.resolve_views();
        tracing::info!(
            nodes = self.root.node_count(),
            components = self.root.component_count(),
            "world running"
        );
        Ok(())
    }

    pub fn shutdown(&mut self) -> Result<(), WorldError> {
        if self.state == LifecycleState::Shutdown {
            return Err(WorldError::Lifecycle {
                expected: LifecycleState::PostInit,
                found: self.state,
            });
        }
        let _span = tracing::info_span!("world_shutdown").entered();
        self.root.shutdown()?;
        self.registry.clear_active();
        self.state = LifecycleState::Shutdown;
        self.sync_outbox();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Run one phase, or the whole sequence for `UpdatePhase::All`.
    ///
    /// Within a phase the scene-tree work precedes the batched class
    /// updates; queued commands are applied and notifications delivered
    /// before the next phase starts.
    pub fn update(&mut self, dt: f32, phase: UpdatePhase) -> Result<ApplyReport, WorldError> {
        self.expect_state(LifecycleState::PostInit)?;
        if !dt.is_finite() || dt < 0.0 {
            return Err(WorldError::InvalidTimestep(dt));
        }
        let mut report = ApplyReport::default();
        if phase == UpdatePhase::All {
            for index in 0..self.config.phases.len() {
                let phase = self.config.phases[index];
                report.merge(self.run_phase(dt, phase));
            }
            self.frame += 1;
        } else {
            report.merge(self.run_phase(dt, phase));
            if phase == UpdatePhase::PreRender {
                self.frame += 1;
            }
        }
        Ok(report)
    }

    fn run_phase(&mut self, dt: f32, phase: UpdatePhase) -> ApplyReport {
        let report = self.root.update(dt, phase, &mut self.registry);
        if report.failed > 0 {
            tracing::debug!(?phase, failed = report.failed, "some commands failed");
        }
        self.sync_outbox();
        report
    }

    /// Step `UpdatePhase::All` at the configured fixed timestep for
    /// `seconds` of simulated time. Returns the number of frames run.
    pub fn run_for(&mut self, seconds: f32) -> Result<u64, WorldError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(WorldError::InvalidTimestep(seconds));
        }
        let step = self.config.fixed_timestep;
        let frames = (seconds / step).round() as u64;
        for _ in 0..frames {
            self.update(step, UpdatePhase::All)?;
        }
        Ok(frames)
    }

    /// Apply every deferred scene command and deliver pending events now.
    pub fn flush(&mut self) -> ApplyReport {
        let report = self.root.flush_deferred(&self.registry);
        self.sync_outbox();
        report
    }

    /// Drain the scene tree's outbox: instance events update the instance
    /// registry, notifications go to their listeners. Returns the number
    /// of notifications delivered.
    fn sync_outbox(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let outbox = self.root.take_outbox();
            if outbox.is_empty() {
                return delivered;
            }
            for event in outbox.instances {
                self.record(event);
            }
            delivered += self.root.deliver(outbox.notifications);
        }
    }

    fn record(&mut self, event: InstanceEvent) {
        let result = match &event {
            InstanceEvent::Attached { path, instance } => {
                self.add_scene_instance(path, *instance)
            }
            InstanceEvent::Released { path, instance } => {
                self.remove_scene_instance(path, *instance)
            }
        };
        if let Err(err) = result {
            tracing::warn!(%err, "instance registry out of sync");
        }
        self.events.push(event);
    }

    /// Instance events recorded so far.
    pub fn events(&self) -> &[InstanceEvent] {
        &self.events
    }

    pub fn drain_events(&mut self) -> Vec<InstanceEvent> {
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------
    // Scene instances
    // ------------------------------------------------------------------

    pub fn add_scene_instance(
        &mut self,
        path: &str,
        instance: SceneInstanceId,
    ) -> Result<(), WorldError> {
        let entry = self
            .instances
            .entry(path_hash(path))
            .or_insert_with(|| InstanceList {
                path: path.to_owned(),
                instances: Vec::new(),
            });
        if entry.instances.contains(&instance) {
            return Err(WorldError::DuplicateInstance {
                path: path.to_owned(),
                instance,
            });
        }
        entry.instances.push(instance);
        tracing::debug!(path, %instance, "scene instance added");
        Ok(())
    }

    pub fn remove_scene_instance(
        &mut self,
        path: &str,
        instance: SceneInstanceId,
    ) -> Result<(), WorldError> {
        let hash = path_hash(path);
        let unknown = || WorldError::UnknownInstance {
            path: path.to_owned(),
            instance,
        };
        let entry = self.instances.get_mut(&hash).ok_or_else(unknown)?;
        let index = entry
            .instances
            .iter()
            .position(|i| *i == instance)
            .ok_or_else(unknown)?;
        entry.instances.remove(index);
        if entry.instances.is_empty() {
            self.instances.remove(&hash);
        }
        tracing::debug!(path, %instance, "scene instance removed");
        Ok(())
    }

    /// Live instances created from the scene file at `path`.
    pub fn scene_instances(&self, path: &str) -> &[SceneInstanceId] {
        self.instances
            .get(&path_hash(path))
            .map(|entry| entry.instances.as_slice())
            .unwrap_or(&[])
    }

    /// Every registered scene path with its instance count.
    pub fn instance_paths(&self) -> impl Iterator<Item = (&str, usize)> {
        self.instances
            .values()
            .map(|entry| (entry.path.as_str(), entry.instances.len()))
    }

    /// Host paths of every live scene loaded from `path`.
    pub fn locate_instances(&self, path: &str) -> Vec<ScenePath> {
        let mut found = Vec::new();
        let mut stack = vec![(ScenePath::new(), &self.root)];
        while let Some((hosts, scene)) = stack.pop() {
            if scene.source() == Some(path) {
                found.push(hosts.clone());
            }
            for (host, child) in scene.child_scenes() {
                let mut nested = hosts.clone();
                nested.push(host);
                stack.push((nested, child));
            }
        }
        found
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Reparent across the tree, preserving world pose. Both nodes must be
    /// in the same scene.
    pub fn reparent(&mut self, node: &NodeAddress, parent: &NodeAddress) -> Result<(), WorldError> {
        if node.hosts != parent.hosts {
            return Err(SceneError::CrossScene.into());
        }
        let scene = self
            .root
            .scene_at_mut(&node.hosts)
            .ok_or(SceneError::StaleScene)?;
        scene.set_parent(node.key, Some(parent.key))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn set_view(&mut self, role: ViewRole, view: Option<GlobalReference<ComponentSlot>>) {
        self.views[role.index()] = view;
    }

    pub fn view(&self, role: ViewRole) -> Option<&GlobalReference<ComponentSlot>> {
        self.views[role.index()].as_ref()
    }

    /// Resolve every set view against the root scene. Returns how many
    /// resolved.
    pub fn resolve_views(&mut self) -> usize {
        let mut resolved = 0;
        for (role, view) in ViewRole::ALL.iter().zip(self.views.iter_mut()) {
            let Some(view) = view else {
                continue;
            };
            if self.root.resolve_global(view) {
                resolved += 1;
            } else {
                tracing::warn!(?role, id = %view.id(), "view reference does not resolve");
            }
        }
        resolved
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// World document: `Config` plus either `RootScenePath` or an inline
    /// `RootScene`. Reading replaces the configuration and the root scene
    /// and requires the world to be shut down.
    pub fn serialize(&mut self, s: &mut dyn Serializer, loader: Option<&dyn SceneLoader>) -> bool {
        let reading = s.is_reading();
        if reading && self.state != LifecycleState::Shutdown {
            let message = format!("cannot read a world in state {:?}", self.state);
            tracing::warn!("{message}");
            s.report_error(message);
            return false;
        }
        if !s.begin_object(None) {
            return false;
        }
        let mut ok = true;
        if !reading || s.has_field("Config") {
            ok &= self.serialize_config(s);
        }

        let mut ctx = SerializeContext::new(&self.registry)
            .with_max_depth(self.config.max_nesting_depth);
        if let Some(loader) = loader {
            ctx = ctx.with_loader(loader);
        }

        let mut replacement = None;
        if reading {
            if s.has_field("RootScenePath") {
                let mut path = String::new();
                ok &= s.value(&mut path, Some("RootScenePath"));
                let mut scene = Scene::new();
                match loader {
                    Some(loader) => ok &= loader.load(&path, &mut scene, ctx),
                    None => {
                        let message = format!("no loader for root scene {path:?}");
                        tracing::warn!("{message}");
                        s.report_error(message);
                        ok = false;
                    }
                }
                scene.set_source(Some(path));
                replacement = Some(scene);
            } else if self.root.source().is_none() {
                ok &= self.root.serialize(s, Some("RootScene"), ctx);
            } else {
                let mut scene = Scene::new();
                ok &= scene.serialize(s, Some("RootScene"), ctx);
                replacement = Some(scene);
            }
        } else if let Some(path) = self.root.source() {
            let mut path = path.to_owned();
            ok &= s.value(&mut path, Some("RootScenePath"));
        } else {
            ok &= self.root.serialize(s, Some("RootScene"), ctx);
        }
        s.end_object();

        if let Some(scene) = replacement {
            if let Err(err) = self.set_root_scene(scene) {
                s.report_error(err.to_string());
                ok = false;
            }
        }
        self.sync_outbox();
        ok
    }

    fn serialize_config(&mut self, s: &mut dyn Serializer) -> bool {
        if !s.begin_object(Some("Config")) {
            return false;
        }
        let mut config = self.config.clone();
        let mut ok = s.value(&mut config.max_nesting_depth, Some("MaxNestingDepth"));
        ok &= s.value(&mut config.fixed_timestep, Some("FixedTimestep"));
        s.end_object();
        if s.is_reading() {
            match config.validate() {
                Ok(()) => self.config = config,
                Err(err) => {
                    tracing::warn!(%err, "ignoring invalid world config");
                    s.report_error(err.to_string());
                    ok = false;
                }
            }
        }
        ok
    }

    /// Deterministic hash of every node's id and local transform, in
    /// traversal order.
    pub fn state_hash(&self) -> u64 {
        let mut bytes = Vec::with_capacity(self.root.node_count() * 42);
        bytes.extend_from_slice(&self.frame.to_le_bytes());
        self.root.traverse(None, |visit| {
            let local = visit.node.local();
            bytes.extend_from_slice(&visit.node.id().raw().to_le_bytes());
            for value in local
                .position
                .to_array()
                .into_iter()
                .chain(local.rotation.to_array())
                .chain(local.scale.to_array())
            {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            true
        });
        fnv1a_64(&bytes)
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("state", &self.state)
            .field("frame", &self.frame)
            .field("root", &self.root)
            .field("classes", &self.registry.len())
            .field("instance_paths", &self.instances.len())
            .finish()
    }
}
