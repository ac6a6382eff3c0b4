//! Scene and world documents on disk.
//!
//! A document is a JSON tree produced by [`JsonSerializer`]. Files ending in
//! `.scnb` hold the same tree in the binary cache format; reading detects
//! the format from the file contents.

use crate::json::JsonSerializer;
use crate::{PersistError, binary};
use scenery_common::Serializer;
use scenery_kernel::{ComponentRegistry, Scene, SceneLoader, SerializeContext, World};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Binary,
}

impl Format {
    /// Format to write for `path`, by extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("scnb") => Format::Binary,
            _ => Format::Json,
        }
    }
}

/// Outcome of reading a document into live state. A read that is not
/// clean still applied every entry it could.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub clean: bool,
    /// First problem the serializer recorded.
    pub error: Option<String>,
}

impl LoadReport {
    fn finish(ok: bool, reader: JsonSerializer) -> Self {
        let error = reader.into_error();
        Self {
            clean: ok && error.is_none(),
            error,
        }
    }
}

pub fn read_document(path: &Path) -> Result<Value, PersistError> {
    let data = std::fs::read(path)?;
    if binary::is_cache(&data) {
        binary::decode(&data)
    } else {
        Ok(serde_json::from_slice(&data)?)
    }
}

pub fn write_document(path: &Path, document: &Value) -> Result<(), PersistError> {
    let data = match Format::from_path(path) {
        Format::Json => serde_json::to_vec_pretty(document)?,
        Format::Binary => binary::encode(document)?,
    };
    std::fs::write(path, data)?;
    Ok(())
}

fn finish_write(ok: bool, writer: JsonSerializer) -> Result<Value, PersistError> {
    if let Some(message) = Serializer::error(&writer) {
        return Err(PersistError::Serializer(message.to_owned()));
    }
    match writer.into_value() {
        Some(value) if ok => Ok(value),
        _ => Err(PersistError::Serializer("document was not completed".into())),
    }
}

pub fn scene_to_value(scene: &mut Scene, ctx: SerializeContext<'_>) -> Result<Value, PersistError> {
    let mut writer = JsonSerializer::writer();
    let ok = scene.serialize(&mut writer, None, ctx);
    finish_write(ok, writer)
}

/// Read `document` into `scene`, reconciling with whatever it holds.
pub fn read_scene(scene: &mut Scene, document: Value, ctx: SerializeContext<'_>) -> LoadReport {
    let mut reader = JsonSerializer::reader(document);
    let ok = scene.serialize(&mut reader, None, ctx);
    let report = LoadReport::finish(ok, reader);
    if let Some(error) = &report.error {
        tracing::warn!(%error, "scene read with errors");
    }
    report
}

/// Load a scene file. Child scenes referenced by path are resolved relative
/// to the file's directory.
pub fn load_scene(
    path: &Path,
    registry: &ComponentRegistry,
) -> Result<(Scene, LoadReport), PersistError> {
    let document = read_document(path)?;
    let loader = FileSceneLoader::for_file(path);
    let ctx = SerializeContext::new(registry).with_loader(&loader);
    let mut scene = Scene::new();
    let report = read_scene(&mut scene, document, ctx);
    scene.set_source(Some(path.to_string_lossy().into_owned()));
    tracing::info!(path = %path.display(), nodes = scene.node_count(), "loaded scene");
    Ok((scene, report))
}

pub fn save_scene(
    scene: &mut Scene,
    path: &Path,
    ctx: SerializeContext<'_>,
) -> Result<(), PersistError> {
    let document = scene_to_value(scene, ctx)?;
    write_document(path, &document)?;
    tracing::info!(path = %path.display(), "saved scene");
    Ok(())
}

pub fn world_to_value(world: &mut World) -> Result<Value, PersistError> {
    let mut writer = JsonSerializer::writer();
    let ok = world.serialize(&mut writer, None);
    finish_write(ok, writer)
}

/// Read a world document into a shut-down world.
pub fn load_world(world: &mut World, path: &Path) -> Result<LoadReport, PersistError> {
    let document = read_document(path)?;
    let loader = FileSceneLoader::for_file(path);
    let mut reader = JsonSerializer::reader(document);
    let ok = world.serialize(&mut reader, Some(&loader));
    let report = LoadReport::finish(ok, reader);
    if let Some(error) = &report.error {
        tracing::warn!(%error, path = %path.display(), "world read with errors");
    }
    Ok(report)
}

pub fn save_world(world: &mut World, path: &Path) -> Result<(), PersistError> {
    let document = world_to_value(world)?;
    write_document(path, &document)?;
    tracing::info!(path = %path.display(), "saved world");
    Ok(())
}

/// Resolves scene paths against a base directory.
#[derive(Debug, Clone)]
pub struct FileSceneLoader {
    base: PathBuf,
}

impl FileSceneLoader {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Loader for paths written inside the document at `path`.
    pub fn for_file(path: &Path) -> Self {
        Self::new(path.parent().unwrap_or(Path::new(".")))
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        self.base.join(path)
    }
}

impl SceneLoader for FileSceneLoader {
    fn load(&self, path: &str, scene: &mut Scene, ctx: SerializeContext<'_>) -> bool {
        let file = self.resolve(path);
        match read_document(&file) {
            Ok(document) => {
                tracing::debug!(path = %file.display(), depth = ctx.depth, "loading child scene");
                read_scene(scene, document, ctx).clean
            }
            Err(err) => {
                tracing::warn!(path = %file.display(), %err, "failed to load scene file");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};
    use scenery_common::{LifecycleState, SceneId, Transform};
    use scenery_ecs::{Spin, register_stock_components};
    use scenery_kernel::{ClassId, ComponentType, NodeKey};
    use proptest::prelude::*;
    use serde_json::json;

    type Outline = Vec<(u16, String, Option<u16>, Vec<u16>, Vec<u16>)>;

    fn outline(scene: &Scene) -> Outline {
        let mut out: Outline = scene
            .nodes()
            .filter(|(_, node)| !node.is_transient())
            .map(|(_, node)| {
                (
                    node.id().raw(),
                    node.name().to_owned(),
                    node.parent_ref().map(|parent| parent.id().raw()),
                    node.child_refs()
                        .iter()
                        .filter(|child| !child.is_transient())
                        .map(|child| child.id().raw())
                        .collect(),
                    node.component_refs()
                        .iter()
                        .filter(|component| !component.is_transient())
                        .map(|component| component.id().raw())
                        .collect(),
                )
            })
            .collect();
        out.sort();
        out
    }

    fn node_entry(id: u32, name: &str, parent: u32, children: &[u32]) -> Value {
        let children: Vec<Value> = children.iter().map(|child| json!([child, ""])).collect();
        json!({
            "ID": id,
            "Name": name,
            "Flags": 1,
            "LocalTransform": {
                "Position": [0.0, 0.0, 0.0],
                "Rotation": [0.0, 0.0, 0.0, 1.0],
                "Scale": [1.0, 1.0, 1.0]
            },
            "Hierarchy": { "Parent": [parent, ""], "Children": children },
            "Components": []
        })
    }

    fn registry() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        register_stock_components(&mut registry).unwrap();
        registry
    }

    /// Root(1) -> A(2) -> B(3, Spin 10), plus a transient node under A.
    fn sample(registry: &ComponentRegistry) -> (Scene, NodeKey) {
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId::new(2), "A", Some(root)).unwrap();
        let b = scene.create_node(SceneId::new(3), "B", Some(a)).unwrap();
        scene.node_mut(b).unwrap().set_local(Transform {
            position: Vec3::new(1.5, -2.0, 0.25),
            rotation: Quat::from_rotation_y(0.3),
            scale: Vec3::splat(2.0),
        });
        let spin = scene
            .add_component(b, SceneId::new(10), ClassId::of(Spin::NAME), registry)
            .unwrap();
        let data = scene.component_mut(spin).unwrap().get_mut::<Spin>().unwrap();
        data.axis = Vec3::Z;
        data.speed = 2.5;
        scene.create_transient_node("scratch", a).unwrap();
        (scene, a)
    }

    #[test]
    fn scene_roundtrip_is_isomorphic() {
        let registry = registry();
        let (mut scene, _) = sample(&registry);
        let document = scene_to_value(&mut scene, SerializeContext::new(&registry)).unwrap();

        let mut copy = Scene::new();
        let report = read_scene(&mut copy, document, SerializeContext::new(&registry));
        assert!(report.clean, "{report:?}");
        assert_eq!(outline(&copy), outline(&scene));
        assert_eq!(copy.node_count(), scene.node_count() - 1);

        let b = copy.node_by_id(SceneId::new(3)).unwrap();
        let original = scene.node(scene.node_by_id(SceneId::new(3)).unwrap()).unwrap();
        assert_eq!(copy.node(b).unwrap().local(), original.local());
        assert_eq!(copy.node(b).unwrap().initial(), original.local());

        let spin = copy.component_by_id(SceneId::new(10)).unwrap();
        let spin = copy.component(spin).unwrap().get::<Spin>().unwrap();
        assert_eq!(spin.axis, Vec3::Z);
        assert_eq!(spin.speed, 2.5);
    }

    #[test]
    fn transient_objects_are_not_written() {
        let registry = registry();
        let (mut scene, _) = sample(&registry);
        let document = scene_to_value(&mut scene, SerializeContext::new(&registry)).unwrap();
        let names: Vec<&str> = document["Nodes"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|node| node["Name"].as_str())
            .collect();
        assert_eq!(names, vec!["Root", "A", "B"]);
    }

    #[test]
    fn unknown_class_is_skipped() {
        let registry = registry();
        let mut root = node_entry(1, "Root", 0, &[]);
        root["Components"] = json!([[5, "Mystery"]]);
        let document = json!({
            "RootNodeID": 1,
            "Nodes": [root],
            "Components": [{ "ID": 5, "Class": "Mystery", "Data": {} }]
        });
        let mut scene = Scene::new();
        let report = read_scene(&mut scene, document, SerializeContext::new(&registry));
        assert!(!report.clean);
        assert!(report.error.unwrap().contains("Mystery"));
        assert_eq!(scene.node_count(), 1);
        assert_eq!(scene.component_count(), 0);
    }

    #[test]
    fn reload_reuses_live_objects_and_frees_missing_ones() {
        let registry = registry();
        let mut world = World::new().with_registry(registry);
        let (scene, a) = sample(world.registry());
        world.set_root_scene(scene).unwrap();
        world.init().unwrap();
        world.post_init().unwrap();

        let mut document =
            scene_to_value(world.root_mut(), SerializeContext::new(&ComponentRegistry::new()))
                .unwrap();
        let nodes = document["Nodes"].as_array_mut().unwrap();
        nodes.retain(|node| node["ID"] != 3);
        for node in nodes.iter_mut() {
            if node["ID"] == 2 {
                node["Name"] = json!("Renamed");
                node["Hierarchy"]["Children"] = json!([]);
            }
        }
        document["Components"].as_array_mut().unwrap().clear();

        let (scene, registry) = world.scene_and_registry_mut(&[]).unwrap();
        let report = read_scene(scene, document, SerializeContext::new(registry));
        assert!(report.clean, "{report:?}");
        assert_eq!(scene.node_by_id(SceneId::new(2)), Some(a));
        assert_eq!(scene.node(a).unwrap().name(), "Renamed");
        assert!(scene.node_by_id(SceneId::new(3)).is_none());
        assert!(scene.component_by_id(SceneId::new(10)).is_none());
        assert_eq!(scene.state(), LifecycleState::PostInit);
    }

    #[test]
    fn child_scene_loads_from_path() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry();

        let mut child = Scene::new();
        let root = child.root();
        child.create_node(SceneId::new(2), "Inner", Some(root)).unwrap();
        save_scene(&mut child, &tmp.path().join("child.json"), SerializeContext::new(&registry))
            .unwrap();

        let mut host = node_entry(2, "Host", 1, &[]);
        host["ChildScenePath"] = json!("child.json");
        let parent = json!({
            "RootNodeID": 1,
            "Nodes": [node_entry(1, "Root", 0, &[2]), host],
            "Components": []
        });
        let parent_path = tmp.path().join("parent.json");
        write_document(&parent_path, &parent).unwrap();

        let (scene, report) = load_scene(&parent_path, &registry).unwrap();
        assert!(report.clean, "{report:?}");
        let host = scene.node_by_id(SceneId::new(2)).unwrap();
        let inner = scene.node(host).unwrap().child_scene().unwrap();
        assert_eq!(inner.source(), Some("child.json"));
        let node = inner.node_by_id(SceneId::new(2)).unwrap();
        assert_eq!(inner.node(node).unwrap().name(), "Inner");
        assert!(
            scene
                .sourced_instances()
                .iter()
                .any(|(path, _)| path == "child.json")
        );
    }

    #[test]
    fn self_instancing_scene_stops_at_nesting_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry();
        let mut root = node_entry(1, "Root", 0, &[]);
        root["ChildScenePath"] = json!("loop.json");
        let document = json!({ "RootNodeID": 1, "Nodes": [root], "Components": [] });
        let path = tmp.path().join("loop.json");
        write_document(&path, &document).unwrap();

        let (scene, _) = load_scene(&path, &registry).unwrap();
        let mut depth = 1;
        let mut current = &scene;
        while let Some(child) = current
            .node(current.root())
            .and_then(|root| root.child_scene())
        {
            depth += 1;
            current = child;
        }
        assert_eq!(depth, SerializeContext::DEFAULT_MAX_DEPTH + 1);
    }

    #[test]
    fn binary_scene_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry();
        let (mut scene, _) = sample(&registry);
        let path = tmp.path().join("scene.scnb");
        save_scene(&mut scene, &path, SerializeContext::new(&registry)).unwrap();
        assert!(binary::is_cache(&std::fs::read(&path).unwrap()));

        let (copy, report) = load_scene(&path, &registry).unwrap();
        assert!(report.clean, "{report:?}");
        assert_eq!(outline(&copy), outline(&scene));
    }

    #[test]
    fn world_roundtrip_preserves_config_and_state_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let mut world = World::new().with_registry(registry());
        let (scene, _) = sample(world.registry());
        world.set_root_scene(scene).unwrap();
        let path = tmp.path().join("world.json");

        let mut document = world_to_value(&mut world).unwrap();
        document["Config"]["FixedTimestep"] = json!(0.02);
        write_document(&path, &document).unwrap();

        let mut copy = World::new().with_registry(registry());
        let report = load_world(&mut copy, &path).unwrap();
        assert!(report.clean, "{report:?}");
        assert_eq!(copy.config().fixed_timestep, 0.02);
        assert_eq!(copy.root().node_count(), world.root().node_count() - 1);

        let mut reference = World::new().with_registry(registry());
        let (mut scene, _) = sample(reference.registry());
        let transient = scene
            .nodes()
            .find(|(_, node)| node.is_transient())
            .map(|(key, _)| key)
            .unwrap();
        scene.destroy_node(transient).unwrap();
        reference.set_root_scene(scene).unwrap();

        copy.init().unwrap();
        reference.init().unwrap();
        assert_eq!(copy.state_hash(), reference.state_hash());
    }

    #[test]
    fn world_read_requires_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("world.json");
        let mut world = World::new();
        save_world(&mut world, &path).unwrap();
        world.init().unwrap();
        let report = load_world(&mut world, &path).unwrap();
        assert!(!report.clean);
    }

    /// (parent pick, name, active, with Spin) per generated node.
    fn hierarchy() -> impl Strategy<Value = Vec<(prop::sample::Index, String, bool, bool)>> {
        prop::collection::vec(
            (any::<prop::sample::Index>(), "[a-z]{1,8}", any::<bool>(), any::<bool>()),
            1..24,
        )
    }

    proptest! {
        #[test]
        fn generated_hierarchies_round_trip(plan in hierarchy()) {
            let registry = registry();
            let mut scene = Scene::new();
            let mut keys = vec![scene.root()];
            for (i, (pick, name, active, spin)) in plan.iter().enumerate() {
                let id = 2 + 2 * i as u16;
                let parent = keys[pick.index(keys.len())];
                let key = scene.create_node(SceneId::new(id), name.as_str(), Some(parent)).unwrap();
                scene.node_mut(key).unwrap().set_active(*active);
                if *spin {
                    scene
                        .add_component(key, SceneId::new(id + 1), ClassId::of(Spin::NAME), &registry)
                        .unwrap();
                }
                keys.push(key);
            }
            let document = scene_to_value(&mut scene, SerializeContext::new(&registry)).unwrap();

            let mut copy = Scene::new();
            let report = read_scene(&mut copy, document, SerializeContext::new(&registry));
            prop_assert!(report.clean, "{report:?}");
            prop_assert_eq!(outline(&copy), outline(&scene));
            for (_, node) in scene.nodes() {
                let twin = copy.node_by_id(node.id()).and_then(|key| copy.node(key)).unwrap();
                prop_assert_eq!(twin.flags(), node.flags());
            }
        }
    }
}
