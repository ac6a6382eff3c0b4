use scenery_kernel::{LocalReference, Referent, Scene, World};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Scene inspector for developer tooling.
///
/// Read-only queries against scenes and worlds for debugging and the CLI.
pub struct SceneInspector;

/// Counts over a scene and every scene nested below it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SceneSummary {
    pub scenes: usize,
    pub nodes: usize,
    pub components: usize,
    pub transient_nodes: usize,
    pub transient_components: usize,
    /// Deepest child-scene nesting below the inspected scene.
    pub nesting_depth: usize,
    /// Distinct source paths of nested scenes.
    pub sources: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassCount {
    pub class: &'static str,
    pub active: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorldSummary {
    pub state: String,
    pub frame: u64,
    pub state_hash: u64,
    pub scene: SceneSummary,
    /// Active instances per registered class, as of the last GatherActive.
    pub classes: Vec<ClassCount>,
    /// Registered scene paths with their live instance counts.
    pub instances: BTreeMap<String, usize>,
}

/// One line of the hierarchy dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    pub depth: usize,
    /// Number of child-scene boundaries between the dump's scene and this node.
    pub scene_depth: usize,
    pub id: u16,
    pub name: String,
    pub active: bool,
    pub transient: bool,
    pub components: Vec<&'static str>,
    pub child_scene: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RefKind {
    Parent,
    Child,
    Component,
}

/// A stored reference that does not resolve in its scene.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct UnresolvedRef {
    /// Ids of the host nodes leading to the scene, outermost first.
    pub scene: Vec<u16>,
    pub node: u16,
    pub kind: RefKind,
    pub target: u16,
}

impl SceneInspector {
    pub fn summary(scene: &Scene) -> SceneSummary {
        let mut summary = SceneSummary::default();
        Self::accumulate(scene, 0, &mut summary);
        summary
    }

    fn accumulate(scene: &Scene, depth: usize, summary: &mut SceneSummary) {
        summary.scenes += 1;
        summary.nesting_depth = summary.nesting_depth.max(depth);
        for (_, node) in scene.nodes() {
            summary.nodes += 1;
            if node.is_transient() {
                summary.transient_nodes += 1;
            }
        }
        for (_, slot) in scene.components() {
            summary.components += 1;
            if slot.is_transient() {
                summary.transient_components += 1;
            }
        }
        for (_, child) in scene.child_scenes() {
            if let Some(source) = child.source() {
                summary.sources.insert(source.to_owned());
            }
            Self::accumulate(child, depth + 1, summary);
        }
    }

    pub fn world_summary(world: &World) -> WorldSummary {
        let registry = world.registry();
        let mut classes: Vec<ClassCount> = registry
            .classes()
            .map(|class| ClassCount {
                class: class.name,
                active: registry.active(class.id).len(),
            })
            .collect();
        classes.sort_by(|a, b| a.class.cmp(b.class));
        WorldSummary {
            state: format!("{:?}", world.state()),
            frame: world.frame(),
            state_hash: world.state_hash(),
            scene: Self::summary(world.root()),
            classes,
            instances: world
                .instance_paths()
                .map(|(path, count)| (path.to_owned(), count))
                .collect(),
        }
    }

    /// Depth-first hierarchy dump from the root. Only resolved links are
    /// followed, so the scene should have been initialized.
    pub fn tree(scene: &Scene) -> Vec<TreeEntry> {
        let mut entries = Vec::new();
        scene.traverse(None, |visit| {
            let components = visit
                .node
                .component_refs()
                .iter()
                .filter_map(|reference| {
                    let key = resolved(visit.scene, reference)?;
                    visit.scene.component(key).map(|slot| slot.class_name())
                })
                .collect();
            entries.push(TreeEntry {
                depth: visit.depth,
                scene_depth: visit.hosts.len(),
                id: visit.node.id().raw(),
                name: visit.node.name().to_owned(),
                active: visit.node.is_active(),
                transient: visit.node.is_transient(),
                components,
                child_scene: visit
                    .node
                    .child_scene()
                    .map(|child| child.source().unwrap_or("<inline>").to_owned()),
            });
            true
        });
        entries
    }

    pub fn render_tree(entries: &[TreeEntry]) -> String {
        let mut out = String::new();
        for entry in entries {
            let indent = "  ".repeat(entry.depth);
            out.push_str(&format!("{indent}{} [{:04x}]", entry.name, entry.id));
            if !entry.components.is_empty() {
                out.push_str(&format!(" ({})", entry.components.join(", ")));
            }
            if let Some(source) = &entry.child_scene {
                out.push_str(&format!(" -> {source}"));
            }
            if !entry.active {
                out.push_str(" inactive");
            }
            out.push('\n');
        }
        out
    }

    /// Every parent, child and component reference in the scene tree that
    /// does not resolve, sorted by scene and node.
    pub fn unresolved(scene: &Scene) -> Vec<UnresolvedRef> {
        let mut found = Vec::new();
        Self::collect_unresolved(scene, &mut Vec::new(), &mut found);
        found.sort();
        if !found.is_empty() {
            tracing::debug!(count = found.len(), "unresolved references");
        }
        found
    }

    fn collect_unresolved(scene: &Scene, hosts: &mut Vec<u16>, found: &mut Vec<UnresolvedRef>) {
        for (_, node) in scene.nodes() {
            let mut report = |kind: RefKind, target: u16| {
                found.push(UnresolvedRef {
                    scene: hosts.clone(),
                    node: node.id().raw(),
                    kind,
                    target,
                });
            };
            if let Some(parent) = node.parent_ref() {
                if resolved(scene, parent).is_none() {
                    report(RefKind::Parent, parent.id().raw());
                }
            }
            for child in node.child_refs() {
                if resolved(scene, child).is_none() {
                    report(RefKind::Child, child.id().raw());
                }
            }
            for component in node.component_refs() {
                if resolved(scene, component).is_none() {
                    report(RefKind::Component, component.id().raw());
                }
            }
        }
        for (host, child) in scene.child_scenes() {
            let Some(host) = scene.node(host) else {
                continue;
            };
            hosts.push(host.id().raw());
            Self::collect_unresolved(child, hosts, found);
            hosts.pop();
        }
    }
}

fn resolved<T: Referent>(scene: &Scene, reference: &LocalReference<T>) -> Option<T::Key> {
    let mut reference = *reference;
    scene
        .resolve_reference(&mut reference)
        .then(|| reference.handle())
        .flatten()
}

impl fmt::Display for SceneSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scenes={} nodes={} (transient {}) components={} (transient {}) depth={}",
            self.scenes,
            self.nodes,
            self.transient_nodes,
            self.components,
            self.transient_components,
            self.nesting_depth
        )
    }
}

impl fmt::Display for WorldSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "World: state={} frame={} hash={:016x}",
            self.state, self.frame, self.state_hash
        )?;
        write!(f, "  {}", self.scene)?;
        for class in &self.classes {
            write!(f, "\n  {}: {} active", class.class, class.active)?;
        }
        for (path, count) in &self.instances {
            write!(f, "\n  {path}: {count} instance(s)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenery_common::{SceneId, UpdatePhase};
    use scenery_ecs::{Spin, register_stock_components};
    use scenery_kernel::{ClassId, ComponentRegistry, ComponentType};

    fn world() -> World {
        let mut registry = ComponentRegistry::new();
        register_stock_components(&mut registry).unwrap();
        let mut world = World::new().with_registry(registry);
        let (scene, registry) = world.scene_and_registry_mut(&[]).unwrap();
        let root = scene.root();
        let a = scene.create_node(SceneId::new(2), "A", Some(root)).unwrap();
        let b = scene.create_node(SceneId::new(3), "B", Some(a)).unwrap();
        scene
            .add_component(b, SceneId::new(4), ClassId::of(Spin::NAME), registry)
            .unwrap();
        scene.create_transient_node("gizmo", a).unwrap();

        let mut nested = Scene::new();
        nested.set_source(Some("crate.json".into()));
        let host = scene.create_node(SceneId::new(5), "Host", Some(root)).unwrap();
        scene.attach_child_scene(host, nested).unwrap();
        world.flush();
        world
    }

    #[test]
    fn summary_counts_nested_scenes() {
        let world = world();
        let summary = SceneInspector::summary(world.root());
        assert_eq!(summary.scenes, 2);
        assert_eq!(summary.nodes, 6);
        assert_eq!(summary.transient_nodes, 1);
        assert_eq!(summary.components, 1);
        assert_eq!(summary.nesting_depth, 1);
        assert!(summary.sources.contains("crate.json"));
    }

    #[test]
    fn world_summary_reports_active_classes() {
        let mut world = world();
        world.init().unwrap();
        world.post_init().unwrap();
        world.update(0.0, UpdatePhase::GatherActive).unwrap();

        let summary = SceneInspector::world_summary(&world);
        let spin = summary.classes.iter().find(|c| c.class == "Spin").unwrap();
        assert_eq!(spin.active, 1);
        assert_eq!(summary.instances.get("crate.json"), Some(&1));
        assert!(format!("{summary}").contains("Spin: 1 active"));
    }

    #[test]
    fn tree_is_depth_first() {
        let mut world = world();
        world.init().unwrap();
        let entries = SceneInspector::tree(world.root());
        let names: Vec<(&str, usize)> = entries
            .iter()
            .map(|entry| (entry.name.as_str(), entry.depth))
            .collect();
        assert_eq!(
            names,
            vec![
                ("Root", 0),
                ("A", 1),
                ("B", 2),
                ("gizmo", 2),
                ("Host", 1),
                ("Root", 2),
            ]
        );
        assert_eq!(entries[2].components, vec!["Spin"]);
        assert_eq!(entries[5].scene_depth, 1);

        let rendered = SceneInspector::render_tree(&entries);
        assert!(rendered.contains("    B [0003] (Spin)"));
        assert!(rendered.contains("  Host [0005] -> crate.json"));
    }

    #[test]
    fn consistent_scene_has_no_unresolved_refs() {
        let world = world();
        assert!(SceneInspector::unresolved(world.root()).is_empty());
    }

    #[test]
    fn dangling_child_is_reported() {
        let mut registry = ComponentRegistry::new();
        register_stock_components(&mut registry).unwrap();
        let document = serde_json::json!({
            "RootNodeID": 1,
            "Nodes": [{
                "ID": 1,
                "Name": "Root",
                "Flags": 1,
                "LocalTransform": {
                    "Position": [0.0, 0.0, 0.0],
                    "Rotation": [0.0, 0.0, 0.0, 1.0],
                    "Scale": [1.0, 1.0, 1.0]
                },
                "Hierarchy": { "Parent": [0, ""], "Children": [[9, "Gone"]] },
                "Components": [[12, "Gone"]]
            }],
            "Components": []
        });
        let mut scene = Scene::new();
        let report = scenery_persist::read_scene(
            &mut scene,
            document,
            scenery_kernel::SerializeContext::new(&registry),
        );
        assert!(report.clean);

        let unresolved = SceneInspector::unresolved(&scene);
        assert_eq!(
            unresolved,
            vec![
                UnresolvedRef {
                    scene: vec![],
                    node: 1,
                    kind: RefKind::Child,
                    target: 9,
                },
                UnresolvedRef {
                    scene: vec![],
                    node: 1,
                    kind: RefKind::Component,
                    target: 12,
                },
            ]
        );
    }
}
