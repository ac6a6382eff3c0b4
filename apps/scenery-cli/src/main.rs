use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use glam::Vec3;
use scenery_common::{SceneId, Transform, UpdatePhase};
use scenery_ecs::{Spin, register_stock_components};
use scenery_kernel::{ClassId, ComponentRegistry, ComponentType, Scene, World, WorldConfig};
use scenery_persist::{LoadReport, load_scene, save_scene};
use scenery_tools::{SceneInspector, TreeEntry, UnresolvedRef, WorldSummary};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scenery-cli", about = "CLI tool for scene operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// World configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version, registered classes and the update sequence
    Info,
    /// Load a scene and print its summary and hierarchy
    Inspect {
        file: PathBuf,
        /// Print machine-readable JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Load a scene and fail on serializer errors or dangling references
    Validate { file: PathBuf },
    /// Convert between JSON documents and the .scnb binary cache
    Convert { input: PathBuf, output: PathBuf },
    /// Run a synthetic world of spinning nodes
    Simulate {
        /// Number of nodes, each with a Spin component
        #[arg(short, long, default_value = "1000")]
        nodes: u16,
        /// Simulated time in seconds
        #[arg(short, long, default_value = "1.0")]
        seconds: f32,
    },
}

#[derive(Serialize)]
struct InspectReport {
    summary: WorldSummary,
    load: LoadOutcome,
    tree: Vec<TreeEntry>,
    unresolved: Vec<UnresolvedRef>,
}

#[derive(Serialize)]
struct LoadOutcome {
    clean: bool,
    error: Option<String>,
}

impl From<LoadReport> for LoadOutcome {
    fn from(report: LoadReport) -> Self {
        Self {
            clean: report.clean,
            error: report.error,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    let config = read_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Info => {
            println!("scenery-cli v{}", env!("CARGO_PKG_VERSION"));
            let world = new_world(config)?;
            for class in world.registry().classes() {
                println!("class: {} ({})", class.name, class.id);
            }
            println!("phases: {:?}", world.config().phases);
            println!("fixed timestep: {}", world.config().fixed_timestep);
            println!("max nesting depth: {}", world.config().max_nesting_depth);
        }
        Commands::Inspect { file, json } => {
            let mut world = new_world(config)?;
            let (scene, report) = load_scene(&file, world.registry())
                .with_context(|| format!("failed to load {}", file.display()))?;
            let unresolved = SceneInspector::unresolved(&scene);
            start(&mut world, scene)?;
            let report = InspectReport {
                summary: SceneInspector::world_summary(&world),
                load: report.into(),
                tree: SceneInspector::tree(world.root()),
                unresolved,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.summary);
                print!("{}", SceneInspector::render_tree(&report.tree));
                if let Some(error) = &report.load.error {
                    println!("load error: {error}");
                }
                for dangling in &report.unresolved {
                    println!(
                        "unresolved {:?} {:04x} on node {:04x} (scene {:?})",
                        dangling.kind, dangling.target, dangling.node, dangling.scene
                    );
                }
            }
        }
        Commands::Validate { file } => {
            let world = new_world(config)?;
            let (scene, report) = load_scene(&file, world.registry())
                .with_context(|| format!("failed to load {}", file.display()))?;
            let unresolved = SceneInspector::unresolved(&scene);
            let summary = SceneInspector::summary(&scene);
            if let Some(error) = &report.error {
                println!("error: {error}");
            }
            for dangling in &unresolved {
                println!(
                    "unresolved {:?} {:04x} on node {:04x}",
                    dangling.kind, dangling.target, dangling.node
                );
            }
            if !report.clean || !unresolved.is_empty() {
                bail!(
                    "{} is invalid: {} unresolved reference(s)",
                    file.display(),
                    unresolved.len()
                );
            }
            println!("{}: OK ({summary})", file.display());
        }
        Commands::Convert { input, output } => {
            let world = new_world(config)?;
            let (mut scene, report) = load_scene(&input, world.registry())
                .with_context(|| format!("failed to load {}", input.display()))?;
            if let Some(error) = report.error {
                tracing::warn!(%error, "converting a scene that loaded with errors");
            }
            save_scene(&mut scene, &output, world.serialize_context())
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("{} -> {}", input.display(), output.display());
        }
        Commands::Simulate { nodes, seconds } => {
            if nodes > u16::MAX / 2 - 1 {
                bail!("at most {} nodes fit in one scene", u16::MAX / 2 - 1);
            }
            let mut world = new_world(config)?;
            populate(&mut world, nodes)?;
            world.init()?;
            world.post_init()?;

            let started = Instant::now();
            let frames = world.run_for(seconds)?;
            let elapsed = started.elapsed();

            let summary = SceneInspector::world_summary(&world);
            println!("{summary}");
            println!(
                "Simulated {frames} frames of {} nodes in {:.2?} ({:.1} us/frame)",
                nodes,
                elapsed,
                elapsed.as_secs_f64() * 1e6 / frames.max(1) as f64
            );
        }
    }

    Ok(())
}

fn read_config(path: Option<&Path>) -> anyhow::Result<WorldConfig> {
    let Some(path) = path else {
        return Ok(WorldConfig::default());
    };
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open config {}", path.display()))?;
    let config: WorldConfig = serde_json::from_reader(file)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn new_world(config: WorldConfig) -> anyhow::Result<World> {
    let mut registry = ComponentRegistry::new();
    register_stock_components(&mut registry)?;
    Ok(World::with_config(config)?.with_registry(registry))
}

/// Install `scene` as the root and bring the world up to a first gathered
/// frame, so active lists and world transforms are current.
fn start(world: &mut World, scene: Scene) -> anyhow::Result<()> {
    world.set_root_scene(scene)?;
    world.init()?;
    world.post_init()?;
    world.update(0.0, UpdatePhase::GatherActive)?;
    world.update(0.0, UpdatePhase::Hierarchy)?;
    Ok(())
}

/// A flat row of nodes under the root, each spinning about Y.
fn populate(world: &mut World, nodes: u16) -> anyhow::Result<()> {
    let (scene, registry) = world
        .scene_and_registry_mut(&[])
        .context("world has no root scene")?;
    let root = scene.root();
    let class = ClassId::of(Spin::NAME);
    for i in 0..nodes {
        let id = SceneId::new(2 + i * 2);
        let node = scene.create_node(id, format!("spinner{i}"), Some(root))?;
        if let Some(node) = scene.node_mut(node) {
            node.set_local(Transform::from_position(Vec3::new(f32::from(i), 0.0, 0.0)));
        }
        scene.add_component(node, SceneId::new(id.raw() + 1), class, registry)?;
    }
    tracing::info!(nodes, "populated world");
    Ok(())
}
