//! Headless demo: replicates a small CAD assembly into a grid and measures
//! how the batching strategies trade item counts for state changes.
//!
//! Usage: `replicator [grouped|individual|joined] [copies]`

use std::{sync::Arc, time::Instant};

use cadre::{
    batch::assemble,
    device::NullDevice,
    exec::WorkerPool,
    managers::{ChunkManager, Scene},
};
use cadre_types::{
    AssemblerOptions, BatchStrategy, ChunkOptions, GeometryDescriptor, GeometryPart, IndexRange,
    Material, ObjectDescriptor, ObjectPart, PoolOptions, TransformNode,
};
use glam::{Mat4, Vec3, Vec4};

const FRAMES: u64 = 60;

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let strategy = match args.next().as_deref() {
        None | Some("grouped") => BatchStrategy::Grouped,
        Some("individual") => BatchStrategy::Individual,
        Some("joined") => BatchStrategy::Joined,
        Some(other) => {
            eprintln!("unknown strategy {other:?}; expected grouped, individual, or joined");
            std::process::exit(1);
        }
    };
    let copies: usize = args
        .next()
        .map(|raw| raw.parse().expect("copies must be an integer"))
        .unwrap_or(511);

    let device = Arc::new(NullDevice::new());
    let mut chunks = ChunkManager::new(ChunkOptions::default());
    let mut scene = Scene::new();

    build_assembly(&mut scene, &mut chunks);
    scene.replicate(copies, |copy| {
        let column = (copy % 32) as f32;
        let row = (copy / 32) as f32;
        Mat4::from_translation(Vec3::new(column * 4.0, 0.0, row * 4.0))
    });
    chunks.finalize(device.as_ref()).expect("chunk upload failed");

    println!(
        "{} objects across {} chunks",
        scene.object_count(),
        chunks.chunk_count()
    );

    let options = AssemblerOptions {
        strategy,
        sorted: false,
        visible_fraction: 1.0,
    };
    let items = Arc::new(assemble(&scene, &options));
    let locations = Arc::new(scene.geometry_locations());

    let mut pool = WorkerPool::new(device, &PoolOptions::default(), items.len())
        .expect("worker pool failed to start");

    let start = Instant::now();
    let mut last = None;
    for _ in 0..FRAMES {
        last = Some(
            pool.encode_frame(items.clone(), locations.clone())
                .expect("frame encoding failed"),
        );
    }
    let elapsed = start.elapsed();

    let statistics = last.unwrap();
    println!(
        "{strategy:?}: {} draw items, {} sequences, {} state changes per frame",
        statistics.draw_items, statistics.sequences, statistics.state_changes,
    );
    println!(
        "{FRAMES} frames in {elapsed:.2?} ({:.2?} per frame)",
        elapsed / FRAMES as u32
    );
}

/// A three-piece assembly: a base plate, a housing with a sub-assembly
/// transform override on its lid, and a fastener pattern sharing materials.
fn build_assembly(scene: &mut Scene, chunks: &mut ChunkManager) {
    let steel = scene.add_material(Material::new(Vec4::new(0.6, 0.6, 0.65, 1.0), Vec4::ZERO, 0.4, 1.0));
    let paint = scene.add_material(Material::new(Vec4::new(0.8, 0.2, 0.1, 1.0), Vec4::ZERO, 0.7, 0.0));

    let root = scene.add_transform(TransformNode::default());
    let lid = scene.add_transform(TransformNode::from_world(Mat4::from_translation(Vec3::Y)));

    // Synthetic payloads: sizes matter for packing, contents do not.
    let plate = scene
        .add_geometry(
            chunks,
            GeometryDescriptor {
                vertex_data: vec![0; 4096],
                index_data: vec![0; 1440],
                parts: vec![
                    GeometryPart {
                        solid: IndexRange::new(0, 240),
                        wire: IndexRange::new(960, 60),
                    },
                    GeometryPart {
                        solid: IndexRange::new(960, 0),
                        wire: IndexRange::new(1200, 60),
                    },
                ],
            },
        )
        .expect("plate geometry is valid");
    let housing = scene
        .add_geometry(
            chunks,
            GeometryDescriptor {
                vertex_data: vec![0; 8192],
                index_data: vec![0; 2880],
                parts: vec![
                    GeometryPart {
                        solid: IndexRange::new(0, 360),
                        wire: IndexRange::new(2400, 40),
                    },
                    GeometryPart {
                        solid: IndexRange::new(1440, 240),
                        wire: IndexRange::new(2560, 40),
                    },
                ],
            },
        )
        .expect("housing geometry is valid");

    scene
        .add_object(ObjectDescriptor {
            geometry: plate,
            transform: root,
            parts: vec![ObjectPart::new(steel), ObjectPart::new(steel)],
        })
        .expect("plate object is valid");
    scene
        .add_object(ObjectDescriptor {
            geometry: housing,
            transform: root,
            parts: vec![
                ObjectPart::new(paint),
                ObjectPart::with_matrix(paint, lid),
            ],
        })
        .expect("housing object is valid");

    log::info!("assembly built: 2 objects, 2 geometries");
}
