//! Volume execution over grid collections

use vdbax::runtime::Word;
use vdbax::{
    Compiler, Error, ExecutionOptions, GridCollection, Target, Type, VolumeGrid, VoxelIteration,
};

fn sphere() -> GridCollection {
    let mut sdf = VolumeGrid::new("sdf", Type::FLOAT)
        .unwrap()
        .with_voxel_size(0.5)
        .with_background(&[Word::F32(3.0)])
        .unwrap();
    for x in -4..4 {
        for y in -4..4 {
            for z in -4..4 {
                let d = ((x * x + y * y + z * z) as f32).sqrt() * 0.5 - 1.0;
                sdf.set([x, y, z], &[Word::F32(d)]).unwrap();
            }
        }
    }
    let mut grids = GridCollection::new();
    grids.insert(sdf);
    grids
}

fn run(source: &str, grids: &mut GridCollection) -> vdbax::ExecutionStats {
    Compiler::default()
        .compile_source(source, Target::Volumes)
        .unwrap()
        .execute_volumes(grids, &ExecutionOptions::default())
        .unwrap()
}

#[test]
fn test_sdf_to_density() {
    let mut grids = sphere();
    let stats = run(
        "float d = f@sdf; f@density = d < 0.0f ? clamp(-d, 0.0f, 1.0f) : 0.0f;",
        &mut grids,
    );
    assert_eq!(stats.created, vec!["density".to_string()]);
    assert_eq!(stats.elements, 512);
    let density = grids.get("density").unwrap();
    assert_eq!(density.voxel_size(), 0.5);
    assert_eq!(density.get([0, 0, 0]), &[Word::F32(1.0)]);
    assert_eq!(density.get([3, 3, 3]), &[Word::F32(0.0)]);
    assert_eq!(density.leaf_count(), 8);
}

#[test]
fn test_world_position_and_coords() {
    let mut grids = sphere();
    run(
        "vec3f p = getvoxelpws(); vec3i c = getcoord(); f@check = p.x - float(c.x) * 0.5f + float(getcoordy() - c[1]);",
        &mut grids,
    );
    let check = grids.get("check").unwrap();
    assert!(check.leaves().all(|leaf| (0..512)
        .filter(|n| leaf.is_active(*n))
        .all(|n| leaf.get(leaf.coord(n)) == [Word::F32(0.0)])));
}

#[test]
fn test_vector_grids() {
    let mut grids = sphere();
    grids.insert(VolumeGrid::new("vel", Type::vec(vdbax::ScalarKind::Float, 3)).unwrap());
    let options = ExecutionOptions {
        create_missing: false,
        ..ExecutionOptions::default()
    };
    let exe = Compiler::default()
        .compile_source("v@vel = {1.0f, 2.0f, f@sdf};", Target::Volumes)
        .unwrap();
    // vel has no active voxels yet
    let stats = exe.execute_volumes(&mut grids, &options).unwrap();
    assert_eq!(stats.elements, 0);

    let sdf = grids.get("sdf").unwrap().clone();
    grids.get_mut("vel").unwrap().union_topology(&sdf);
    exe.execute_volumes(&mut grids, &options).unwrap();
    assert_eq!(
        grids.get("vel").unwrap().get([2, 0, 0]),
        &[Word::F32(1.0), Word::F32(2.0), Word::F32(0.0)]
    );
}

#[test]
fn test_inactive_iteration_fills_allocated_leaves() {
    let mut grid = VolumeGrid::new("mask", Type::INT32).unwrap();
    grid.set([0, 0, 0], &[Word::I32(1)]).unwrap();
    let mut grids = GridCollection::new();
    grids.insert(grid);

    let options = ExecutionOptions {
        iteration: VoxelIteration::Inactive,
        ..ExecutionOptions::default()
    };
    let stats = Compiler::default()
        .compile_source("i@mask = 2;", Target::Volumes)
        .unwrap()
        .execute_volumes(&mut grids, &options)
        .unwrap();
    assert_eq!(stats.elements, 511);
    let mask = grids.get("mask").unwrap();
    assert_eq!(mask.get([0, 0, 0]), &[Word::I32(1)]);
    assert_eq!(mask.get([7, 7, 7]), &[Word::I32(2)]);
    assert_eq!(mask.active_voxel_count(), 512);
}

#[test]
fn test_bind_errors() {
    let mut grids = sphere();
    let err = Compiler::default()
        .compile_source("i@sdf += 1;", Target::Volumes)
        .unwrap()
        .execute_volumes(&mut grids, &ExecutionOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { .. }));

    assert!(Compiler::default()
        .compile_source("s@name = \"x\";", Target::Volumes)
        .is_err());
}

#[test]
fn test_loops_and_matrices_in_voxels() {
    let mut grids = sphere();
    run(
        "
        mat3f m = identity3();
        m = m * 2.0f;
        vec3f v = {1.0f, 1.0f, 1.0f};
        int steps = 0;
        while (steps < 3) { v = transform(v, m); steps++; }
        f@scaled = v.x + determinant(m);
        ",
        &mut grids,
    );
    // (2^3 = 8) + det(2I) = 8
    assert_eq!(grids.get("scaled").unwrap().get([0, 0, 0]), &[Word::F32(16.0)]);
}
