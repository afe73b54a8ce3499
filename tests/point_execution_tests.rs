//! Point execution: parallel phase plus merge of groups, strings and positions

use vdbax::runtime::Word;
use vdbax::{
    parse, Compiler, CompilerOptions, CustomData, CustomValue, Error, ExecutionOptions, OptLevel,
    PointDataGrid, Target, Type,
};

fn scattered() -> PointDataGrid {
    // four leaves of two points each
    let mut positions = Vec::new();
    for leaf in 0..4 {
        let x = leaf as f32 * 8.0;
        positions.push([x + 0.5, 0.5, 0.5]);
        positions.push([x + 1.5, 2.5, 0.5]);
    }
    PointDataGrid::from_positions(1.0, &positions)
}

fn run(source: &str, grid: &mut PointDataGrid) -> vdbax::ExecutionStats {
    Compiler::default()
        .compile_source(source, Target::Points)
        .unwrap()
        .execute_points(grid, &ExecutionOptions::default())
        .unwrap()
}

#[test]
fn test_new_group_from_two_leaves() {
    let mut grid = PointDataGrid::from_positions(1.0, &[[0.5, 0.5, 0.5], [0.5, 1.5, 0.5], [9.0, 0.5, 0.5]]);
    assert_eq!(grid.leaf_count(), 2);

    let stats = run("if (@P.y < 1.0f) addtogroup(\"new\");", &mut grid);
    assert_eq!(stats.new_groups, vec!["new".to_string()]);
    assert_eq!(grid.groups(), &["new".to_string()]);
    assert!(grid.in_group("new", 0, 0));
    assert!(!grid.in_group("new", 0, 1));
    assert!(grid.in_group("new", 1, 0));

    // second pass reuses the group
    let stats = run("if (ingroup(\"new\")) removefromgroup(\"new\");", &mut grid);
    assert!(stats.new_groups.is_empty());
    assert_eq!(grid.group_count("new"), 0);
}

#[test]
fn test_group_membership_visible_within_leaf() {
    let mut grid = scattered();
    run(
        "addtogroup(\"seen\"); if (ingroup(\"seen\")) i@hit = 1; removefromgroup(\"seen\"); i@after = ingroup(\"seen\") ? 1 : 0;",
        &mut grid,
    );
    let hits: i64 = grid.values("hit").unwrap().iter().map(|v| v[0].as_i64()).sum();
    let after: i64 = grid.values("after").unwrap().iter().map(|v| v[0].as_i64()).sum();
    assert_eq!(hits, 8);
    assert_eq!(after, 0);
    assert_eq!(grid.group_count("seen"), 0);
    // every staged member was removed again, so the group is never created
    assert!(grid.groups().is_empty());
}

#[test]
fn test_string_attributes() {
    let mut grid = scattered();
    grid.add_attribute("label", Type::String).unwrap();
    grid.set_string("label", 0, 0, "first").unwrap();
    run(
        "if (s@label == \"first\") s@label = \"head\"; else s@label = \"rest\"; i@n = atoi(\"12\");",
        &mut grid,
    );
    assert_eq!(grid.string("label", 0, 0).unwrap(), "head");
    assert_eq!(grid.string("label", 3, 1).unwrap(), "rest");
    assert_eq!(grid.value("n", 2, 0).unwrap(), vec![Word::I32(12)]);
}

#[test]
fn test_moving_points_migrates_leaves() {
    let mut grid = scattered();
    grid.add_attribute("id", Type::INT32).unwrap();
    run("i@id = int(@P.x * 10.0f);", &mut grid);
    let stats = run("@P += {8.0f, 0.0f, 0.0f};", &mut grid);
    assert_eq!(stats.migrated, 8);
    assert_eq!(grid.leaf_count(), 4);
    assert_eq!(grid.leaves()[0].coord(), [1, 0, 0]);
    // attributes travel with their point
    let first = grid.value("id", 0, 0).unwrap()[0].as_i64();
    let p = grid.value("P", 0, 0).unwrap()[0].as_f64();
    assert_eq!(first, ((p - 8.0) * 10.0).round() as i64);
}

#[test]
fn test_delete_points() {
    let mut grid = scattered();
    let stats = run("if (@P.y > 1.0f) deletepoint();", &mut grid);
    assert_eq!(stats.deleted, 4);
    assert_eq!(grid.point_count(), 4);
    assert_eq!(grid.leaf_count(), 4);

    let stats = run("deletepoint();", &mut grid);
    assert_eq!(stats.deleted, 4);
    assert_eq!(grid.leaf_count(), 0);
}

#[test]
fn test_group_filter_runs_members_only() {
    let mut grid = scattered();
    run("if (@P.y > 1.0f) addtogroup(\"upper\");", &mut grid);
    let options = ExecutionOptions {
        group: Some("upper".into()),
        ..ExecutionOptions::default()
    };
    let stats = Compiler::default()
        .compile_source("f@y2 = @P.y * 2.0f;", Target::Points)
        .unwrap()
        .execute_points(&mut grid, &options)
        .unwrap();
    assert_eq!(stats.elements, 4);
    let ys: Vec<f64> = grid.values("y2").unwrap().iter().map(|v| v[0].as_f64()).collect();
    assert_eq!(ys.iter().filter(|y| **y == 5.0).count(), 4);
    assert_eq!(ys.iter().filter(|y| **y == 0.0).count(), 4);
}

#[test]
fn test_externals_and_missing_data() {
    let exe = Compiler::default()
        .compile_source("f@s = $scale * @P.x; v@o = v$offset;", Target::Points)
        .unwrap();
    let mut grid = scattered();
    // missing custom data reads as zero
    exe.execute_points(&mut grid, &ExecutionOptions::default()).unwrap();
    assert!(grid.values("s").unwrap().iter().all(|v| v[0].as_f64() == 0.0));

    let mut data = CustomData::new();
    data.insert("scale", CustomValue::Float(2.0));
    data.insert("offset", CustomValue::vec3f([1.0, 2.0, 3.0]));
    exe.with_custom_data(data)
        .execute_points(&mut grid, &ExecutionOptions::default())
        .unwrap();
    assert_eq!(grid.value("s", 1, 0).unwrap(), vec![Word::F32(17.0)]);
    assert_eq!(
        grid.value("o", 1, 0).unwrap(),
        vec![Word::F32(1.0), Word::F32(2.0), Word::F32(3.0)]
    );

    let mut wrong = CustomData::new();
    wrong.insert("scale", CustomValue::Int32(2));
    assert!(matches!(
        exe.with_custom_data(wrong)
            .execute_points(&mut grid, &ExecutionOptions::default()),
        Err(Error::TypeMismatch { .. })
    ));
}

#[test]
fn test_recompiling_is_deterministic() {
    let source = "
        vec3f p = @P;
        float n = length(p) + sin(p.x) * cos(p.y);
        f@n = n;
        i@bucket = int(floor(n)) % 3;
        if (@bucket == 1) addtogroup(\"one\");
    ";
    let tree = parse(source).unwrap();
    let compiler = Compiler::new(CompilerOptions {
        opt_level: OptLevel::None,
        ..CompilerOptions::default()
    });
    let first = compiler.compile(&tree, Target::Points).unwrap();
    let second = compiler.compile(&tree, Target::Points).unwrap();

    let mut a = scattered();
    let mut b = scattered();
    first.execute_points(&mut a, &ExecutionOptions::default()).unwrap();
    second.execute_points(&mut b, &ExecutionOptions::default()).unwrap();
    assert_eq!(a.values("n").unwrap(), b.values("n").unwrap());
    assert_eq!(a.values("bucket").unwrap(), b.values("bucket").unwrap());
    assert_eq!(a.group_count("one"), b.group_count("one"));
}

#[test]
fn test_executable_shared_across_threads() {
    let exe = Compiler::default()
        .compile_source("f@a = @P.x + 1.0f;", Target::Points)
        .unwrap();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let exe = exe.clone();
            std::thread::spawn(move || {
                let mut grid = scattered();
                exe.execute_points(&mut grid, &ExecutionOptions::default())
                    .map(|_| grid.values("a").unwrap())
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();
    assert!(results.windows(2).all(|w| w[0] == w[1]));
}

fn single(name: &str, grid: &PointDataGrid) -> Word {
    grid.values(name).unwrap()[0][0]
}

#[test]
fn test_scalar_against_matrix_is_scaled_identity() {
    let mut grid = PointDataGrid::from_positions(1.0, &[[0.5, 0.5, 0.5]]);
    run(
        "
        mat3f m = identity3();
        i@eq = m == 1 ? 1 : 0;
        i@ne = m != 1 ? 1 : 0;
        i@zero = m == 0 ? 1 : 0;
        mat3f p = m + 1;
        f@p_diag = p[0, 0];
        f@p_off = p[0, 1];
        mat3f r = m - 3;
        f@r_diag = r[2, 2];
        f@r_off = r[2, 0];
        mat3f d = (identity3() * 4.0f) / 2;
        f@d_diag = d[1, 1];
        f@d_off = d[1, 0];
        ",
        &mut grid,
    );
    assert_eq!(single("eq", &grid), Word::I32(1));
    assert_eq!(single("ne", &grid), Word::I32(0));
    assert_eq!(single("zero", &grid), Word::I32(0));
    // a broadcast would have written 2 and 1
    assert_eq!(single("p_diag", &grid), Word::F32(2.0));
    assert_eq!(single("p_off", &grid), Word::F32(0.0));
    assert_eq!(single("r_diag", &grid), Word::F32(-2.0));
    assert_eq!(single("r_off", &grid), Word::F32(0.0));
    // off-diagonal 0 / 0 where a broadcast would give 0
    assert_eq!(single("d_diag", &grid), Word::F32(2.0));
    assert!(single("d_off", &grid).as_f64().is_nan());
}

#[test]
fn test_integer_matrices() {
    let mut grid = PointDataGrid::from_positions(1.0, &[[0.5, 0.5, 0.5]]);
    run(
        "
        mat3i a = 2;
        mat3i b = a * a;
        i@det = determinant(b);
        i@tr = trace(a + 1);
        i@same = b == 4 ? 1 : 0;
        mat4i t = transpose(identity4());
        i@t_sum = t[0, 0] + t[3, 3] + t[0, 3];
        ",
        &mut grid,
    );
    assert_eq!(single("det", &grid), Word::I32(64));
    assert_eq!(single("tr", &grid), Word::I32(9));
    assert_eq!(single("same", &grid), Word::I32(1));
    assert_eq!(single("t_sum", &grid), Word::I32(2));
}
