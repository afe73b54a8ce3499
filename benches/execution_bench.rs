use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vdbax::{Compiler, ExecutionOptions, PointDataGrid, Target};

const PROGRAM: &str = r#"
    vec3f p = @P;
    float n = length(p) * 0.25f;
    f@falloff = clamp(1.0f - n, 0.0f, 1.0f);
    if (@falloff > 0.5f) addtogroup("core");
"#;

fn cloud(count: usize) -> PointDataGrid {
    let positions: Vec<[f32; 3]> = (0..count)
        .map(|i| {
            let t = i as f32 * 0.37;
            [t.sin() * 40.0, t.cos() * 40.0, (t * 0.1).sin() * 40.0]
        })
        .collect();
    PointDataGrid::from_positions(1.0, &positions)
}

fn compile_benchmark(c: &mut Criterion) {
    let compiler = Compiler::default();
    c.bench_function("compile point program", |b| {
        b.iter(|| compiler.compile_source(black_box(PROGRAM), Target::Points).unwrap())
    });
}

fn execute_benchmark(c: &mut Criterion) {
    let exe = Compiler::default()
        .compile_source(PROGRAM, Target::Points)
        .unwrap();
    let grid = cloud(10_000);
    c.bench_function("execute 10k points", |b| {
        b.iter(|| {
            let mut grid = grid.clone();
            exe.execute_points(black_box(&mut grid), &ExecutionOptions::default())
                .unwrap()
        })
    });
}

criterion_group!(benches, compile_benchmark, execute_benchmark);
criterion_main!(benches);
