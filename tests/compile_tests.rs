//! End-to-end compile tests: diagnostics, type rules and overload resolution

use vdbax::compiler::functions::{Availability, FunctionGroup, Signature};
use vdbax::compiler::jit::CallContext;
use vdbax::compiler::{Logger, MatchKind};
use vdbax::runtime::Word;
use vdbax::{
    parse, Compiler, CompilerOptions, Error, ExecutionOptions, FunctionRegistry, OptLevel,
    PointDataGrid, Target, Type,
};

fn compile(source: &str) -> vdbax::Result<vdbax::Executable> {
    Compiler::default().compile_source(source, Target::Points)
}

fn logged(source: &str) -> (vdbax::Result<vdbax::Executable>, Logger) {
    let mut logger = Logger::new();
    let tree = parse(source).unwrap();
    let result = Compiler::default().compile_with_logger(&tree, Target::Points, &mut logger);
    (result, logger)
}

#[test]
fn test_local_arithmetic_has_no_side_effects() {
    let exe = compile("int a = 1 + 2; a;").unwrap();
    assert!(exe.warnings().is_empty());
    assert!(exe.access().attributes().is_empty());

    let mut grid = PointDataGrid::from_positions(1.0, &[[0.5, 0.5, 0.5]]);
    let stats = exe.execute_points(&mut grid, &ExecutionOptions::default()).unwrap();
    assert_eq!(stats.elements, 1);
    assert!(stats.created.is_empty());
    assert_eq!(grid.attributes().len(), 1);
    assert_eq!(grid.positions(), vec![[0.5, 0.5, 0.5]]);

    // the same declaration observed through an attribute
    let exe = compile("int a = 1 + 2; i@out = a;").unwrap();
    exe.execute_points(&mut grid, &ExecutionOptions::default()).unwrap();
    assert_eq!(grid.value("out", 0, 0).unwrap(), vec![Word::I32(3)]);
}

#[test]
fn test_external_with_two_types_is_ambiguous() {
    let result = compile("float a = f$foo; int b = i$foo;");
    assert!(matches!(result, Err(Error::AmbiguousType { .. })));

    let result = compile("f@a = 1.0f; i@a = 1;");
    assert!(matches!(result, Err(Error::AmbiguousType { .. })));
}

#[test]
fn test_unknown_function_reports_none() {
    let (result, logger) = logged("int a = bogus(1, 2);");
    assert!(matches!(result, Err(Error::Compilation { .. })));
    let error = &logger.errors().next().unwrap().error;
    match error {
        Error::UnresolvedFunction { name, match_kind, .. } => {
            assert_eq!(name, "bogus");
            assert_eq!(*match_kind, MatchKind::None);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(error.to_string().contains("Unable to locate function"));
}

#[test]
fn test_non_ascii_identifiers() {
    // type-like names with multi-byte characters are plain identifiers
    assert!(compile("abé3f x = 1;").is_err());
    assert!(compile("vecé3 = 1;").is_err());
    let exe = compile("float é = 2.0f; f@größe = é * 2.0f;").unwrap();
    let mut grid = PointDataGrid::from_positions(1.0, &[[0.5, 0.5, 0.5]]);
    exe.execute_points(&mut grid, &ExecutionOptions::default()).unwrap();
    assert_eq!(grid.value("größe", 0, 0).unwrap(), vec![Word::F32(4.0)]);
}

fn bogus(_: &mut CallContext<'_>, args: &[Word]) -> vdbax::Result<Word> {
    Ok(args.first().copied().unwrap_or(Word::I32(0)))
}

#[test]
fn test_wrong_arity_reports_size() {
    let mut registry = FunctionRegistry::new();
    registry.insert("bogus", Availability::All, || {
        FunctionGroup::new("bogus").with(Signature::native(vec![Type::INT32], Type::INT32, bogus))
    });
    let compiler = Compiler::with_registry(CompilerOptions::default(), registry);

    let mut logger = Logger::new();
    let tree = parse("int a = bogus(1, 2);").unwrap();
    assert!(compiler
        .compile_with_logger(&tree, Target::Points, &mut logger)
        .is_err());
    let error = &logger.errors().next().unwrap().error;
    assert!(matches!(
        error,
        Error::UnresolvedFunction {
            match_kind: MatchKind::Size,
            ..
        }
    ));
    assert!(error.to_string().contains("No overload"));
    assert!(error.to_string().contains("takes 2 argument(s)"));
    assert!(error.to_string().contains("expected 1"));

    // the right arity resolves
    let exe = compiler
        .compile_source("i@a = bogus(7);", Target::Points)
        .unwrap();
    let mut grid = PointDataGrid::from_positions(1.0, &[[0.0; 3]]);
    exe.execute_points(&mut grid, &ExecutionOptions::default()).unwrap();
    assert_eq!(grid.value("a", 0, 0).unwrap(), vec![Word::I32(7)]);
}

#[test]
fn test_int_vector_to_float_vector_attribute() {
    let exe = compile("vec3i v = {1, 2, 3}; v@out = v;").unwrap();
    let mut grid = PointDataGrid::from_positions(1.0, &[[0.0; 3]]);
    exe.execute_points(&mut grid, &ExecutionOptions::default()).unwrap();
    assert_eq!(
        grid.value("out", 0, 0).unwrap(),
        vec![Word::F32(1.0), Word::F32(2.0), Word::F32(3.0)]
    );

    let result = compile("vec3i v = {1, 2, 3}; f@out = v;");
    assert!(matches!(result, Err(Error::Compilation { .. })));
}

#[test]
fn test_break_outside_loop_does_not_stop_compilation() {
    let (result, logger) = logged("break; i@ok = 1;");
    assert!(result.is_err());
    assert_eq!(logger.error_count(), 1);
    assert!(matches!(
        logger.errors().next().map(|d| &d.error),
        Some(Error::InvalidControlFlow { .. })
    ));

    let (_, logger) = logged("continue; int a = bogus(); float b = 1.0f & 1.0f;");
    assert_eq!(logger.error_count(), 3);
}

#[test]
fn test_shadowing_warns_redeclaration_errors() {
    let exe = compile("int a = 1; { int a = 2; i@x = a; }").unwrap();
    assert_eq!(exe.warnings().len(), 1);

    let (_, logger) = logged("int a = 1; float a = 2.0f;");
    assert!(matches!(
        logger.errors().next().map(|d| &d.error),
        Some(Error::Redeclaration { .. })
    ));
}

#[test]
fn test_warnings_as_errors_and_max_errors() {
    let options = CompilerOptions {
        warnings_as_errors: true,
        ..CompilerOptions::default()
    };
    let compiler = Compiler::new(options);
    assert!(compiler
        .compile_source("int a = 1; { int a = 2; }", Target::Points)
        .is_err());

    let options = CompilerOptions {
        max_errors: 1,
        ..CompilerOptions::default()
    };
    let err = Compiler::new(options)
        .compile_source("int a = x; int b = y; int c = z;", Target::Points)
        .unwrap_err();
    match err {
        Error::Compilation { errors } => assert_eq!(errors.len(), 1),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_every_opt_level_agrees() {
    let source = "
        float total = 0.0f;
        for (int i = 0; i < 10; ++i) {
            if (i % 2 == 0) continue;
            total += float(i) * 0.5f;
            if (total > 8.0f) break;
        }
        f@total = total;
        i@flag = (total > 1.0f && @P.x >= 0.0f) ? 1 : 0;
    ";
    let mut results = Vec::new();
    for level in [OptLevel::None, OptLevel::O0, OptLevel::O1, OptLevel::O2, OptLevel::O3] {
        let compiler = Compiler::new(CompilerOptions {
            opt_level: level,
            ..CompilerOptions::default()
        });
        let exe = compiler.compile_source(source, Target::Points).unwrap();
        let mut grid = PointDataGrid::from_positions(1.0, &[[0.0; 3], [20.0, 0.0, 0.0]]);
        exe.execute_points(&mut grid, &ExecutionOptions::default()).unwrap();
        results.push((grid.values("total").unwrap(), grid.values("flag").unwrap()));
    }
    assert!(results.windows(2).all(|w| w[0] == w[1]));
    // odd i halved: 0.5 + 1.5 + 2.5 + 3.5 = 8.0, then i = 9 passes 8 and breaks
    assert_eq!(results[0].0[0], vec![Word::F32(12.5)]);
}

#[test]
fn test_volume_only_functions_rejected_on_points() {
    let (_, logger) = logged("int x = getcoordx();");
    assert!(matches!(
        logger.errors().next().map(|d| &d.error),
        Some(Error::UnresolvedFunction { .. })
    ));
    assert!(Compiler::default()
        .compile_source("deletepoint();", Target::Volumes)
        .is_err());
}
