//! Property-based tests for the front end, overload matching and kernels
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. The front end never panics on arbitrary input
//! 2. Overload matching and cast precedence are deterministic and symmetric
//! 3. Compiled integer arithmetic follows operator precedence and wraps

use proptest::prelude::*;
use vdbax::compiler::functions::{match_candidates, Signature};
use vdbax::compiler::jit::CallContext;
use vdbax::compiler::MatchKind;
use vdbax::runtime::Word;
use vdbax::{parse, Compiler, ExecutionOptions, PointDataGrid, ScalarKind, Target, Type};

// =============================================================================
// STRATEGY GENERATORS
// =============================================================================

fn scalar_kind() -> impl Strategy<Value = ScalarKind> {
    prop::sample::select(ScalarKind::ALL.to_vec())
}

fn any_type() -> impl Strategy<Value = Type> {
    prop_oneof![
        scalar_kind().prop_map(Type::Scalar),
        (scalar_kind(), 2usize..=4).prop_map(|(k, n)| Type::vec(k, n)),
        Just(Type::mat(ScalarKind::Float, 3)),
        Just(Type::String),
    ]
}

fn noop(_: &mut CallContext<'_>, _: &[Word]) -> vdbax::Result<Word> {
    Ok(Word::Void)
}

fn source_token() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("int".to_string()),
        Just("float".to_string()),
        Just("vec3f".to_string()),
        Just("mat3i".to_string()),
        Just("abé3f".to_string()),
        Just("vecé".to_string()),
        Just("\"ü\"".to_string()),
        Just("a".to_string()),
        Just("@a".to_string()),
        Just("$b".to_string()),
        Just("=".to_string()),
        Just("+".to_string()),
        Just("*".to_string()),
        Just("(".to_string()),
        Just(")".to_string()),
        Just("{".to_string()),
        Just("}".to_string()),
        Just(";".to_string()),
        Just(",".to_string()),
        Just("if".to_string()),
        Just("for".to_string()),
        Just("break".to_string()),
        Just("?".to_string()),
        Just(":".to_string()),
        (-100i64..100).prop_map(|n| n.to_string()),
        (0.0f64..10.0).prop_map(|f| format!("{:.2}f", f)),
    ]
}

// =============================================================================
// FRONT END
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn parse_never_panics(source in "\\PC{0,200}") {
        let _ = parse(&source);
    }

    #[test]
    fn compile_never_panics(tokens in prop::collection::vec(source_token(), 0..40)) {
        let source = tokens.join(" ");
        let _ = Compiler::default().compile_source(&source, Target::Points);
    }
}

// =============================================================================
// OVERLOAD MATCHING AND CASTS
// =============================================================================

proptest! {
    #[test]
    fn match_is_deterministic(
        params in prop::collection::vec(prop::collection::vec(any_type(), 0..3), 1..6),
        args in prop::collection::vec(any_type(), 0..3),
    ) {
        let candidates: Vec<Signature> = params
            .into_iter()
            .map(|p| Signature::native(p, Type::INT32, noop))
            .collect();
        let (first, kind) = match_candidates(&candidates, &args);
        let (second, again) = match_candidates(&candidates, &args);
        prop_assert_eq!(kind, again);
        prop_assert_eq!(first.map(|s| s.inputs().to_vec()), second.map(|s| s.inputs().to_vec()));

        // the winner is the first candidate of the best kind
        let best = candidates.iter().map(|c| c.match_args(&args)).max().unwrap_or(MatchKind::None);
        prop_assert_eq!(kind, best);
        if kind != MatchKind::None {
            let position = candidates.iter().position(|c| c.match_args(&args) == best);
            let chosen = first.and_then(|f| candidates.iter().position(|c| std::ptr::eq(c, f)));
            prop_assert_eq!(chosen, position);
        }
    }

    #[test]
    fn cast_precedence_is_symmetric(a in scalar_kind(), b in scalar_kind()) {
        let joined = ScalarKind::precedence(a, b);
        prop_assert_eq!(joined, ScalarKind::precedence(b, a));
        prop_assert!(joined == a || joined == b);
        prop_assert_eq!(ScalarKind::precedence(joined, a), joined);
    }

    #[test]
    fn container_precedence_keeps_length(a in scalar_kind(), b in scalar_kind(), n in 2usize..=4) {
        let joined = Type::precedence(&Type::vec(a, n), &Type::vec(b, n));
        prop_assert_eq!(joined, Some(Type::vec(ScalarKind::precedence(a, b), n)));
    }
}

// =============================================================================
// KERNEL ARITHMETIC
// =============================================================================

fn eval_int(expr: &str) -> i32 {
    let exe = Compiler::default()
        .compile_source(&format!("i@out = {};", expr), Target::Points)
        .unwrap();
    let mut grid = PointDataGrid::from_positions(1.0, &[[0.0; 3]]);
    exe.execute_points(&mut grid, &ExecutionOptions::default()).unwrap();
    grid.value("out", 0, 0).unwrap()[0].as_i64() as i32
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn arithmetic_follows_precedence(a in -1000i32..1000, b in -1000i32..1000, c in 1i32..50) {
        let got = eval_int(&format!("{} + {} * {} - {} / {}", a, b, c, a, c));
        // integer division truncates
        let expected = a + b * c - a / c;
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn comparisons_bind_looser_than_arithmetic(a in -100i32..100, b in -100i32..100) {
        let got = eval_int(&format!("{} + 1 > {} && {} < {} * 2 ? 1 : 0", a, b, b, a));
        let expected = i32::from(a + 1 > b && b < a * 2);
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn integer_arithmetic_wraps(a in 40000i32..50000, b in 50000i32..60000) {
        let got = eval_int(&format!("{} * {}", a, b));
        prop_assert_eq!(got, a.wrapping_mul(b));
    }
}
