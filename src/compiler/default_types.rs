//! Default type inference for untyped `@name` and `$name` accesses
//!
//! An inferred attribute takes the one explicit type the program uses for the
//! same name. With no explicit use (or several conflicting ones) it falls back
//! to float, except the point position `@P` which is a `vec3f`. Inferred
//! externals are always float. The pass builds a new tree.

use super::Target;
use crate::parser::{Declaration, Expression, Statement, StatementKind, Tree};
use crate::types::{ScalarKind, Type};
use std::collections::{BTreeMap, BTreeSet};

/// Name of the point position attribute
pub const POSITION: &str = "P";

/// Return a copy of `tree` with every inferred access typed
pub fn infer(tree: &Tree, target: Target) -> Tree {
    let mut explicit: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    let mut by_name: BTreeMap<&str, Type> = BTreeMap::new();
    crate::parser::walk_expressions(&tree.statements, &mut |e| {
        if let Expression::Attribute {
            name,
            ty,
            inferred: false,
        } = e
        {
            explicit.entry(name.as_str()).or_default().insert(ty.to_string());
            by_name.insert(name.as_str(), *ty);
        }
    });

    let resolve = |name: &str| -> Type {
        match explicit.get(name) {
            Some(types) if types.len() == 1 => by_name.get(name).copied().unwrap_or(Type::FLOAT),
            _ if target == Target::Points && name == POSITION => Type::vec(ScalarKind::Float, 3),
            _ => Type::FLOAT,
        }
    };

    Tree {
        statements: tree
            .statements
            .iter()
            .map(|s| statement(s, &resolve))
            .collect(),
    }
}

fn statements(body: &[Statement], resolve: &dyn Fn(&str) -> Type) -> Vec<Statement> {
    body.iter().map(|s| statement(s, resolve)).collect()
}

fn statement(stmt: &Statement, resolve: &dyn Fn(&str) -> Type) -> Statement {
    let ex = |e: &Expression| expression(e, resolve);
    let kind = match &stmt.kind {
        StatementKind::Block(body) => StatementKind::Block(statements(body, resolve)),
        StatementKind::Expression(e) => StatementKind::Expression(ex(e)),
        StatementKind::Declare(decls) => StatementKind::Declare(
            decls
                .iter()
                .map(|d| Declaration {
                    ty: d.ty,
                    name: d.name.clone(),
                    init: d.init.as_ref().map(ex),
                })
                .collect(),
        ),
        StatementKind::If {
            condition,
            then_branch,
            else_branch,
        } => StatementKind::If {
            condition: ex(condition),
            then_branch: statements(then_branch, resolve),
            else_branch: statements(else_branch, resolve),
        },
        StatementKind::Loop {
            kind,
            init,
            condition,
            iteration,
            body,
        } => StatementKind::Loop {
            kind: *kind,
            init: init.as_ref().map(|s| Box::new(statement(s, resolve))),
            condition: condition.as_ref().map(ex),
            iteration: iteration.as_ref().map(ex),
            body: statements(body, resolve),
        },
        other => other.clone(),
    };
    Statement {
        kind,
        loc: stmt.loc,
    }
}

fn boxed(e: &Expression, resolve: &dyn Fn(&str) -> Type) -> Box<Expression> {
    Box::new(expression(e, resolve))
}

fn expression(expr: &Expression, resolve: &dyn Fn(&str) -> Type) -> Expression {
    match expr {
        Expression::Attribute {
            name,
            inferred: true,
            ..
        } => Expression::Attribute {
            name: name.clone(),
            ty: resolve(name),
            inferred: true,
        },
        Expression::External {
            name,
            inferred: true,
            ..
        } => Expression::External {
            name: name.clone(),
            ty: Type::FLOAT,
            inferred: true,
        },
        Expression::Unary { op, operand } => Expression::Unary {
            op: *op,
            operand: boxed(operand, resolve),
        },
        Expression::Binary { op, left, right } => Expression::Binary {
            op: *op,
            left: boxed(left, resolve),
            right: boxed(right, resolve),
        },
        Expression::Assign { op, target, value } => Expression::Assign {
            op: *op,
            target: boxed(target, resolve),
            value: boxed(value, resolve),
        },
        Expression::Crement { op, post, target } => Expression::Crement {
            op: *op,
            post: *post,
            target: boxed(target, resolve),
        },
        Expression::Ternary {
            condition,
            then_expr,
            else_expr,
        } => Expression::Ternary {
            condition: boxed(condition, resolve),
            then_expr: then_expr.as_ref().map(|t| boxed(t, resolve)),
            else_expr: boxed(else_expr, resolve),
        },
        Expression::Call { name, args } => Expression::Call {
            name: name.clone(),
            args: args.iter().map(|a| expression(a, resolve)).collect(),
        },
        Expression::Cast { ty, expr } => Expression::Cast {
            ty: *ty,
            expr: boxed(expr, resolve),
        },
        Expression::ArrayPack(items) => {
            Expression::ArrayPack(items.iter().map(|i| expression(i, resolve)).collect())
        }
        Expression::Comma(items) => {
            Expression::Comma(items.iter().map(|i| expression(i, resolve)).collect())
        }
        Expression::ArrayUnpack {
            expr,
            index,
            index2,
        } => Expression::ArrayUnpack {
            expr: boxed(expr, resolve),
            index: boxed(index, resolve),
            index2: index2.as_ref().map(|i| boxed(i, resolve)),
        },
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse, walk_expressions};

    fn attribute_types(tree: &Tree) -> Vec<(String, Type)> {
        let mut out = Vec::new();
        walk_expressions(&tree.statements, &mut |e| {
            if let Expression::Attribute { name, ty, .. } = e {
                out.push((name.clone(), *ty));
            }
        });
        out
    }

    #[test]
    fn test_inferred_attribute_takes_explicit_type() {
        let tree = parse("i@id = 1; @id += 1; @other = 2;").unwrap();
        let typed = infer(&tree, Target::Points);
        let types = attribute_types(&typed);
        assert_eq!(types[0], ("id".to_string(), Type::INT32));
        assert_eq!(types[1], ("id".to_string(), Type::INT32));
        assert_eq!(types[2], ("other".to_string(), Type::FLOAT));
    }

    #[test]
    fn test_position_defaults_to_vec3f_for_points_only() {
        let tree = parse("@P = 1;").unwrap();
        let points = attribute_types(&infer(&tree, Target::Points));
        assert_eq!(points[0].1, Type::vec(ScalarKind::Float, 3));
        let volumes = attribute_types(&infer(&tree, Target::Volumes));
        assert_eq!(volumes[0].1, Type::FLOAT);
    }

    #[test]
    fn test_input_tree_is_untouched() {
        let tree = parse("@a = 1;").unwrap();
        let before = tree.clone();
        let _ = infer(&tree, Target::Points);
        assert_eq!(tree, before);
    }
}
