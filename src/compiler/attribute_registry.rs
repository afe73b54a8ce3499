//! Compile-time catalog of every attribute and external a program touches
//!
//! Each distinct name is assigned a stable index in order of first
//! appearance. Generated code looks handles up through that index, and the
//! executors use the read/write classification to decide which data to bind,
//! create or copy.

use crate::error::{Error, Result};
use crate::parser::{walk_expression, walk_expressions, Expression, Statement, StatementKind, Tree};
use crate::types::Type;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// One registered access
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEntry {
    /// Attribute, grid or custom data name
    pub name: String,
    /// Type every access uses
    pub ty: Type,
    /// Index into the kernel's handle array
    pub index: usize,
    /// Read anywhere in the program
    pub reads: bool,
    /// Written anywhere in the program
    pub writes: bool,
    /// Read while computing a write to a different attribute
    pub affects_others: bool,
}

/// Attributes and externals of one program
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeRegistry {
    attributes: Vec<AccessEntry>,
    externals: Vec<AccessEntry>,
    dependencies: BTreeMap<String, BTreeSet<String>>,
}

fn register(
    entries: &mut Vec<AccessEntry>,
    name: &str,
    ty: Type,
    kind: &str,
) -> Result<()> {
    if let Some(existing) = entries.iter().find(|e| e.name == name) {
        if existing.ty != ty {
            return Err(Error::AmbiguousType {
                name: name.to_string(),
                kind: kind.to_string(),
                first: existing.ty.to_string(),
                second: ty.to_string(),
            });
        }
        return Ok(());
    }
    let index = entries.len();
    entries.push(AccessEntry {
        name: name.to_string(),
        ty,
        index,
        reads: false,
        writes: false,
        affects_others: false,
    });
    Ok(())
}

/// Attribute written by an assignment target, looking through component access
fn written_attribute(target: &Expression) -> Option<&str> {
    match target {
        Expression::Attribute { name, .. } => Some(name),
        Expression::ArrayUnpack { expr, .. } => written_attribute(expr),
        _ => None,
    }
}

fn attribute_reads(expr: &Expression, out: &mut BTreeSet<String>) {
    walk_expression(expr, &mut |e| {
        if let Expression::Attribute { name, .. } = e {
            out.insert(name.clone());
        }
    });
}

/// Reads made by the index expressions of a component-access target
fn index_reads(target: &Expression, out: &mut BTreeSet<String>) {
    if let Expression::ArrayUnpack {
        expr,
        index,
        index2,
    } = target
    {
        attribute_reads(index, out);
        if let Some(i) = index2 {
            attribute_reads(i, out);
        }
        index_reads(expr, out);
    }
}

#[derive(Default)]
struct Usage {
    reads: BTreeSet<String>,
    writes: BTreeSet<String>,
    dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl Usage {
    fn statements(&mut self, body: &[Statement], context: &BTreeSet<String>) {
        for stmt in body {
            self.statement(stmt, context);
        }
    }

    fn statement(&mut self, stmt: &Statement, context: &BTreeSet<String>) {
        match &stmt.kind {
            StatementKind::Block(body) => self.statements(body, context),
            StatementKind::Expression(e) => self.expression(e, context),
            StatementKind::Declare(decls) => {
                for init in decls.iter().filter_map(|d| d.init.as_ref()) {
                    self.expression(init, context);
                }
            }
            StatementKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.expression(condition, context);
                let mut inner = context.clone();
                attribute_reads(condition, &mut inner);
                self.statements(then_branch, &inner);
                self.statements(else_branch, &inner);
            }
            StatementKind::Loop {
                init,
                condition,
                iteration,
                body,
                ..
            } => {
                if let Some(init) = init {
                    self.statement(init, context);
                }
                let mut inner = context.clone();
                if let Some(c) = condition {
                    self.expression(c, context);
                    attribute_reads(c, &mut inner);
                }
                if let Some(i) = iteration {
                    self.expression(i, &inner);
                }
                self.statements(body, &inner);
            }
            StatementKind::Return | StatementKind::Break | StatementKind::Continue => {}
        }
    }

    fn expression(&mut self, expr: &Expression, context: &BTreeSet<String>) {
        let mut reads = BTreeSet::new();
        walk_expression(expr, &mut |e| match e {
            Expression::Assign { op, target, value } => {
                if let Some(name) = written_attribute(target) {
                    self.writes.insert(name.to_string());
                    let deps = self.dependencies.entry(name.to_string()).or_default();
                    deps.extend(context.iter().cloned());
                    attribute_reads(value, deps);
                    index_reads(target, deps);
                    // compound and component writes read the old value too
                    if op.is_some() || !matches!(target.as_ref(), Expression::Attribute { .. }) {
                        reads.insert(name.to_string());
                        deps.insert(name.to_string());
                    }
                }
            }
            Expression::Crement { target, .. } => {
                if let Some(name) = written_attribute(target) {
                    self.writes.insert(name.to_string());
                    reads.insert(name.to_string());
                    let deps = self.dependencies.entry(name.to_string()).or_default();
                    deps.extend(context.iter().cloned());
                    deps.insert(name.to_string());
                }
            }
            _ => {}
        });

        // every attribute appearing outside a plain assignment target is read
        self.collect_reads(expr, &mut reads);
        self.reads.extend(reads);
    }

    fn collect_reads(&self, expr: &Expression, out: &mut BTreeSet<String>) {
        match expr {
            Expression::Attribute { name, .. } => {
                out.insert(name.clone());
            }
            Expression::Assign { target, value, .. } => {
                self.collect_target_reads(target, out);
                self.collect_reads(value, out);
            }
            Expression::Crement { target, .. } => self.collect_target_reads(target, out),
            other => {
                let mut children = Vec::new();
                direct_children(other, &mut children);
                for child in children {
                    self.collect_reads(child, out);
                }
            }
        }
    }

    fn collect_target_reads(&self, target: &Expression, out: &mut BTreeSet<String>) {
        match target {
            Expression::Attribute { .. } => {}
            Expression::ArrayUnpack {
                expr,
                index,
                index2,
            } => {
                self.collect_target_reads(expr, out);
                self.collect_reads(index, out);
                if let Some(i) = index2 {
                    self.collect_reads(i, out);
                }
            }
            other => self.collect_reads(other, out),
        }
    }
}

fn direct_children<'a>(expr: &'a Expression, out: &mut Vec<&'a Expression>) {
    match expr {
        Expression::Value(_)
        | Expression::Local(_)
        | Expression::Attribute { .. }
        | Expression::External { .. } => {}
        Expression::Unary { operand, .. } => out.push(operand),
        Expression::Binary { left, right, .. } => {
            out.push(left);
            out.push(right);
        }
        Expression::Assign { target, value, .. } => {
            out.push(target);
            out.push(value);
        }
        Expression::Crement { target, .. } => out.push(target),
        Expression::Ternary {
            condition,
            then_expr,
            else_expr,
        } => {
            out.push(condition);
            if let Some(t) = then_expr {
                out.push(t);
            }
            out.push(else_expr);
        }
        Expression::Call { args, .. } => out.extend(args.iter()),
        Expression::Cast { expr, .. } => out.push(expr),
        Expression::ArrayPack(items) | Expression::Comma(items) => out.extend(items.iter()),
        Expression::ArrayUnpack {
            expr,
            index,
            index2,
        } => {
            out.push(expr);
            out.push(index);
            if let Some(i) = index2 {
                out.push(i);
            }
        }
    }
}

impl AttributeRegistry {
    /// Catalog the accesses of a typed tree
    ///
    /// Fails with [`Error::AmbiguousType`] when one name is accessed with two
    /// different types.
    pub fn build(tree: &Tree) -> Result<Self> {
        let mut registry = AttributeRegistry::default();
        let mut failure = None;
        walk_expressions(&tree.statements, &mut |e| {
            if failure.is_some() {
                return;
            }
            let outcome = match e {
                Expression::Attribute { name, ty, .. } => {
                    register(&mut registry.attributes, name, *ty, "attribute")
                }
                Expression::External { name, ty, .. } => {
                    register(&mut registry.externals, name, *ty, "external")
                }
                _ => Ok(()),
            };
            if let Err(err) = outcome {
                failure = Some(err);
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }

        let mut usage = Usage::default();
        usage.statements(&tree.statements, &BTreeSet::new());

        for entry in &mut registry.attributes {
            entry.reads = usage.reads.contains(&entry.name);
            entry.writes = usage.writes.contains(&entry.name);
            entry.affects_others = usage
                .dependencies
                .iter()
                .any(|(written, deps)| *written != entry.name && deps.contains(&entry.name));
        }
        for entry in &mut registry.externals {
            entry.reads = true;
        }
        registry.dependencies = usage.dependencies;

        debug!(
            attributes = registry.attributes.len(),
            externals = registry.externals.len(),
            "built access registry"
        );
        Ok(registry)
    }

    /// Attribute (or grid) accesses in index order
    pub fn attributes(&self) -> &[AccessEntry] {
        &self.attributes
    }

    /// External accesses in index order
    pub fn externals(&self) -> &[AccessEntry] {
        &self.externals
    }

    /// Attribute entry by name
    pub fn attribute(&self, name: &str) -> Option<&AccessEntry> {
        self.attributes.iter().find(|e| e.name == name)
    }

    /// External entry by name
    pub fn external(&self, name: &str) -> Option<&AccessEntry> {
        self.externals.iter().find(|e| e.name == name)
    }

    /// Attributes whose values may flow into a write of `name`
    pub fn dependencies(&self, name: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(name)
            .into_iter()
            .flat_map(|deps| deps.iter().map(|d| d.as_str()))
    }

    /// True when some attribute is written
    pub fn writes_any(&self) -> bool {
        self.attributes.iter().any(|e| e.writes)
    }

    /// Global symbol holding the handle index of attribute `name`
    pub fn attribute_symbol(name: &str) -> String {
        format!("ax.attribute.{}", name)
    }

    /// Global symbol holding the handle index of external `name`
    pub fn external_symbol(name: &str) -> String {
        format!("ax.external.{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn build(source: &str) -> Result<AttributeRegistry> {
        AttributeRegistry::build(&parse(source).unwrap())
    }

    #[test]
    fn test_indices_follow_first_appearance() {
        let r = build("f@b = f@a; f@c = f@b + f@a;").unwrap();
        let names: Vec<&str> = r.attributes().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(r.attribute("c").map(|e| e.index), Some(2));
    }

    #[test]
    fn test_read_write_classification() {
        let r = build("f@out = f@in * 2; f@acc += 1; v@v.x = 1;").unwrap();
        let out = r.attribute("out").unwrap();
        assert!(out.writes && !out.reads);
        let input = r.attribute("in").unwrap();
        assert!(input.reads && !input.writes && input.affects_others);
        let acc = r.attribute("acc").unwrap();
        assert!(acc.reads && acc.writes && !acc.affects_others);
        assert!(r.attribute("v").unwrap().reads);
    }

    #[test]
    fn test_conditions_become_dependencies() {
        let r = build("if (f@mask > 0) { f@out = 1; }").unwrap();
        assert_eq!(r.dependencies("out").collect::<Vec<_>>(), vec!["mask"]);
        assert!(r.attribute("mask").unwrap().affects_others);
    }

    #[test]
    fn test_ambiguous_types() {
        let err = build("float a = f$foo; int b = i$foo;").unwrap_err();
        assert!(matches!(err, Error::AmbiguousType { ref kind, .. } if kind == "external"));
        let err = build("f@d = 1; i@d = 2;").unwrap_err();
        assert!(matches!(err, Error::AmbiguousType { ref kind, .. } if kind == "attribute"));
    }
}
