//! AST traversal: statements, control flow and expressions

use super::symbol_table::{Declared, Local, SymbolTable};
use super::value::{slot_type, Flow, Place, Value};
use super::{Specialization, EXTERNALS, HANDLES};
use crate::compiler::attribute_registry::AttributeRegistry;
use crate::compiler::functions::{FunctionRegistry, Implementation, MatchKind, Signature};
use crate::compiler::ir::{BinOp, BlockId, FunctionBuilder, IrFunction, Reg, RegType};
use crate::compiler::logger::Logger;
use crate::error::{Error, Result};
use crate::parser::{
    BinaryOp, CrementOp, Declaration, Expression, Literal, Location, LoopKind, Statement,
    StatementKind, Tree,
};
use crate::runtime::{SlotType, Word};
use crate::types::{ScalarKind, Type};
use std::collections::BTreeSet;
use std::marker::PhantomData;

/// Lowers one program into the element kernel of target `S`
pub struct CodeGenerator<'a, S: Specialization> {
    pub(super) builder: FunctionBuilder,
    registry: &'a mut FunctionRegistry,
    access: &'a AttributeRegistry,
    logger: &'a mut Logger,
    symbols: SymbolTable,
    // (break target, continue target) of the enclosing loops
    loops: Vec<(BlockId, BlockId)>,
    globals: BTreeSet<String>,
    location: Option<Location>,
    _target: PhantomData<S>,
}

impl<'a, S: Specialization> CodeGenerator<'a, S> {
    /// Generator for a fresh element kernel
    pub fn new(
        registry: &'a mut FunctionRegistry,
        access: &'a AttributeRegistry,
        logger: &'a mut Logger,
    ) -> Self {
        Self {
            builder: FunctionBuilder::new(S::KERNEL, S::PARAMS, None),
            registry,
            access,
            logger,
            symbols: SymbolTable::new(),
            loops: Vec::new(),
            globals: BTreeSet::new(),
            location: None,
            _target: PhantomData,
        }
    }

    /// Lower the whole program into the kernel body
    pub fn kernel(&mut self, tree: &Tree) -> Result<()> {
        S::prologue(self)?;
        self.statements(&tree.statements);
        self.builder.ret(None);
        self.builder.seal();
        Ok(())
    }

    /// Finished kernel and the globals it references
    pub fn finish(self) -> (IrFunction, BTreeSet<String>) {
        (self.builder.finish(), self.globals)
    }

    /// Access registry the program was analysed into
    pub fn access(&self) -> &AttributeRegistry {
        self.access
    }

    // Statements

    fn statements(&mut self, body: &[Statement]) -> Flow {
        for (i, stmt) in body.iter().enumerate() {
            if self.logger.limit_reached() {
                return Flow::Next;
            }
            if self.statement(stmt) == Flow::Diverged {
                if let Some(next) = body.get(i + 1) {
                    self.logger.warning(
                        "unreachable code after return, break or continue",
                        next.loc.or(self.location),
                    );
                }
                return Flow::Diverged;
            }
        }
        Flow::Next
    }

    fn statement(&mut self, stmt: &Statement) -> Flow {
        let saved = self.location;
        self.location = stmt.loc.or(saved);
        let flow = match self.lower_statement(stmt) {
            Ok(flow) => flow,
            Err(e) => {
                self.logger.error(e, self.location);
                Flow::Next
            }
        };
        self.location = saved;
        flow
    }

    fn lower_statement(&mut self, stmt: &Statement) -> Result<Flow> {
        match &stmt.kind {
            StatementKind::Block(body) => {
                self.symbols.push();
                let flow = self.statements(body);
                self.symbols.pop();
                Ok(flow)
            }
            StatementKind::Expression(e) => {
                self.expression(e)?;
                Ok(Flow::Next)
            }
            StatementKind::Declare(decls) => {
                for d in decls {
                    self.declare(d)?;
                }
                Ok(Flow::Next)
            }
            StatementKind::If {
                condition,
                then_branch,
                else_branch,
            } => self.if_statement(condition, then_branch, else_branch),
            StatementKind::Loop {
                kind,
                init,
                condition,
                iteration,
                body,
            } => {
                self.symbols.push();
                let flow = self.loop_statement(
                    *kind,
                    init.as_deref(),
                    condition.as_ref(),
                    iteration.as_ref(),
                    body,
                );
                self.symbols.pop();
                flow
            }
            StatementKind::Return => {
                self.builder.ret(None);
                Ok(Flow::Diverged)
            }
            StatementKind::Break => self.jump("break", |(brk, _)| brk),
            StatementKind::Continue => self.jump("continue", |(_, cont)| cont),
        }
    }

    fn jump(&mut self, keyword: &str, pick: fn((BlockId, BlockId)) -> BlockId) -> Result<Flow> {
        let target = self.loops.last().copied().map(pick).ok_or_else(|| {
            Error::InvalidControlFlow {
                keyword: keyword.to_string(),
            }
        })?;
        self.builder.br(target);
        Ok(Flow::Diverged)
    }

    fn declare(&mut self, decl: &Declaration) -> Result<()> {
        let init = match &decl.init {
            Some(e) => Some(self.expression(e)?),
            None => None,
        };
        let slot = self.alloc(decl.ty)?;
        match init {
            Some(v) => {
                let v = self.convert(v, decl.ty)?;
                self.store_value(slot, decl.ty, v)?;
            }
            // locals inside loops must start from zero on every iteration
            None => self.store_zero(slot, decl.ty),
        }
        let declared = self.symbols.declare(
            &decl.name,
            Local {
                ptr: slot,
                ty: decl.ty,
            },
        )?;
        if declared == Declared::Shadows {
            self.logger.warning(
                format!("declaration of \"{}\" shadows a previous declaration", decl.name),
                self.location,
            );
        }
        Ok(())
    }

    fn if_statement(
        &mut self,
        condition: &Expression,
        then_branch: &[Statement],
        else_branch: &[Statement],
    ) -> Result<Flow> {
        let cond = self.condition(condition)?;
        let then_block = self.builder.create_block("if.then");
        let else_block = self.builder.create_block("if.else");
        let merge = self.builder.create_block("if.end");
        self.builder.cond_br(cond, then_block, else_block);

        self.builder.switch_to(then_block);
        let then_flow = self.scoped(then_branch);
        self.builder.br(merge);

        self.builder.switch_to(else_block);
        let else_flow = self.scoped(else_branch);
        self.builder.br(merge);

        self.builder.switch_to(merge);
        if then_flow == Flow::Diverged && else_flow == Flow::Diverged {
            self.builder.unreachable();
            return Ok(Flow::Diverged);
        }
        Ok(Flow::Next)
    }

    fn scoped(&mut self, body: &[Statement]) -> Flow {
        self.symbols.push();
        let flow = self.statements(body);
        self.symbols.pop();
        flow
    }

    fn loop_statement(
        &mut self,
        kind: LoopKind,
        init: Option<&Statement>,
        condition: Option<&Expression>,
        iteration: Option<&Expression>,
        body: &[Statement],
    ) -> Result<Flow> {
        if let Some(init) = init {
            self.statement(init);
        }
        let cond_block = self.builder.create_block("loop.cond");
        let body_block = self.builder.create_block("loop.body");
        let iter_block = self.builder.create_block("loop.iter");
        let exit_block = self.builder.create_block("loop.end");

        self.builder.br(if kind == LoopKind::DoWhile {
            body_block
        } else {
            cond_block
        });

        self.builder.switch_to(cond_block);
        match condition {
            Some(c) => {
                let c = self.condition(c)?;
                self.builder.cond_br(c, body_block, exit_block);
            }
            None => self.builder.br(body_block),
        }

        self.builder.switch_to(body_block);
        self.loops.push((exit_block, iter_block));
        self.scoped(body);
        self.loops.pop();
        self.builder.br(iter_block);

        self.builder.switch_to(iter_block);
        if let Some(it) = iteration {
            self.expression(it)?;
        }
        self.builder.br(cond_block);

        self.builder.switch_to(exit_block);
        Ok(Flow::Next)
    }

    // Expressions

    pub(super) fn expression(&mut self, expr: &Expression) -> Result<Value> {
        match expr {
            Expression::Value(lit) => Ok(self.literal(lit)),
            Expression::Local(name) => {
                let local = self.symbols.find(name).ok_or_else(|| Error::UndeclaredVariable {
                    name: name.clone(),
                })?;
                Ok(self.load_local(local))
            }
            Expression::Attribute { name, ty, .. } => S::read_attribute(self, name, *ty),
            Expression::External { name, ty, .. } => self.read_external(name, *ty),
            Expression::Unary { op, operand } => {
                let v = self.expression(operand)?;
                self.unary_value(*op, v)
            }
            Expression::Binary { op, left, right } if op.is_logical() => {
                self.short_circuit(*op, left, right)
            }
            Expression::Binary { op, left, right } => {
                let l = self.expression(left)?;
                let r = self.expression(right)?;
                self.binary_values(*op, l, r)
            }
            Expression::Assign { op, target, value } => self.assign(*op, target, value),
            Expression::Crement { op, post, target } => self.crement(*op, *post, target),
            Expression::Ternary {
                condition,
                then_expr,
                else_expr,
            } => self.ternary(condition, then_expr.as_deref(), else_expr),
            Expression::Call { name, args } => self.call(name, args),
            Expression::Cast { ty, expr } => {
                let v = self.expression(expr)?;
                if !v.ty().is_scalar() || !ty.is_scalar() {
                    return Err(Error::TypeError {
                        expected: "a scalar".to_string(),
                        got: v.ty().to_string(),
                    });
                }
                self.convert(v, *ty)
            }
            Expression::ArrayPack(items) => self.array_pack(items),
            Expression::ArrayUnpack {
                expr,
                index,
                index2,
            } => {
                let v = self.expression(expr)?;
                let Value::Slot { ptr, ty } = v else {
                    return Err(Error::unsupported("[]", v.ty().to_string()));
                };
                let idx = self.element_index(ty, index, index2.as_deref())?;
                let p = self.builder.element_ptr(ptr, idx, ty.len());
                let reg = self.builder.load(p);
                Ok(Value::Scalar {
                    reg,
                    kind: element_kind(ty)?,
                })
            }
            Expression::Comma(items) => {
                let mut last = Value::Void;
                for item in items {
                    last = self.expression(item)?;
                }
                Ok(last)
            }
        }
    }

    fn literal(&mut self, lit: &Literal) -> Value {
        let word = match lit {
            Literal::Bool(v) => Word::Bool(*v),
            Literal::Int16(v) => Word::I16(*v),
            Literal::Int32(v) => Word::I32(*v),
            Literal::Int64(v) => Word::I64(*v),
            Literal::Float(v) => Word::F32(*v),
            Literal::Double(v) => Word::F64(*v),
            Literal::String(s) => {
                let ptr = self.builder.alloca(SlotType::Str);
                self.builder.store_str(ptr, s.as_bytes());
                return Value::Slot {
                    ptr,
                    ty: Type::String,
                };
            }
        };
        let kind = word.kind().unwrap_or(ScalarKind::Int32);
        Value::Scalar {
            reg: self.builder.constant(word),
            kind,
        }
    }

    fn load_local(&mut self, local: Local) -> Value {
        match local.ty {
            Type::Scalar(kind) => Value::Scalar {
                reg: self.builder.load(local.ptr),
                kind,
            },
            ty => Value::Slot { ptr: local.ptr, ty },
        }
    }

    /// Bool register holding the truthiness of `value`
    pub(super) fn truthy(&mut self, value: Value) -> Result<Reg> {
        match value {
            Value::Scalar {
                reg,
                kind: ScalarKind::Bool,
            } => Ok(reg),
            Value::Scalar { reg, .. } => Ok(self.builder.cast(reg, ScalarKind::Bool)),
            other => Err(Error::TypeError {
                expected: "a scalar condition".to_string(),
                got: other.ty().to_string(),
            }),
        }
    }

    fn condition(&mut self, expr: &Expression) -> Result<Reg> {
        let v = self.expression(expr)?;
        self.truthy(v)
    }

    fn short_circuit(&mut self, op: BinaryOp, left: &Expression, right: &Expression) -> Result<Value> {
        let l = self.condition(left)?;
        let lhs_end = self.builder.current_block();
        let rhs_block = self.builder.create_block("logic.rhs");
        let merge = self.builder.create_block("logic.end");
        if op == BinaryOp::And {
            self.builder.cond_br(l, rhs_block, merge);
        } else {
            self.builder.cond_br(l, merge, rhs_block);
        }

        self.builder.switch_to(rhs_block);
        let r = self.condition(right)?;
        let rhs_end = self.builder.current_block();
        self.builder.br(merge);

        self.builder.switch_to(merge);
        let reg = self.builder.phi(vec![(lhs_end, l), (rhs_end, r)]);
        Ok(Value::Scalar {
            reg,
            kind: ScalarKind::Bool,
        })
    }

    fn ternary(
        &mut self,
        condition: &Expression,
        then_expr: Option<&Expression>,
        else_expr: &Expression,
    ) -> Result<Value> {
        let cond_value = self.expression(condition)?;
        let cond = self.truthy(cond_value)?;
        let then_block = self.builder.create_block("ternary.then");
        let else_block = self.builder.create_block("ternary.else");
        let merge = self.builder.create_block("ternary.end");
        self.builder.cond_br(cond, then_block, else_block);

        self.builder.switch_to(then_block);
        let then_value = match then_expr {
            Some(e) => self.expression(e)?,
            None => cond_value,
        };
        let then_end = self.builder.current_block();

        self.builder.switch_to(else_block);
        let else_value = self.expression(else_expr)?;
        let else_end = self.builder.current_block();

        let (tt, et) = (then_value.ty(), else_value.ty());
        if tt.is_void() && et.is_void() {
            for end in [then_end, else_end] {
                self.builder.switch_to(end);
                self.builder.br(merge);
            }
            self.builder.switch_to(merge);
            return Ok(Value::Void);
        }
        let ty = Type::precedence(&tt, &et).ok_or_else(|| Error::TypeError {
            expected: tt.to_string(),
            got: et.to_string(),
        })?;

        let mut incoming = Vec::with_capacity(2);
        for (end, value) in [(then_end, then_value), (else_end, else_value)] {
            self.builder.switch_to(end);
            let v = self.convert(value, ty)?;
            let reg = v
                .reg()
                .ok_or_else(|| Error::execution("ternary branch produced no value"))?;
            incoming.push((self.builder.current_block(), reg));
            self.builder.br(merge);
        }

        self.builder.switch_to(merge);
        let reg = self.builder.phi(incoming);
        Ok(match ty {
            Type::Scalar(kind) => Value::Scalar { reg, kind },
            ty => Value::Slot { ptr: reg, ty },
        })
    }

    fn array_pack(&mut self, items: &[Expression]) -> Result<Value> {
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            match self.expression(item)? {
                Value::Scalar { reg, kind } => values.push((reg, kind)),
                other => {
                    return Err(Error::TypeError {
                        expected: "scalar elements".to_string(),
                        got: other.ty().to_string(),
                    })
                }
            }
        }
        if values.len() == 1 {
            let (reg, kind) = values[0];
            return Ok(Value::Scalar { reg, kind });
        }
        if !matches!(values.len(), 2 | 3 | 4 | 9 | 16) {
            return Err(Error::unsupported(
                "{}",
                format!("{} elements (expected 2, 3, 4, 9 or 16)", values.len()),
            ));
        }
        let elem = values
            .iter()
            .map(|(_, k)| *k)
            .fold(ScalarKind::Bool, ScalarKind::precedence);
        // vectors and matrices have no bool or short element kinds
        let elem = if elem.is_float() || elem == ScalarKind::Int64 {
            elem
        } else {
            ScalarKind::Int32
        };
        let ty = Type::array(elem, values.len());
        let slot = self.alloc(ty)?;
        for (i, (reg, kind)) in values.iter().enumerate() {
            let v = self.cast_to(*reg, *kind, elem);
            let p = self.builder.element_ptr_const(slot, i, ty.len());
            self.builder.store(p, v);
        }
        Ok(Value::Slot { ptr: slot, ty })
    }

    fn element_index(
        &mut self,
        ty: Type,
        index: &Expression,
        index2: Option<&Expression>,
    ) -> Result<Reg> {
        if !ty.is_array() {
            return Err(Error::unsupported("[]", ty.to_string()));
        }
        let i = self.integer(index)?;
        match index2 {
            None => Ok(i),
            Some(col) => {
                let dim = ty.matrix_dim().ok_or_else(|| {
                    Error::unsupported("[,]", format!("{} (not a matrix)", ty))
                })?;
                let j = self.integer(col)?;
                let d = self.builder.constant(Word::I32(dim as i32));
                let row = self.builder.binary(BinOp::Mul, i, d);
                Ok(self.builder.binary(BinOp::Add, row, j))
            }
        }
    }

    fn integer(&mut self, expr: &Expression) -> Result<Reg> {
        match self.expression(expr)? {
            Value::Scalar { reg, kind } if kind.is_integer() => {
                Ok(self.cast_to(reg, kind, ScalarKind::Int32))
            }
            other => Err(Error::TypeError {
                expected: "an integer index".to_string(),
                got: other.ty().to_string(),
            }),
        }
    }

    // Assignment

    fn place(&mut self, target: &Expression) -> Result<Place> {
        match target {
            Expression::Local(name) => {
                let local = self.symbols.find(name).ok_or_else(|| Error::UndeclaredVariable {
                    name: name.clone(),
                })?;
                Ok(Place::Local {
                    ptr: local.ptr,
                    ty: local.ty,
                })
            }
            Expression::Attribute { name, ty, .. } => Ok(Place::Attribute {
                name: name.clone(),
                ty: *ty,
            }),
            Expression::External { name, .. } => Err(Error::unsupported(
                "assignment",
                format!("read-only external \"{}\"", name),
            )),
            Expression::ArrayUnpack {
                expr,
                index,
                index2,
            } => match expr.as_ref() {
                Expression::Local(name) => {
                    let local =
                        self.symbols.find(name).ok_or_else(|| Error::UndeclaredVariable {
                            name: name.clone(),
                        })?;
                    let idx = self.element_index(local.ty, index, index2.as_deref())?;
                    let ptr = self.builder.element_ptr(local.ptr, idx, local.ty.len());
                    Ok(Place::Element {
                        ptr,
                        kind: element_kind(local.ty)?,
                    })
                }
                Expression::Attribute { name, ty, .. } => {
                    let idx = self.element_index(*ty, index, index2.as_deref())?;
                    Ok(Place::AttributeElement {
                        name: name.clone(),
                        ty: *ty,
                        index: idx,
                    })
                }
                _ => Err(Error::unsupported("assignment", "non-addressable component")),
            },
            _ => Err(Error::unsupported("assignment", "non-addressable expression")),
        }
    }

    fn load_place(&mut self, place: &Place) -> Result<Value> {
        match place {
            Place::Local { ptr, ty } => Ok(self.load_local(Local { ptr: *ptr, ty: *ty })),
            Place::Element { ptr, kind } => Ok(Value::Scalar {
                reg: self.builder.load(*ptr),
                kind: *kind,
            }),
            Place::Attribute { name, ty } => S::read_attribute(self, name, *ty),
            Place::AttributeElement { name, ty, index } => {
                let whole = S::read_attribute(self, name, *ty)?;
                let ptr = whole
                    .reg()
                    .ok_or_else(|| Error::execution("attribute read produced no value"))?;
                let p = self.builder.element_ptr(ptr, *index, ty.len());
                Ok(Value::Scalar {
                    reg: self.builder.load(p),
                    kind: element_kind(*ty)?,
                })
            }
        }
    }

    fn store_place(&mut self, place: &Place, value: Value) -> Result<Value> {
        let value = self.convert(value, place.ty())?;
        match place {
            Place::Local { ptr, ty } => self.store_value(*ptr, *ty, value)?,
            Place::Element { ptr, .. } => {
                let reg = scalar_reg(value)?;
                self.builder.store(*ptr, reg);
            }
            Place::Attribute { name, ty } => S::write_attribute(self, name, *ty, value)?,
            Place::AttributeElement { name, ty, index } => {
                let whole = S::read_attribute(self, name, *ty)?;
                let ptr = whole
                    .reg()
                    .ok_or_else(|| Error::execution("attribute read produced no value"))?;
                let p = self.builder.element_ptr(ptr, *index, ty.len());
                self.builder.store(p, scalar_reg(value)?);
                S::write_attribute(self, name, *ty, whole)?;
            }
        }
        Ok(value)
    }

    fn assign(
        &mut self,
        op: Option<BinaryOp>,
        target: &Expression,
        value: &Expression,
    ) -> Result<Value> {
        let place = self.place(target)?;
        let rhs = self.expression(value)?;
        let rhs = match op {
            None => rhs,
            Some(op) => {
                let current = self.load_place(&place)?;
                self.binary_values(op, current, rhs)?
            }
        };
        self.store_place(&place, rhs)
    }

    fn crement(&mut self, op: CrementOp, post: bool, target: &Expression) -> Result<Value> {
        let place = self.place(target)?;
        let current = self.load_place(&place)?;
        let (reg, kind) = match current {
            Value::Scalar { reg, kind } if kind != ScalarKind::Bool => (reg, kind),
            other => {
                let sym = if op == CrementOp::Increment { "++" } else { "--" };
                return Err(Error::unsupported(sym, other.ty().to_string()));
            }
        };
        let one = self.builder.constant(Word::one(kind));
        let bin = if op == CrementOp::Increment {
            BinOp::Add
        } else {
            BinOp::Sub
        };
        let next = Value::Scalar {
            reg: self.builder.binary(bin, reg, one),
            kind,
        };
        let stored = self.store_place(&place, next)?;
        Ok(if post { current } else { stored })
    }

    // Calls

    fn call(&mut self, name: &str, args: &[Expression]) -> Result<Value> {
        let mut values = Vec::with_capacity(args.len());
        for a in args {
            values.push(self.expression(a)?);
        }
        let types: Vec<Type> = values.iter().map(|v| v.ty()).collect();
        let unresolved = |kind: MatchKind, arities: Vec<usize>| Error::UnresolvedFunction {
            name: name.to_string(),
            match_kind: kind,
            args: types.iter().map(|t| t.to_string()).collect(),
            arities,
        };

        let Some(group) = self.registry.lookup(name, S::TARGET, false)? else {
            return Err(unresolved(MatchKind::None, Vec::new()));
        };
        match group.match_signature(&types, true) {
            (Some(sig), kind) if kind >= MatchKind::Implicit => self.emit_call(sig, &values),
            // the group exists but no overload takes this many arguments
            (_, MatchKind::None) => {
                let mut arities: Vec<usize> =
                    group.signatures().iter().map(|s| s.inputs().len()).collect();
                arities.sort_unstable();
                arities.dedup();
                Err(unresolved(MatchKind::Size, arities))
            }
            (_, kind) => Err(unresolved(kind, Vec::new())),
        }
    }

    /// Emit a call to a resolved overload
    pub(super) fn emit_call(&mut self, sig: &Signature, values: &[Value]) -> Result<Value> {
        let mut args = Vec::with_capacity(sig.params.len());
        for (v, p) in values.iter().zip(sig.inputs()) {
            args.push(self.argument(*v, *p)?);
        }
        let output = match sig.output() {
            Some(ty) => {
                let slot = self.alloc(ty)?;
                args.push(slot);
                Some(Value::Slot { ptr: slot, ty })
            }
            None => None,
        };

        let result = match &sig.imp {
            Implementation::Native(_) if sig.ret.is_void() => {
                self.builder.call_void(sig.symbol(), args);
                None
            }
            Implementation::Native(_) => {
                let Type::Scalar(kind) = sig.ret else {
                    return Err(Error::execution(format!(
                        "{} returns {} without an output slot",
                        sig.symbol(),
                        sig.ret
                    )));
                };
                Some(self.builder.call(sig.symbol(), args, RegType::Scalar(kind)))
            }
            Implementation::Inline(body) => body(&mut self.builder, &args)?,
        };

        if let Some(out) = output {
            return Ok(out);
        }
        match (sig.ret, result) {
            (Type::Void, _) => Ok(Value::Void),
            (Type::Scalar(kind), Some(reg)) => Ok(Value::Scalar { reg, kind }),
            (ty, Some(reg)) => Ok(Value::Slot { ptr: reg, ty }),
            (ty, None) => Err(Error::execution(format!(
                "{} produced no {} value",
                sig.symbol(),
                ty
            ))),
        }
    }

    fn argument(&mut self, value: Value, param: Type) -> Result<Reg> {
        match (value, param) {
            (Value::Scalar { reg, kind }, Type::Scalar(to)) => Ok(self.cast_to(reg, kind, to)),
            (Value::Slot { ptr, ty }, p) if ty == p => Ok(ptr),
            (v @ Value::Slot { .. }, p @ Type::Array { .. }) => {
                let converted = self.convert(v, p)?;
                scalar_or_ptr(converted)
            }
            (v, p) => Err(Error::TypeError {
                expected: p.to_string(),
                got: v.ty().to_string(),
            }),
        }
    }

    fn internal_symbol(&mut self, name: &str) -> Result<String> {
        let group = self
            .registry
            .lookup(name, S::TARGET, true)?
            .ok_or_else(|| Error::execution(format!("internal function {} is unavailable", name)))?;
        Ok(group.only()?.symbol().to_string())
    }

    /// Call an internal helper returning a scalar of `kind`
    pub(super) fn call_internal_value(
        &mut self,
        name: &str,
        args: Vec<Reg>,
        kind: ScalarKind,
    ) -> Result<Reg> {
        let symbol = self.internal_symbol(name)?;
        Ok(self.builder.call(&symbol, args, RegType::Scalar(kind)))
    }

    /// Call an internal helper for its side effects
    pub(super) fn call_internal_void(&mut self, name: &str, args: Vec<Reg>) -> Result<()> {
        let symbol = self.internal_symbol(name)?;
        self.builder.call_void(&symbol, args);
        Ok(())
    }

    // Handles

    fn handle(&mut self, base: Reg, symbol: String, count: usize) -> Reg {
        let index = self.builder.global(&symbol);
        self.globals.insert(symbol);
        let p = self.builder.element_ptr(base, index, count);
        self.builder.load(p)
    }

    /// Load the handle of attribute `name` from the handle array
    pub(super) fn attribute_handle(&mut self, name: &str) -> Result<Reg> {
        if self.access.attribute(name).is_none() {
            return Err(Error::execution(format!(
                "attribute \"{}\" is missing from the access registry",
                name
            )));
        }
        let count = self.access.attributes().len();
        Ok(self.handle(HANDLES, AttributeRegistry::attribute_symbol(name), count))
    }

    fn read_external(&mut self, name: &str, ty: Type) -> Result<Value> {
        if self.access.external(name).is_none() {
            return Err(Error::execution(format!(
                "external \"{}\" is missing from the access registry",
                name
            )));
        }
        let count = self.access.externals().len();
        let h = self.handle(EXTERNALS, AttributeRegistry::external_symbol(name), count);
        match ty {
            Type::Scalar(kind) => {
                let zero = self.builder.constant(Word::zero(kind));
                let reg = self.call_internal_value("ax.external.scalar", vec![h, zero], kind)?;
                Ok(Value::Scalar { reg, kind })
            }
            Type::Array { .. } | Type::String => {
                let slot = self.alloc(ty)?;
                let helper = if ty.is_string() {
                    "ax.external.string"
                } else {
                    "ax.external.array"
                };
                self.call_internal_void(helper, vec![h, slot])?;
                Ok(Value::Slot { ptr: slot, ty })
            }
            Type::Void => Err(Error::unsupported("$", "void")),
        }
    }

    // Storage

    /// Zeroed frame slot for a value of `ty`
    pub(super) fn alloc(&mut self, ty: Type) -> Result<Reg> {
        Ok(self.builder.alloca(slot_type(ty)?))
    }

    pub(super) fn cast_to(&mut self, reg: Reg, from: ScalarKind, to: ScalarKind) -> Reg {
        if from == to {
            reg
        } else {
            self.builder.cast(reg, to)
        }
    }

    fn store_zero(&mut self, slot: Reg, ty: Type) {
        match ty {
            Type::Scalar(kind) => {
                let zero = self.builder.constant(Word::zero(kind));
                self.builder.store(slot, zero);
            }
            Type::Array { elem, len } => {
                let zero = self.builder.constant(Word::zero(elem));
                for i in 0..len {
                    let p = self.builder.element_ptr_const(slot, i, len);
                    self.builder.store(p, zero);
                }
            }
            Type::String => {
                let zero = self.builder.constant(Word::I64(0));
                self.builder.str_resize(slot, zero);
            }
            Type::Void => {}
        }
    }

    /// Copy `value` (already of type `ty`) into the slot at `ptr`
    pub(super) fn store_value(&mut self, ptr: Reg, ty: Type, value: Value) -> Result<()> {
        match (ty, value) {
            (Type::Scalar(_), Value::Scalar { reg, .. }) => self.builder.store(ptr, reg),
            (Type::Array { len, .. }, Value::Slot { ptr: src, .. }) => {
                if src != ptr {
                    for i in 0..len {
                        let from = self.builder.element_ptr_const(src, i, len);
                        let v = self.builder.load(from);
                        let to = self.builder.element_ptr_const(ptr, i, len);
                        self.builder.store(to, v);
                    }
                }
            }
            (Type::String, Value::Slot { ptr: src, .. }) => {
                if src != ptr {
                    let len = self.builder.str_len(src);
                    self.builder.str_resize(ptr, len);
                    let zero = self.builder.constant(Word::I64(0));
                    self.builder.str_copy(ptr, zero, src);
                }
            }
            (ty, v) => {
                return Err(Error::TypeError {
                    expected: ty.to_string(),
                    got: v.ty().to_string(),
                })
            }
        }
        Ok(())
    }

    /// Convert `value` to `ty`
    ///
    /// Scalars cast, a scalar broadcasts into a vector or becomes `s * I` for
    /// a matrix, and arrays of equal length convert element-wise. Anything
    /// else (arrays to scalars in particular) is a type error.
    pub(super) fn convert(&mut self, value: Value, ty: Type) -> Result<Value> {
        let from = value.ty();
        if from == ty {
            return Ok(value);
        }
        match (value, ty) {
            (Value::Scalar { reg, kind }, Type::Scalar(to)) => Ok(Value::Scalar {
                reg: self.cast_to(reg, kind, to),
                kind: to,
            }),
            (Value::Scalar { reg, kind }, Type::Array { elem, len }) => {
                let s = self.cast_to(reg, kind, elem);
                if let Some(dim) = ty.matrix_dim() {
                    return self.scalar_matrix(s, elem, dim);
                }
                let slot = self.alloc(ty)?;
                for i in 0..len {
                    let p = self.builder.element_ptr_const(slot, i, len);
                    self.builder.store(p, s);
                }
                Ok(Value::Slot { ptr: slot, ty })
            }
            (
                Value::Slot {
                    ptr,
                    ty: Type::Array { elem: from_elem, len: n },
                },
                Type::Array { elem, len },
            ) if n == len => {
                let slot = self.alloc(ty)?;
                for i in 0..len {
                    let src = self.builder.element_ptr_const(ptr, i, len);
                    let v = self.builder.load(src);
                    let v = self.cast_to(v, from_elem, elem);
                    let dst = self.builder.element_ptr_const(slot, i, len);
                    self.builder.store(dst, v);
                }
                Ok(Value::Slot { ptr: slot, ty })
            }
            _ => Err(Error::TypeError {
                expected: ty.to_string(),
                got: from.to_string(),
            }),
        }
    }

    /// `s * I` for a `dim` x `dim` matrix
    pub(super) fn scalar_matrix(&mut self, s: Reg, elem: ScalarKind, dim: usize) -> Result<Value> {
        let ty = Type::mat(elem, dim);
        let slot = self.alloc(ty)?;
        for i in 0..dim {
            let p = self.builder.element_ptr_const(slot, i * dim + i, dim * dim);
            self.builder.store(p, s);
        }
        Ok(Value::Slot { ptr: slot, ty })
    }

    /// Registry used to resolve calls
    pub(super) fn registry(&mut self) -> &mut FunctionRegistry {
        self.registry
    }
}

fn element_kind(ty: Type) -> Result<ScalarKind> {
    ty.element()
        .ok_or_else(|| Error::unsupported("[]", ty.to_string()))
}

fn scalar_reg(value: Value) -> Result<Reg> {
    match value {
        Value::Scalar { reg, .. } => Ok(reg),
        other => Err(Error::TypeError {
            expected: "a scalar".to_string(),
            got: other.ty().to_string(),
        }),
    }
}

fn scalar_or_ptr(value: Value) -> Result<Reg> {
    value
        .reg()
        .ok_or_else(|| Error::execution("void value used as an argument"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::codegen::{generate, PointKernel, VolumeKernel};
    use crate::compiler::default_types;
    use crate::compiler::ir::{Inst, Module, Terminator};
    use crate::compiler::Target;
    use crate::parser::parse;

    fn lower(source: &str) -> (Result<Module>, Logger) {
        let tree = default_types::infer(&parse(source).unwrap(), Target::Points);
        let access = AttributeRegistry::build(&tree).unwrap();
        let mut registry = FunctionRegistry::new();
        let mut logger = Logger::new();
        let module = generate::<PointKernel>(&tree, &mut registry, &access, &mut logger);
        (module, logger)
    }

    fn errors(logger: &Logger) -> Vec<String> {
        logger.errors().map(|d| d.error.to_string()).collect()
    }

    #[test]
    fn test_simple_program_has_no_diagnostics() {
        let (module, logger) = lower("int a = 1 + 2; a;");
        assert!(!logger.has_errors(), "{:?}", errors(&logger));
        let module = module.unwrap();
        assert!(module.function(super::super::POINT_KERNEL).is_some());
        assert!(module.function(super::super::POINT_RANGE_KERNEL).is_some());
    }

    #[test]
    fn test_redeclaration_and_shadowing() {
        let (_, logger) = lower("int a = 1; int a = 2;");
        assert!(matches!(
            logger.errors().next().map(|d| &d.error),
            Some(Error::Redeclaration { .. })
        ));

        let (_, logger) = lower("int a = 1; { int a = 2; }");
        assert!(!logger.has_errors());
        assert_eq!(logger.warnings().count(), 1);
    }

    #[test]
    fn test_break_outside_loop_keeps_compiling() {
        let (_, logger) = lower("break; int a = bogus();");
        let errs = errors(&logger);
        assert_eq!(errs.len(), 2);
        assert!(errs[0].contains("break"));
        assert!(errs[1].contains("bogus"));
    }

    #[test]
    fn test_statements_after_return_are_skipped() {
        let (module, logger) = lower("f@a = 1; return; f@a = 2;");
        assert!(!logger.has_errors());
        assert_eq!(logger.warnings().count(), 1);
        let module = module.unwrap();
        let kernel = module.function(super::super::POINT_KERNEL).unwrap();
        assert!(kernel.blocks.iter().all(|b| b.terminator.is_some()));
        let stores = kernel
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter(|i| matches!(i, Inst::Call { callee, .. } if callee == "ax.point.set.scalar"))
            .count();
        assert_eq!(stores, 1);
    }

    #[test]
    fn test_both_branches_diverging() {
        let (module, logger) = lower("if (true) { return; } else { return; } f@a = 1;");
        assert!(!logger.has_errors());
        let module = module.unwrap();
        let kernel = module.function(super::super::POINT_KERNEL).unwrap();
        assert!(kernel
            .blocks
            .iter()
            .any(|b| b.terminator == Some(Terminator::Unreachable)));
    }

    #[test]
    fn test_operator_errors() {
        let (_, logger) = lower("float a = 1.0f & 2.0f;");
        assert!(matches!(
            logger.errors().next().map(|d| &d.error),
            Some(Error::UnsupportedOperation { .. })
        ));
        let (_, logger) = lower("vec3f a; vec3f b; bool c = a < b;");
        assert!(logger.has_errors());
        let (_, logger) = lower("vec3f a; vec4f b; vec3f c = a + b;");
        assert!(logger.has_errors());
    }

    #[test]
    fn test_array_to_scalar_is_an_error() {
        let (_, logger) = lower("f@a = {1, 2, 3};");
        assert!(matches!(
            logger.errors().next().map(|d| &d.error),
            Some(Error::TypeError { .. })
        ));
        let (_, logger) = lower("v@v = {1, 2, 3};");
        assert!(!logger.has_errors());
    }

    #[test]
    fn test_unresolved_function_kinds() {
        let (_, logger) = lower("bogus(1, 2);");
        assert!(matches!(
            logger.errors().next().map(|d| &d.error),
            Some(Error::UnresolvedFunction {
                match_kind: MatchKind::None,
                ..
            })
        ));
        let (_, logger) = lower("float a = sin(1.0, 2.0);");
        let error = logger.errors().next().map(|d| &d.error);
        assert!(matches!(
            error,
            Some(Error::UnresolvedFunction {
                match_kind: MatchKind::Size,
                ..
            })
        ));
        assert!(error.unwrap().to_string().contains("takes 2 argument(s)"));
        assert!(error.unwrap().to_string().contains("expected 1"));

        // right arity, wrong types
        let (_, logger) = lower("string s; float a = sin(s);");
        let error = logger.errors().next().map(|d| d.error.to_string()).unwrap();
        assert!(error.contains("matches the argument types"), "{}", error);
    }

    #[test]
    fn test_point_functions_unavailable_to_volumes() {
        let tree = parse("deletepoint();").unwrap();
        let access = AttributeRegistry::build(&tree).unwrap();
        let mut registry = FunctionRegistry::new();
        let mut logger = Logger::new();
        generate::<VolumeKernel>(&tree, &mut registry, &access, &mut logger).unwrap();
        assert!(logger.has_errors());
    }

    #[test]
    fn test_external_assignment_rejected() {
        let (_, logger) = lower("f$x = 1;");
        assert!(logger.has_errors());
    }

    #[test]
    fn test_max_errors_stops_generation() {
        let tree = parse("break; break; break; break;").unwrap();
        let access = AttributeRegistry::build(&tree).unwrap();
        let mut registry = FunctionRegistry::new();
        let mut logger = Logger::new().with_max_errors(2);
        generate::<PointKernel>(&tree, &mut registry, &access, &mut logger).unwrap();
        assert_eq!(logger.error_count(), 2);
    }
}
