//! A small arena-based IR: operations, values and single-block regions.
//!
//! Operations live in a [Program] and are addressed by [OpId]. Erased operations keep their
//! slot in the arena (ids are never reused) but are detached from their block and must not be
//! read again by rewrite code.

pub mod affine;
pub mod builder;
pub mod ops;
pub mod printer;
pub mod types;
pub mod verify;

pub use builder::{Builder, InsertPoint};
pub use ops::OpKind;
pub use types::{ShapedKind, ShapedType, Type};

use crate::dialect::func::{FuncOp, FunctionType};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueDef {
    OpResult { op: OpId, index: usize },
    BlockArg { block: BlockId, index: usize },
}

#[derive(Clone, Debug)]
pub struct Operation {
    pub kind: OpKind,
    operands: Vec<ValueId>,
    results: Vec<ValueId>,
    regions: Vec<BlockId>,
    parent: Option<BlockId>,
    erased: bool,
}

#[derive(Clone, Debug)]
struct BlockData {
    args: Vec<ValueId>,
    ops: Vec<OpId>,
    parent: Option<OpId>,
}

#[derive(Clone, Debug)]
struct ValueData {
    ty: Type,
    def: ValueDef,
}

#[derive(Clone, Debug)]
pub struct Program {
    ops: Vec<Operation>,
    values: Vec<ValueData>,
    blocks: Vec<BlockData>,
    module: OpId,
}

impl Operation {
    #[inline]
    pub fn operands(&self) -> &[ValueId] {
        &self.operands
    }

    #[inline]
    pub fn results(&self) -> &[ValueId] {
        &self.results
    }

    #[inline]
    pub fn regions(&self) -> &[BlockId] {
        &self.regions
    }

    #[inline]
    pub fn parent_block(&self) -> Option<BlockId> {
        self.parent
    }

    #[inline]
    pub fn is_erased(&self) -> bool {
        self.erased
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

impl Program {
    pub fn new() -> Program {
        let mut program = Program {
            ops: vec![],
            values: vec![],
            blocks: vec![],
            module: OpId(0),
        };
        let body = program.create_block(&[]);
        program.module = program.create_op(OpKind::Module, &[], vec![], vec![body]);
        program
    }

    #[inline]
    pub fn module(&self) -> OpId {
        self.module
    }

    pub fn module_body(&self) -> BlockId {
        self.ops[self.module.0 as usize].regions[0]
    }

    #[inline]
    pub fn op(&self, op: OpId) -> &Operation {
        &self.ops[op.0 as usize]
    }

    #[inline]
    pub fn kind(&self, op: OpId) -> &OpKind {
        &self.ops[op.0 as usize].kind
    }

    #[inline]
    pub fn kind_mut(&mut self, op: OpId) -> &mut OpKind {
        &mut self.ops[op.0 as usize].kind
    }

    #[inline]
    pub fn operands(&self, op: OpId) -> &[ValueId] {
        &self.ops[op.0 as usize].operands
    }

    #[inline]
    pub fn results(&self, op: OpId) -> &[ValueId] {
        &self.ops[op.0 as usize].results
    }

    pub fn result(&self, op: OpId, idx: usize) -> ValueId {
        self.ops[op.0 as usize].results[idx]
    }

    #[inline]
    pub fn regions(&self, op: OpId) -> &[BlockId] {
        &self.ops[op.0 as usize].regions
    }

    pub fn is_erased(&self, op: OpId) -> bool {
        self.ops[op.0 as usize].erased
    }

    /// The number of operation slots ever allocated. Ids at or past a recorded watermark were
    /// created after it.
    pub fn op_watermark(&self) -> usize {
        self.ops.len()
    }

    pub fn ops_created_since(&self, watermark: usize) -> impl Iterator<Item = OpId> + '_ {
        (watermark..self.ops.len())
            .map(|i| OpId(u32::try_from(i).unwrap_or(u32::MAX)))
            .filter(|op| !self.is_erased(*op))
    }

    pub fn live_op_count(&self) -> usize {
        self.walk(self.module).len()
    }

    #[inline]
    pub fn value_type(&self, value: ValueId) -> &Type {
        &self.values[value.0 as usize].ty
    }

    pub fn shaped_type(&self, value: ValueId) -> Option<&ShapedType> {
        self.value_type(value).as_shaped()
    }

    #[inline]
    pub fn value_def(&self, value: ValueId) -> ValueDef {
        self.values[value.0 as usize].def
    }

    pub fn defining_op(&self, value: ValueId) -> Option<OpId> {
        match self.value_def(value) {
            ValueDef::OpResult { op, .. } => Some(op),
            ValueDef::BlockArg { .. } => None,
        }
    }

    /// Returns the block and position of a block argument.
    pub fn as_block_arg(&self, value: ValueId) -> Option<(BlockId, usize)> {
        match self.value_def(value) {
            ValueDef::BlockArg { block, index } => Some((block, index)),
            ValueDef::OpResult { .. } => None,
        }
    }

    pub fn block_args(&self, block: BlockId) -> &[ValueId] {
        &self.blocks[block.0 as usize].args
    }

    pub fn block_ops(&self, block: BlockId) -> &[OpId] {
        &self.blocks[block.0 as usize].ops
    }

    /// The last operation of a block, if any.
    pub fn terminator(&self, block: BlockId) -> Option<OpId> {
        self.block_ops(block).last().copied()
    }

    pub fn block_parent_op(&self, block: BlockId) -> Option<OpId> {
        self.blocks[block.0 as usize].parent
    }

    pub fn parent_block(&self, op: OpId) -> Option<BlockId> {
        self.ops[op.0 as usize].parent
    }

    pub fn parent_op(&self, op: OpId) -> Option<OpId> {
        self.parent_block(op).and_then(|b| self.block_parent_op(b))
    }

    /// Returns `true` if `op` is nested (at any depth) inside `ancestor`.
    pub fn is_proper_ancestor(&self, ancestor: OpId, op: OpId) -> bool {
        let mut current = self.parent_op(op);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.parent_op(p);
        }
        false
    }

    /// Returns the closest enclosing operation satisfying `pred`.
    pub fn enclosing_op(&self, op: OpId, pred: impl Fn(&OpKind) -> bool) -> Option<OpId> {
        let mut current = self.parent_op(op);
        while let Some(p) = current {
            if pred(self.kind(p)) {
                return Some(p);
            }
            current = self.parent_op(p);
        }
        None
    }

    /// Creates a detached block with arguments of the given types.
    pub fn create_block(&mut self, arg_types: &[Type]) -> BlockId {
        let block = BlockId(self.next_index(self.blocks.len()));
        self.blocks.push(BlockData {
            args: vec![],
            ops: vec![],
            parent: None,
        });
        for (index, ty) in arg_types.iter().enumerate() {
            let v = self.new_value(ty.clone(), ValueDef::BlockArg { block, index });
            self.blocks[block.0 as usize].args.push(v);
        }
        block
    }

    /// Creates a detached operation. Regions become owned by the new operation.
    pub fn create_op(
        &mut self,
        kind: OpKind,
        operands: &[ValueId],
        result_types: Vec<Type>,
        regions: Vec<BlockId>,
    ) -> OpId {
        let op = OpId(self.next_index(self.ops.len()));
        for region in &regions {
            debug_assert!(self.blocks[region.0 as usize].parent.is_none());
            self.blocks[region.0 as usize].parent = Some(op);
        }
        let results = result_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| self.new_value(ty, ValueDef::OpResult { op, index }))
            .collect();
        self.ops.push(Operation {
            kind,
            operands: operands.to_vec(),
            results,
            regions,
            parent: None,
            erased: false,
        });
        op
    }

    pub fn insert_op(&mut self, ip: InsertPoint, op: OpId) {
        debug_assert!(self.ops[op.0 as usize].parent.is_none());
        let (block, index) = match ip {
            InsertPoint::End(block) => (block, self.block_ops(block).len()),
            InsertPoint::Before(anchor) => {
                let block = self
                    .parent_block(anchor)
                    .expect("insertion anchor must be attached to a block");
                (block, self.position_in_block(block, anchor))
            }
            InsertPoint::After(anchor) => {
                let block = self
                    .parent_block(anchor)
                    .expect("insertion anchor must be attached to a block");
                (block, self.position_in_block(block, anchor) + 1)
            }
        };
        self.blocks[block.0 as usize].ops.insert(index, op);
        self.ops[op.0 as usize].parent = Some(block);
    }

    /// Detaches `op` from its block and re-inserts it at `ip`.
    pub fn move_op(&mut self, op: OpId, ip: InsertPoint) {
        self.detach(op);
        self.insert_op(ip, op);
    }

    pub fn set_operand(&mut self, op: OpId, idx: usize, value: ValueId) {
        self.ops[op.0 as usize].operands[idx] = value;
    }

    pub fn set_operands(&mut self, op: OpId, operands: Vec<ValueId>) {
        self.ops[op.0 as usize].operands = operands;
    }

    /// Replaces every use of `from` in live operations with `to`.
    pub fn replace_all_uses_with(&mut self, from: ValueId, to: ValueId) {
        if from == to {
            return;
        }
        for op in self.ops.iter_mut().filter(|o| !o.erased) {
            for operand in op.operands.iter_mut() {
                if *operand == from {
                    *operand = to;
                }
            }
        }
    }

    /// Replaces all uses of the results of `op` with `new_values` and erases `op`.
    pub fn replace_op(&mut self, op: OpId, new_values: &[ValueId]) {
        let results = self.results(op).to_vec();
        debug_assert_eq!(results.len(), new_values.len());
        for (from, to) in results.into_iter().zip(new_values) {
            self.replace_all_uses_with(from, *to);
        }
        self.erase_op(op);
    }

    /// Detaches `op` and marks it, and everything nested in it, as erased.
    pub fn erase_op(&mut self, op: OpId) {
        for nested in self.walk(op) {
            self.ops[nested.0 as usize].erased = true;
        }
        self.detach(op);
    }

    fn detach(&mut self, op: OpId) {
        if let Some(block) = self.ops[op.0 as usize].parent.take() {
            self.blocks[block.0 as usize].ops.retain(|o| *o != op);
        }
    }

    /// Live operations nested in `root` (including `root`), in pre-order.
    pub fn walk(&self, root: OpId) -> Vec<OpId> {
        let mut out = vec![];
        self.walk_into(root, &mut out);
        out
    }

    fn walk_into(&self, op: OpId, out: &mut Vec<OpId>) {
        if self.is_erased(op) {
            return;
        }
        out.push(op);
        for region in self.regions(op) {
            for nested in self.block_ops(*region) {
                self.walk_into(*nested, out);
            }
        }
    }

    /// Live operations nested in `block`, in pre-order.
    pub fn walk_block(&self, block: BlockId) -> Vec<OpId> {
        let mut out = vec![];
        for op in self.block_ops(block) {
            self.walk_into(*op, &mut out);
        }
        out
    }

    /// Live operations using `value`, in program order.
    pub fn users(&self, value: ValueId) -> Vec<OpId> {
        self.walk(self.module)
            .into_iter()
            .filter(|op| self.operands(*op).contains(&value))
            .collect()
    }

    pub fn has_uses(&self, value: ValueId) -> bool {
        self.ops
            .iter()
            .any(|o| !o.erased && o.parent.is_some() && o.operands.contains(&value))
    }

    /// The user of `value` that immediately precedes `current_user` in program order.
    pub fn prev_user(&self, value: ValueId, current_user: OpId) -> Option<OpId> {
        let users = self.users(value);
        let pos = users.iter().position(|u| *u == current_user)?;
        pos.checked_sub(1).map(|p| users[p])
    }

    /// Function definitions (with a body) in the module, in order.
    pub fn functions(&self) -> Vec<OpId> {
        self.block_ops(self.module_body())
            .iter()
            .copied()
            .filter(|op| {
                matches!(self.kind(*op), OpKind::Func(FuncOp::Func { .. }))
                    && !self.regions(*op).is_empty()
            })
            .collect()
    }

    pub fn lookup_function(&self, name: &str) -> Option<OpId> {
        self.block_ops(self.module_body()).iter().copied().find(|op| {
            matches!(self.kind(*op), OpKind::Func(FuncOp::Func { name: n, .. }) if n == name)
        })
    }

    /// Appends a function definition to the module and returns it with its entry block.
    pub fn add_function(&mut self, name: &str, inputs: &[Type], results: &[Type]) -> (OpId, BlockId) {
        let body = self.create_block(inputs);
        let func = self.create_op(
            OpKind::Func(FuncOp::Func {
                name: name.to_string(),
                signature: FunctionType {
                    inputs: inputs.to_vec(),
                    results: results.to_vec(),
                },
                private: false,
            }),
            &[],
            vec![],
            vec![body],
        );
        let module_body = self.module_body();
        self.insert_op(InsertPoint::End(module_body), func);
        (func, body)
    }

    /// The entry block of a function or any other single-region operation.
    pub fn body(&self, op: OpId) -> Option<BlockId> {
        self.regions(op).first().copied()
    }

    /// Clones `block` into a new detached block. `mapping` is seeded by the caller (e.g. for
    /// values defined above) and receives the mapping of every cloned value.
    pub fn clone_block(&mut self, block: BlockId, mapping: &mut HashMap<ValueId, ValueId>) -> BlockId {
        let arg_types: Vec<Type> = self
            .block_args(block)
            .iter()
            .map(|a| self.value_type(*a).clone())
            .collect();
        let new_block = self.create_block(&arg_types);
        for (old, new) in self
            .block_args(block)
            .to_vec()
            .into_iter()
            .zip(self.block_args(new_block).to_vec())
        {
            mapping.insert(old, new);
        }
        for op in self.block_ops(block).to_vec() {
            let cloned = self.clone_op(op, mapping);
            self.insert_op(InsertPoint::End(new_block), cloned);
        }
        new_block
    }

    /// Clones a single operation (and its regions) without inserting it.
    pub fn clone_op(&mut self, op: OpId, mapping: &mut HashMap<ValueId, ValueId>) -> OpId {
        let regions: Vec<BlockId> = self.regions(op).to_vec();
        let new_regions = regions
            .into_iter()
            .map(|r| self.clone_block(r, mapping))
            .collect();
        let operands: Vec<ValueId> = self
            .operands(op)
            .iter()
            .map(|v| *mapping.get(v).unwrap_or(v))
            .collect();
        let result_types = self
            .results(op)
            .iter()
            .map(|r| self.value_type(*r).clone())
            .collect();
        let kind = self.kind(op).clone();
        let cloned = self.create_op(kind, &operands, result_types, new_regions);
        for (old, new) in self
            .results(op)
            .to_vec()
            .into_iter()
            .zip(self.results(cloned).to_vec())
        {
            mapping.insert(old, new);
        }
        cloned
    }

    fn position_in_block(&self, block: BlockId, op: OpId) -> usize {
        self.block_ops(block)
            .iter()
            .position(|o| *o == op)
            .unwrap_or_else(|| panic!("{op:?} not found in {block:?}"))
    }

    fn new_value(&mut self, ty: Type, def: ValueDef) -> ValueId {
        let v = ValueId(self.next_index(self.values.len()));
        self.values.push(ValueData { ty, def });
        v
    }

    fn next_index(&self, len: usize) -> u32 {
        u32::try_from(len).expect("IR arena exhausted")
    }
}

impl Default for Program {
    fn default() -> Self {
        Program::new()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}
