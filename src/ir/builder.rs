use crate::ir::{BlockId, OpId, OpKind, Program, Type, ValueId};

/// Where a [Builder] inserts new operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertPoint {
    End(BlockId),
    Before(OpId),
    After(OpId),
}

/// Creates operations at an insertion point. Rewrite patterns receive one of these as their
/// rewriter.
///
/// Consecutive inserts at [InsertPoint::Before] keep their creation order. [InsertPoint::After]
/// is converted into a `Before` of the following op (or the block end) when set, so repeated
/// inserts stay in order there as well.
pub struct Builder<'p> {
    pub program: &'p mut Program,
    ip: InsertPoint,
}

impl<'p> Builder<'p> {
    pub fn new(program: &'p mut Program, ip: InsertPoint) -> Self {
        let ip = normalize(program, ip);
        Builder { program, ip }
    }

    pub fn at_end(program: &'p mut Program, block: BlockId) -> Self {
        Builder::new(program, InsertPoint::End(block))
    }

    pub fn before(program: &'p mut Program, op: OpId) -> Self {
        Builder::new(program, InsertPoint::Before(op))
    }

    pub fn insertion_point(&self) -> InsertPoint {
        self.ip
    }

    pub fn set_insertion_point(&mut self, ip: InsertPoint) {
        self.ip = normalize(self.program, ip);
    }

    /// Creates an operation at the insertion point.
    pub fn create(
        &mut self,
        kind: OpKind,
        operands: &[ValueId],
        result_types: Vec<Type>,
        regions: Vec<BlockId>,
    ) -> OpId {
        let op = self.program.create_op(kind, operands, result_types, regions);
        self.program.insert_op(self.ip, op);
        op
    }

    /// Creates a single-result operation and returns its result.
    pub fn create_value(&mut self, kind: OpKind, operands: &[ValueId], result_type: Type) -> ValueId {
        let op = self.create(kind, operands, vec![result_type], vec![]);
        self.program.result(op, 0)
    }

    /// Creates a detached block, fills it using `body` and returns it. The insertion point is
    /// restored afterwards.
    pub fn build_block(
        &mut self,
        arg_types: &[Type],
        body: impl FnOnce(&mut Builder, &[ValueId]),
    ) -> BlockId {
        let block = self.program.create_block(arg_types);
        let args = self.program.block_args(block).to_vec();
        let saved = self.ip;
        self.ip = InsertPoint::End(block);
        body(self, &args);
        self.ip = saved;
        block
    }

    pub fn replace_op(&mut self, op: OpId, new_values: &[ValueId]) {
        if self.ip == InsertPoint::Before(op) {
            self.ip = next_point(self.program, op);
        }
        self.program.replace_op(op, new_values);
    }

    pub fn erase_op(&mut self, op: OpId) {
        if self.ip == InsertPoint::Before(op) {
            self.ip = next_point(self.program, op);
        }
        self.program.erase_op(op);
    }

    pub fn value_type(&self, value: ValueId) -> &Type {
        self.program.value_type(value)
    }
}

fn normalize(program: &Program, ip: InsertPoint) -> InsertPoint {
    match ip {
        InsertPoint::After(op) => next_point(program, op),
        other => other,
    }
}

fn next_point(program: &Program, op: OpId) -> InsertPoint {
    let block = program
        .parent_block(op)
        .expect("insertion anchor must be attached to a block");
    let ops = program.block_ops(block);
    match ops.iter().position(|o| *o == op).and_then(|p| ops.get(p + 1)) {
        Some(next) => InsertPoint::Before(*next),
        None => InsertPoint::End(block),
    }
}
