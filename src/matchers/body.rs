//! Predicates over the scalar body of a `linalg.generic`.

use crate::dialect::arith::{is_zero_constant, ArithOp};
use crate::dialect::linalg::{LinalgOp, Structured};
use crate::ir::{OpId, OpKind, Program, ValueId};
use crate::matchers::ZeroSearch;

/// Follows chains of single-operand conversions back to their source.
fn strip_unary(program: &Program, mut value: ValueId) -> ValueId {
    while let Some(op) = program.defining_op(value) {
        match program.kind(op) {
            OpKind::Arith(a) if a.is_unary() => value = program.operands(op)[0],
            _ => break,
        }
    }
    value
}

/// The position of `value` among the body arguments of `s`.
fn arg_index(s: &Structured<'_>, value: ValueId) -> Option<usize> {
    let body = s.body()?;
    s.program().block_args(body).iter().position(|a| *a == value)
}

fn single_yielded(program: &Program, yield_op: OpId) -> Option<ValueId> {
    match program.operands(yield_op) {
        [v] => Some(*v),
        _ => None,
    }
}

/// Returns `true` if the body is, modulo chains of unary conversions and operand order,
/// `out + a * b` where `a`, `b` are the two input arguments and `out` is the output argument.
pub fn is_add_mul(s: &Structured<'_>) -> bool {
    let program = s.program();
    let Some(body) = s.body() else {
        return false;
    };
    if s.num_inputs() != 2 || s.num_inits() != 1 {
        return false;
    }
    let ops = program.block_ops(body);
    let (mut add, mut mul) = (None, None);
    for (i, op) in ops.iter().enumerate() {
        match program.kind(*op) {
            OpKind::Arith(a) if a.is_add() => {
                if add.replace(*op).is_some() {
                    return false;
                }
            }
            OpKind::Arith(a) if a.is_mul() => {
                if mul.replace(*op).is_some() {
                    return false;
                }
            }
            OpKind::Arith(a) if a.is_unary() => {}
            OpKind::Linalg(LinalgOp::Yield) if i == ops.len() - 1 => {}
            _ => return false,
        }
    }
    let (Some(add), Some(mul)) = (add, mul) else {
        return false;
    };
    let Some(yielded) = ops.last().and_then(|y| single_yielded(program, *y)) else {
        return false;
    };
    if strip_unary(program, yielded) != program.result(add, 0) {
        return false;
    }

    let add_args: Vec<ValueId> = program
        .operands(add)
        .iter()
        .map(|v| strip_unary(program, *v))
        .collect();
    let mul_result = program.result(mul, 0);
    let accumulator = match add_args[..] {
        [x, y] if x == mul_result => y,
        [x, y] if y == mul_result => x,
        _ => return false,
    };
    if arg_index(s, accumulator) != Some(2) {
        return false;
    }

    let mut mul_args: Vec<Option<usize>> = program
        .operands(mul)
        .iter()
        .map(|v| arg_index(s, strip_unary(program, *v)))
        .collect();
    mul_args.sort();
    mul_args == [Some(0), Some(1)]
}

/// Returns the single non-terminator op of the body if the body is exactly that op and a yield of
/// its scalar result.
pub fn single_op(s: &Structured<'_>, pred: impl Fn(&ArithOp) -> bool) -> Option<OpId> {
    let program = s.program();
    let body = s.body()?;
    let [op, yield_op] = program.block_ops(body) else {
        return None;
    };
    match (program.kind(*op), program.kind(*yield_op)) {
        (OpKind::Arith(a), OpKind::Linalg(LinalgOp::Yield)) if pred(a) => {}
        _ => return None,
    }
    let result = program.result(*op, 0);
    if !program.value_type(result).is_int_or_float() {
        return None;
    }
    (single_yielded(program, *yield_op) == Some(result)).then_some(*op)
}

/// For an elementwise add body, the operand indices of the two summands, in order.
pub fn add_operands(s: &Structured<'_>) -> Option<(usize, usize)> {
    let op = single_op(s, |a| a.is_add())?;
    let args = s.program().operands(op);
    let lhs = arg_index(s, args[0])?;
    let rhs = arg_index(s, args[1])?;
    (lhs != rhs).then_some((lhs, rhs))
}

/// Returns `true` if the body only yields the first argument.
pub fn is_identity_body(s: &Structured<'_>) -> bool {
    let program = s.program();
    let Some(body) = s.body() else {
        return false;
    };
    let [yield_op] = program.block_ops(body) else {
        return false;
    };
    single_yielded(program, *yield_op) == program.block_args(body).first().copied()
}

/// For a relu body `maxf(x, zero)`, the operand index of `x`. The zero is a literal, a value
/// proven zero, or an argument whose operand is proven zero where the op reads it.
pub fn relu_operand(s: &Structured<'_>, zero: &ZeroSearch) -> Option<usize> {
    let program = s.program();
    let maxf = single_op(s, |a| *a == ArithOp::MaxF)?;
    let is_zero = |v: ValueId| {
        if is_zero_constant(program, v) || zero.is_zero_value(program, v) {
            return true;
        }
        arg_index(s, v).map_or(false, |idx| {
            zero.is_zero_before(program, s.operands()[idx], s.op())
        })
    };
    let (lhs, rhs) = (program.operands(maxf)[0], program.operands(maxf)[1]);
    if is_zero(rhs) {
        if let Some(idx) = arg_index(s, lhs) {
            return Some(idx);
        }
    }
    if is_zero(lhs) {
        return arg_index(s, rhs);
    }
    None
}
