//! A debug printer producing MLIR-like text. There is no parser; the output is meant for logs and
//! test assertions.

use crate::dialect::arith::ArithOp;
use crate::dialect::func::FuncOp;
use crate::dialect::linalg::LinalgOp;
use crate::dialect::memref::MemRefOp;
use crate::dialect::tensor::TensorOp;
use crate::ir::{BlockId, OpId, OpKind, Program, ValueId};
use crate::utils::{indent, join_into_string};

use std::fmt::Write;

fn value_name(value: ValueId) -> String {
    format!("%{}", value.0)
}

fn attributes(kind: &OpKind) -> String {
    match kind {
        OpKind::Module => String::new(),
        OpKind::Func(FuncOp::Func { name, private, .. }) => {
            format!("{}@{name}", if *private { "private " } else { "" })
        }
        OpKind::Func(FuncOp::Call { callee }) => format!("@{callee}"),
        OpKind::Func(FuncOp::Return) => String::new(),
        OpKind::Arith(ArithOp::Constant(lit)) => lit.to_string(),
        OpKind::Arith(_) => String::new(),
        OpKind::Linalg(LinalgOp::Generic(attrs)) => {
            let mut s = format!(
                "{{indexing_maps = [{}], iterator_types = [{}]",
                join_into_string(&attrs.indexing_maps, ", "),
                join_into_string(&attrs.iterator_types, ", ")
            );
            if let Some(call) = &attrs.library_call {
                write!(s, ", library_call = \"{call}\"").unwrap();
            }
            s.push('}');
            s
        }
        OpKind::Linalg(LinalgOp::Transpose { permutation }) => {
            format!("permutation = [{}]", join_into_string(permutation, ", "))
        }
        OpKind::Linalg(_) => String::new(),
        OpKind::MemRef(MemRefOp::SubView(slice)) | OpKind::Tensor(TensorOp::ExtractSlice(slice)) => {
            format!(
                "[{}] [{}] [{}]",
                join_into_string(
                    slice
                        .static_offsets
                        .iter()
                        .map(|o| o.map_or("?".to_string(), |o| o.to_string())),
                    ", "
                ),
                join_into_string(&slice.sizes, ", "),
                join_into_string(&slice.strides, ", ")
            )
        }
        OpKind::MemRef(MemRefOp::CollapseShape { reassociation })
        | OpKind::MemRef(MemRefOp::ExpandShape { reassociation })
        | OpKind::Tensor(TensorOp::CollapseShape { reassociation })
        | OpKind::Tensor(TensorOp::ExpandShape { reassociation }) => format!(
            "[{}]",
            join_into_string(
                reassociation
                    .iter()
                    .map(|g| format!("[{}]", join_into_string(g, ", "))),
                ", "
            )
        ),
        OpKind::MemRef(_) => String::new(),
        OpKind::Tensor(TensorOp::Pack(attrs)) | OpKind::Tensor(TensorOp::Unpack(attrs)) => {
            let mut s = String::new();
            if let Some(perm) = attrs.info.outer_dims_perm() {
                write!(s, "outer_dims_perm = [{}] ", join_into_string(perm, ", ")).unwrap();
            }
            write!(
                s,
                "inner_dims_pos = [{}] inner_tiles = [{}]",
                join_into_string(attrs.info.inner_dims_pos(), ", "),
                join_into_string(attrs.info.inner_tiles(), ", ")
            )
            .unwrap();
            s
        }
        OpKind::Tensor(_) | OpKind::Scf(_) | OpKind::Tpp(_) => String::new(),
        OpKind::Xsmm(op) => op.to_string(),
    }
}

fn print_block(program: &Program, block: BlockId, depth: usize, out: &mut String) {
    let args = program.block_args(block);
    if !args.is_empty() {
        writeln!(
            out,
            "{}^bb({}):",
            indent(depth),
            join_into_string(
                args.iter()
                    .map(|a| format!("{}: {}", value_name(*a), program.value_type(*a))),
                ", "
            )
        )
        .unwrap();
    }
    for op in program.block_ops(block) {
        print_op_into(program, *op, depth + 1, out);
    }
}

fn print_op_into(program: &Program, op: OpId, depth: usize, out: &mut String) {
    let results = program.results(op);
    let kind = program.kind(op);
    out.push_str(&indent(depth));
    if !results.is_empty() {
        write!(
            out,
            "{} = ",
            join_into_string(results.iter().map(|r| value_name(*r)), ", ")
        )
        .unwrap();
    }
    out.push_str(kind.name());
    let attrs = attributes(kind);
    if !attrs.is_empty() {
        write!(out, " {attrs}").unwrap();
    }
    let operands = program.operands(op);
    if !operands.is_empty() {
        write!(
            out,
            " ({}) : {}",
            join_into_string(operands.iter().map(|v| value_name(*v)), ", "),
            join_into_string(operands.iter().map(|v| program.value_type(*v)), ", ")
        )
        .unwrap();
    }
    if !results.is_empty() {
        write!(
            out,
            " -> {}",
            join_into_string(results.iter().map(|v| program.value_type(*v)), ", ")
        )
        .unwrap();
    }
    let regions = program.regions(op);
    if regions.is_empty() {
        out.push('\n');
        return;
    }
    out.push_str(" {\n");
    for region in regions {
        print_block(program, *region, depth, out);
    }
    writeln!(out, "{}}}", indent(depth)).unwrap();
}

/// Prints `op` and everything nested in it.
pub fn print_op(program: &Program, op: OpId) -> String {
    let mut out = String::new();
    print_op_into(program, op, 0, &mut out);
    out
}

pub fn print_program(program: &Program) -> String {
    print_op(program, program.module())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::dialect::{arith, linalg};
    use crate::ir::{Builder, Type};
    use crate::shape;

    #[test]
    fn test_prints_nested_ops() {
        let mut program = Program::new();
        let ty = Type::memref(shape![4, 4], Dtype::Float32);
        let (_, body) = program.add_function("zero", &[ty], &[]);
        let out = program.block_args(body)[0];
        let mut b = Builder::at_end(&mut program, body);
        let zero = arith::constant_float(&mut b, 0.0, Dtype::Float32);
        linalg::fill(&mut b, zero, out);
        let text = print_program(&program);
        assert!(text.starts_with("builtin.module {\n"));
        assert!(text.contains("func.func @zero {"));
        assert!(text.contains("= arith.constant 0e0 -> f32"));
        assert!(text.contains("linalg.fill (%1, %0) : f32, memref<4x4xf32>"));
    }
}
