use crate::matchers::ZeroSearch;
use crate::passes::canonicalize::Canonicalize;
use crate::passes::hoist::HoistXsmmDispatch;
use crate::passes::linalg_to_tpp::{ConvertLinalgToTpp, MapLinalgToTpp};
use crate::passes::linalg_to_xsmm::ConvertLinalgToXsmm;
use crate::passes::tpp_to_loops::ConvertTppToLoops;
use crate::passes::tpp_to_xsmm::ConvertTppToXsmm;
use crate::passes::xsmm_to_func::ConvertXsmmToFunc;
use crate::passes::{GreedyConfig, PassManager};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TppPipelineOptions {
    /// Expand tpp ops into loops instead of kernel calls.
    pub lower_to_loops: bool,
    pub hoist_dispatch: bool,
    pub to_func_calls: bool,
    pub verify_each: bool,
    pub fail_on_diagnostics: bool,
    pub zero: ZeroSearch,
    pub greedy: GreedyConfig,
}

impl Default for TppPipelineOptions {
    fn default() -> Self {
        TppPipelineOptions {
            lower_to_loops: false,
            hoist_dispatch: true,
            to_func_calls: true,
            verify_each: true,
            fail_on_diagnostics: false,
            zero: ZeroSearch::default(),
            greedy: GreedyConfig::default(),
        }
    }
}

/// Tags and converts linalg ops to tpp, then lowers tpp to kernel calls (or loops) and cleans up.
pub fn default_pipeline(options: &TppPipelineOptions) -> PassManager {
    let mut pm = PassManager::new();
    pm.verify_each = options.verify_each;
    pm.fail_on_diagnostics = options.fail_on_diagnostics;
    let greedy = options.greedy.clone();
    let mut tag = MapLinalgToTpp::default();
    tag.zero = options.zero;
    tag.greedy = greedy.clone();
    pm.add(tag);
    let mut convert = ConvertLinalgToTpp::default();
    convert.zero = options.zero;
    convert.greedy = greedy.clone();
    pm.add(convert);
    if options.lower_to_loops {
        pm.add(ConvertTppToLoops {
            greedy: greedy.clone(),
        });
    } else {
        pm.add(ConvertLinalgToXsmm {
            zero: options.zero,
            greedy: greedy.clone(),
        });
        pm.add(ConvertTppToXsmm {
            greedy: greedy.clone(),
        });
        if options.hoist_dispatch {
            pm.add(HoistXsmmDispatch);
        }
        if options.to_func_calls {
            pm.add(ConvertXsmmToFunc {
                greedy: greedy.clone(),
            });
        }
    }
    pm.add(Canonicalize { greedy });
    pm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::dialect::arith::{self, ArithOp};
    use crate::dialect::func::FuncOp;
    use crate::dialect::linalg::{self, IteratorType};
    use crate::ir::affine::{c, d, AffineMap};
    use crate::ir::{Builder, OpKind, Program, Type};
    use crate::shape;

    /// `C = relu(A * B)` on buffers, starting from a zero fill of `C`.
    fn matmul_relu() -> Program {
        let mut program = Program::new();
        let m = |s| Type::memref(s, Dtype::Float32);
        let (_, body) = program.add_function(
            "mlp",
            &[m(shape![32, 64]), m(shape![64, 16]), m(shape![32, 16])],
            &[],
        );
        let a = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        let zero = arith::constant_float(&mut b, 0.0, Dtype::Float32);
        linalg::fill(&mut b, zero, a[2]);
        linalg::generic(
            &mut b,
            &a[0..2],
            &a[2..3],
            linalg::matmul_maps(),
            linalg::matmul_iterators(),
            |b, x| {
                let p = arith::binary(b, ArithOp::MulF, x[0], x[1]);
                let s = arith::binary(b, ArithOp::AddF, x[2], p);
                linalg::yield_(b, &[s]);
            },
        );
        linalg::generic(
            &mut b,
            &[],
            &a[2..3],
            vec![AffineMap::identity(2)],
            vec![IteratorType::Parallel; 2],
            |b, x| {
                let r = arith::binary(b, ArithOp::MaxF, x[0], zero);
                linalg::yield_(b, &[r]);
            },
        );
        program
    }

    fn op_names(program: &Program) -> Vec<&'static str> {
        program
            .walk(program.module())
            .into_iter()
            .map(|op| program.kind(op).name())
            .collect()
    }

    fn callees(program: &Program) -> Vec<String> {
        program
            .walk(program.module())
            .into_iter()
            .filter_map(|op| match program.kind(op) {
                OpKind::Func(FuncOp::Call { callee }) => Some(callee.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_default_pipeline_pass_order() {
        let pm = default_pipeline(&TppPipelineOptions::default());
        assert_eq!(
            pm.pass_names(),
            vec![
                "map-linalg-to-tpp",
                "convert-linalg-to-tpp",
                "convert-linalg-to-xsmm",
                "convert-tpp-to-xsmm",
                "hoist-xsmm-dispatch",
                "convert-xsmm-to-func",
                "canonicalize",
            ]
        );
        let loops = default_pipeline(&TppPipelineOptions {
            lower_to_loops: true,
            ..Default::default()
        });
        assert_eq!(
            loops.pass_names(),
            vec![
                "map-linalg-to-tpp",
                "convert-linalg-to-tpp",
                "convert-tpp-to-loops",
                "canonicalize",
            ]
        );
    }

    #[test]
    fn test_non_shape_broadcast_stays_in_linalg() {
        let mut program = Program::new();
        let m = Type::memref(shape![4, 8], Dtype::Float32);
        let (_, body) = program.add_function("f", &[m.clone(), m.clone(), m], &[]);
        let a = program.block_args(body).to_vec();
        let mut b = Builder::at_end(&mut program, body);
        // Reads column 0 of a full 4x8 buffer; the kernel would see no broadcast.
        linalg::generic(
            &mut b,
            &a[0..2],
            &a[2..3],
            vec![
                AffineMap::new(2, 0, vec![d(0), c(0)]),
                AffineMap::identity(2),
                AffineMap::identity(2),
            ],
            vec![IteratorType::Parallel; 2],
            |b, x| {
                let s = arith::binary(b, ArithOp::AddF, x[0], x[1]);
                linalg::yield_(b, &[s]);
            },
        );
        let mut pm = default_pipeline(&TppPipelineOptions::default());
        pm.run(&mut program).unwrap();
        assert!(op_names(&program).contains(&"linalg.generic"));
        assert!(callees(&program).is_empty());
    }

    #[test]
    fn test_matmul_relu_to_runtime_calls() {
        let mut program = matmul_relu();
        let mut pm = default_pipeline(&TppPipelineOptions {
            fail_on_diagnostics: true,
            ..Default::default()
        });
        pm.run(&mut program).unwrap();
        let names = op_names(&program);
        assert!(!names
            .iter()
            .any(|n| n.starts_with("linalg.") || n.starts_with("tpp.") || n.starts_with("xsmm.")));
        assert_eq!(
            callees(&program),
            vec![
                "xsmm_unary_dispatch",
                "xsmm_unary_invoke",
                "xsmm_gemm_dispatch",
                "xsmm_gemm_invoke",
                "xsmm_unary_dispatch",
                "xsmm_unary_invoke",
            ]
        );
        assert!(pm.diagnostics().is_empty());
    }

    #[test]
    fn test_matmul_relu_to_loops() {
        let mut program = matmul_relu();
        let mut pm = default_pipeline(&TppPipelineOptions {
            lower_to_loops: true,
            fail_on_diagnostics: true,
            ..Default::default()
        });
        pm.run(&mut program).unwrap();
        let names = op_names(&program);
        assert!(!names.iter().any(|n| n.starts_with("tpp.")));
        // The fill has no tpp form and stays.
        assert_eq!(names.iter().filter(|n| **n == "linalg.fill").count(), 1);
        assert_eq!(names.iter().filter(|n| **n == "scf.for").count(), 5);
        assert!(callees(&program).is_empty());
    }

    #[test]
    fn test_options_round_trip_through_bincode() {
        let options = TppPipelineOptions {
            lower_to_loops: true,
            zero: ZeroSearch { max_depth: 1 },
            ..Default::default()
        };
        let bytes = bincode::serialize(&options).unwrap();
        let decoded: TppPipelineOptions = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, options);
    }
}
