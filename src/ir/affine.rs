//! Affine expressions and maps used as indexing maps of structured operations.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::ops::{Add, Mul};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum AffineExpr {
    Dim(u32),
    Symbol(u32),
    Constant(i64),
    Add(Box<AffineExpr>, Box<AffineExpr>),
    Mul(Box<AffineExpr>, Box<AffineExpr>),
    FloorDiv(Box<AffineExpr>, Box<AffineExpr>),
    Mod(Box<AffineExpr>, Box<AffineExpr>),
}

/// A map from `num_dims` loop dimensions (and `num_symbols` symbols) to a list of results.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct AffineMap {
    num_dims: u32,
    num_symbols: u32,
    results: Vec<AffineExpr>,
}

/// A sum of dimension and symbol terms with integer coefficients plus a constant.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
struct LinearForm {
    dims: BTreeMap<u32, i64>,
    symbols: BTreeMap<u32, i64>,
    constant: i64,
}

pub fn d(pos: u32) -> AffineExpr {
    AffineExpr::Dim(pos)
}

pub fn c(value: i64) -> AffineExpr {
    AffineExpr::Constant(value)
}

impl AffineExpr {
    pub fn as_dim(&self) -> Option<u32> {
        match self {
            AffineExpr::Dim(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<i64> {
        match self {
            AffineExpr::Constant(v) => Some(*v),
            _ => None,
        }
    }

    pub fn floor_div(self, rhs: i64) -> AffineExpr {
        AffineExpr::FloorDiv(Box::new(self), Box::new(c(rhs)))
    }

    pub fn modulo(self, rhs: i64) -> AffineExpr {
        AffineExpr::Mod(Box::new(self), Box::new(c(rhs)))
    }

    /// Returns `true` if dimension `pos` occurs anywhere in the expression.
    pub fn involves_dim(&self, pos: u32) -> bool {
        match self {
            AffineExpr::Dim(p) => *p == pos,
            AffineExpr::Symbol(_) | AffineExpr::Constant(_) => false,
            AffineExpr::Add(l, r)
            | AffineExpr::Mul(l, r)
            | AffineExpr::FloorDiv(l, r)
            | AffineExpr::Mod(l, r) => l.involves_dim(pos) || r.involves_dim(pos),
        }
    }

    pub fn max_dim(&self) -> Option<u32> {
        match self {
            AffineExpr::Dim(p) => Some(*p),
            AffineExpr::Symbol(_) | AffineExpr::Constant(_) => None,
            AffineExpr::Add(l, r)
            | AffineExpr::Mul(l, r)
            | AffineExpr::FloorDiv(l, r)
            | AffineExpr::Mod(l, r) => l.max_dim().max(r.max_dim()),
        }
    }

    /// Replaces every dimension with the expression returned by `f`.
    pub fn replace_dims(&self, f: &impl Fn(u32) -> AffineExpr) -> AffineExpr {
        match self {
            AffineExpr::Dim(p) => f(*p),
            AffineExpr::Symbol(_) | AffineExpr::Constant(_) => self.clone(),
            AffineExpr::Add(l, r) => l.replace_dims(f) + r.replace_dims(f),
            AffineExpr::Mul(l, r) => l.replace_dims(f) * r.replace_dims(f),
            AffineExpr::FloorDiv(l, r) => {
                AffineExpr::FloorDiv(Box::new(l.replace_dims(f)), Box::new(r.replace_dims(f)))
            }
            AffineExpr::Mod(l, r) => {
                AffineExpr::Mod(Box::new(l.replace_dims(f)), Box::new(r.replace_dims(f)))
            }
        }
    }

    /// Evaluates the expression at a point.
    pub fn eval(&self, dims: &[i64], symbols: &[i64]) -> i64 {
        match self {
            AffineExpr::Dim(p) => dims[*p as usize],
            AffineExpr::Symbol(p) => symbols[*p as usize],
            AffineExpr::Constant(v) => *v,
            AffineExpr::Add(l, r) => l.eval(dims, symbols) + r.eval(dims, symbols),
            AffineExpr::Mul(l, r) => l.eval(dims, symbols) * r.eval(dims, symbols),
            AffineExpr::FloorDiv(l, r) => l.eval(dims, symbols).div_euclid(r.eval(dims, symbols)),
            AffineExpr::Mod(l, r) => l.eval(dims, symbols).rem_euclid(r.eval(dims, symbols)),
        }
    }

    fn linear_form(&self) -> Option<LinearForm> {
        match self {
            AffineExpr::Dim(p) => Some(LinearForm {
                dims: BTreeMap::from([(*p, 1)]),
                ..Default::default()
            }),
            AffineExpr::Symbol(p) => Some(LinearForm {
                symbols: BTreeMap::from([(*p, 1)]),
                ..Default::default()
            }),
            AffineExpr::Constant(v) => Some(LinearForm {
                constant: *v,
                ..Default::default()
            }),
            AffineExpr::Add(l, r) => {
                let mut lhs = l.linear_form()?;
                let rhs = r.linear_form()?;
                for (k, v) in rhs.dims {
                    *lhs.dims.entry(k).or_default() += v;
                }
                for (k, v) in rhs.symbols {
                    *lhs.symbols.entry(k).or_default() += v;
                }
                lhs.constant += rhs.constant;
                lhs.dims.retain(|_, v| *v != 0);
                lhs.symbols.retain(|_, v| *v != 0);
                Some(lhs)
            }
            AffineExpr::Mul(l, r) => {
                let (lhs, rhs) = (l.linear_form()?, r.linear_form()?);
                let (scale, mut form) = if lhs.dims.is_empty() && lhs.symbols.is_empty() {
                    (lhs.constant, rhs)
                } else if rhs.dims.is_empty() && rhs.symbols.is_empty() {
                    (rhs.constant, lhs)
                } else {
                    return None;
                };
                form.dims.values_mut().for_each(|v| *v *= scale);
                form.symbols.values_mut().for_each(|v| *v *= scale);
                form.constant *= scale;
                form.dims.retain(|_, v| *v != 0);
                form.symbols.retain(|_, v| *v != 0);
                Some(form)
            }
            AffineExpr::FloorDiv(..) | AffineExpr::Mod(..) => None,
        }
    }

    /// Returns `true` if both expressions denote the same function.
    ///
    /// Purely affine expressions are compared in linear form, so operand order and constant
    /// folding do not matter. Other expressions are compared structurally.
    pub fn equivalent(&self, other: &AffineExpr) -> bool {
        match (self.linear_form(), other.linear_form()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl Add for AffineExpr {
    type Output = AffineExpr;

    fn add(self, rhs: AffineExpr) -> AffineExpr {
        match (&self, &rhs) {
            (AffineExpr::Constant(a), AffineExpr::Constant(b)) => c(a + b),
            (_, AffineExpr::Constant(0)) => self,
            (AffineExpr::Constant(0), _) => rhs,
            _ => AffineExpr::Add(Box::new(self), Box::new(rhs)),
        }
    }
}

impl Add<i64> for AffineExpr {
    type Output = AffineExpr;

    fn add(self, rhs: i64) -> AffineExpr {
        self + c(rhs)
    }
}

impl Mul for AffineExpr {
    type Output = AffineExpr;

    fn mul(self, rhs: AffineExpr) -> AffineExpr {
        match (&self, &rhs) {
            (AffineExpr::Constant(a), AffineExpr::Constant(b)) => c(a * b),
            (_, AffineExpr::Constant(1)) => self,
            (AffineExpr::Constant(1), _) => rhs,
            (_, AffineExpr::Constant(0)) | (AffineExpr::Constant(0), _) => c(0),
            _ => AffineExpr::Mul(Box::new(self), Box::new(rhs)),
        }
    }
}

impl Mul<i64> for AffineExpr {
    type Output = AffineExpr;

    fn mul(self, rhs: i64) -> AffineExpr {
        self * c(rhs)
    }
}

impl AffineMap {
    pub fn new(num_dims: u32, num_symbols: u32, results: Vec<AffineExpr>) -> AffineMap {
        debug_assert!(results
            .iter()
            .all(|r| r.max_dim().map(|m| m < num_dims).unwrap_or(true)));
        AffineMap {
            num_dims,
            num_symbols,
            results,
        }
    }

    pub fn identity(num_dims: u32) -> AffineMap {
        AffineMap::new(num_dims, 0, (0..num_dims).map(d).collect())
    }

    pub fn permutation(perm: &[u32]) -> AffineMap {
        AffineMap::new(
            u32::try_from(perm.len()).unwrap_or(u32::MAX),
            0,
            perm.iter().copied().map(d).collect(),
        )
    }

    /// The map selecting the trailing `num_results` dimensions.
    pub fn minor_identity(num_dims: u32, num_results: u32) -> AffineMap {
        debug_assert!(num_results <= num_dims);
        AffineMap::new(num_dims, 0, (num_dims - num_results..num_dims).map(d).collect())
    }

    /// Infers one map per expression list, all sharing the smallest dimension count covering
    /// every expression.
    pub fn infer_from_expr_list(lists: &[Vec<AffineExpr>]) -> Vec<AffineMap> {
        let num_dims = lists
            .iter()
            .flatten()
            .filter_map(AffineExpr::max_dim)
            .max()
            .map(|m| m + 1)
            .unwrap_or(0);
        lists
            .iter()
            .map(|results| AffineMap::new(num_dims, 0, results.clone()))
            .collect()
    }

    #[inline]
    pub fn num_dims(&self) -> u32 {
        self.num_dims
    }

    #[inline]
    pub fn num_symbols(&self) -> u32 {
        self.num_symbols
    }

    #[inline]
    pub fn num_results(&self) -> usize {
        self.results.len()
    }

    #[inline]
    pub fn results(&self) -> &[AffineExpr] {
        &self.results
    }

    pub fn result(&self, idx: usize) -> &AffineExpr {
        &self.results[idx]
    }

    pub fn is_identity(&self) -> bool {
        self.results.len() == self.num_dims as usize
            && self
                .results
                .iter()
                .enumerate()
                .all(|(i, r)| r.as_dim() == Some(i as u32))
    }

    pub fn is_permutation(&self) -> bool {
        self.results.len() == self.num_dims as usize && self.is_projected_permutation(false)
    }

    /// Returns `true` if every result is a distinct dimension (or, optionally, the constant zero).
    pub fn is_projected_permutation(&self, allow_zero_in_results: bool) -> bool {
        if self.num_symbols > 0 || self.results.len() > self.num_dims as usize {
            return false;
        }
        let mut seen = vec![false; self.num_dims as usize];
        for r in &self.results {
            match r {
                AffineExpr::Dim(p) => {
                    let slot = &mut seen[*p as usize];
                    if *slot {
                        return false;
                    }
                    *slot = true;
                }
                AffineExpr::Constant(0) if allow_zero_in_results => {}
                _ => return false,
            }
        }
        true
    }

    /// Returns `true` if the map is a minor identity where some results may be replaced by the
    /// constant zero. The positions of those zero results are appended to `broadcasted_dims`.
    pub fn is_minor_identity_with_broadcasting(&self, broadcasted_dims: &mut Vec<u32>) -> bool {
        if (self.num_dims as usize) < self.results.len() {
            return false;
        }
        let suffix_start = self.num_dims as usize - self.results.len();
        for (res_idx, expr) in self.results.iter().enumerate() {
            match expr {
                AffineExpr::Constant(0) => broadcasted_dims.push(res_idx as u32),
                AffineExpr::Constant(_) => return false,
                AffineExpr::Dim(p) if *p as usize == suffix_start + res_idx => {}
                _ => return false,
            }
        }
        true
    }

    pub fn insert_result(&self, expr: AffineExpr, pos: usize) -> AffineMap {
        let mut results = self.results.clone();
        results.insert(pos, expr);
        AffineMap::new(self.num_dims, self.num_symbols, results)
    }

    /// Dimension positions in result order, if every result is a plain dimension.
    pub fn result_dims(&self) -> Option<Vec<u32>> {
        self.results.iter().map(AffineExpr::as_dim).collect()
    }

    pub fn is_function_of_dim(&self, pos: u32) -> bool {
        self.results.iter().any(|r| r.involves_dim(pos))
    }

    /// Rewrites the map over a new dimension space.
    pub fn replace_dims(&self, new_num_dims: u32, f: impl Fn(u32) -> AffineExpr) -> AffineMap {
        AffineMap::new(
            new_num_dims,
            self.num_symbols,
            self.results.iter().map(|r| r.replace_dims(&f)).collect(),
        )
    }

    /// Builds a map from the same dimension space with only the results at `positions`.
    pub fn select_results(&self, positions: &[usize]) -> AffineMap {
        AffineMap::new(
            self.num_dims,
            self.num_symbols,
            positions.iter().map(|&p| self.results[p].clone()).collect(),
        )
    }

    pub fn eval(&self, dims: &[i64]) -> Vec<i64> {
        self.results.iter().map(|r| r.eval(dims, &[])).collect()
    }

    /// Returns `true` if both maps have the same arity and equivalent results.
    pub fn equivalent(&self, other: &AffineMap) -> bool {
        self.num_dims == other.num_dims
            && self.num_symbols == other.num_symbols
            && self.results.len() == other.results.len()
            && self
                .results
                .iter()
                .zip(&other.results)
                .all(|(a, b)| a.equivalent(b))
    }
}

impl Display for AffineExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffineExpr::Dim(p) => write!(f, "d{p}"),
            AffineExpr::Symbol(p) => write!(f, "s{p}"),
            AffineExpr::Constant(v) => write!(f, "{v}"),
            AffineExpr::Add(l, r) => write!(f, "{l} + {r}"),
            AffineExpr::Mul(l, r) => write!(f, "({l}) * ({r})"),
            AffineExpr::FloorDiv(l, r) => write!(f, "({l}) floordiv ({r})"),
            AffineExpr::Mod(l, r) => write!(f, "({l}) mod ({r})"),
        }
    }
}

impl Display for AffineMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", (0..self.num_dims).map(|i| format!("d{i}")).join(", "))?;
        if self.num_symbols > 0 {
            write!(
                f,
                "[{}]",
                (0..self.num_symbols).map(|i| format!("s{i}")).join(", ")
            )?;
        }
        write!(f, " -> ({})", self.results.iter().join(", "))
    }
}
