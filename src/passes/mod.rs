//! Lowering passes and the machinery that runs them.

pub mod canonicalize;
pub mod greedy;
pub mod hoist;
pub mod kernel_info;
pub mod linalg_to_tpp;
pub mod linalg_to_xsmm;
pub mod pipeline;
pub mod tpp_to_loops;
pub mod tpp_to_xsmm;
pub mod xsmm_to_func;

pub use greedy::{apply_patterns_greedily, GreedyConfig, RewritePattern};
pub use pipeline::{default_pipeline, TppPipelineOptions};

use crate::ir::verify::{verify, Diagnostic};
use crate::ir::Program;

use auto_impl::auto_impl;
use log::{info, warn};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PassError {
    #[error("Pattern rewriting did not converge after {iterations} iterations ({rewrites} rewrites)")]
    DidNotConverge { iterations: usize, rewrites: usize },
    #[error("Verification failed after {pass} with {} diagnostic(s)", .diagnostics.len())]
    VerificationFailed {
        pass: &'static str,
        diagnostics: Vec<Diagnostic>,
    },
}

/// A transformation over a whole program.
#[auto_impl(&, Box)]
pub trait Pass {
    fn name(&self) -> &'static str;

    /// Runs the pass and returns the number of rewrites it performed.
    fn run(&self, program: &mut Program) -> Result<usize, PassError>;
}

/// Runs passes in order, optionally verifying the program after each.
#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
    pub verify_each: bool,
    pub fail_on_diagnostics: bool,
    diagnostics: Vec<Diagnostic>,
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pass: impl Pass + 'static) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Diagnostics collected by the last [PassManager::run].
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Runs every pass, returning the total number of rewrites.
    pub fn run(&mut self, program: &mut Program) -> Result<usize, PassError> {
        self.diagnostics.clear();
        let mut total = 0;
        for pass in &self.passes {
            info!("Running {}", pass.name());
            let rewrites = pass.run(program)?;
            info!("{} performed {rewrites} rewrite(s)", pass.name());
            total += rewrites;
            if !self.verify_each {
                continue;
            }
            let diagnostics = verify(program);
            if diagnostics.is_empty() {
                continue;
            }
            for diagnostic in &diagnostics {
                warn!("After {}: {diagnostic}", pass.name());
            }
            if self.fail_on_diagnostics {
                return Err(PassError::VerificationFailed {
                    pass: pass.name(),
                    diagnostics,
                });
            }
            self.diagnostics.extend(diagnostics);
        }
        Ok(total)
    }
}
