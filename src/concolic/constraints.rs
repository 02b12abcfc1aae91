//! Ordered, scoped constraint set over an injected z3 solver.
//!
//! One `ConstraintSet` lives for the duration of a symbolic run;
//! assertions accumulate monotonically. `with_scope` provides the
//! transactional trial mode used by the concretization loop and by
//! reachability checks: hypothetical assertions are pushed, checked, and
//! discarded without touching the parent set.

use z3::ast::{Ast, Bool, BV};
use z3::{Context, SatResult, Solver};

pub struct ConstraintSet<'ctx> {
    ctx: &'ctx Context,
    solver: Solver<'ctx>,
}

impl<'ctx> ConstraintSet<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Self {
        ConstraintSet {
            ctx,
            solver: Solver::new(ctx),
        }
    }

    pub fn ctx(&self) -> &'ctx Context {
        self.ctx
    }

    /// Adds an assertion to the set. Assertions are never removed except
    /// by leaving a scope opened with [`ConstraintSet::with_scope`].
    pub fn assert(&self, constraint: &Bool<'ctx>) {
        self.solver.assert(constraint);
    }

    pub fn check(&self) -> SatResult {
        self.solver.check()
    }

    /// Runs `f` inside a nested solver scope; everything asserted inside
    /// is discarded afterwards.
    pub fn with_scope<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        self.solver.push();
        let result = f(self);
        self.solver.pop(1);
        result
    }

    /// Whether the set stays satisfiable under a hypothetical assertion.
    pub fn is_feasible(&self, hypothesis: &Bool<'ctx>) -> bool {
        self.with_scope(|scope| {
            scope.assert(hypothesis);
            scope.check() == SatResult::Sat
        })
    }

    /// Enumerates up to `limit` concrete values the expression can take
    /// under the accumulated assertions, by the model-then-exclude loop.
    /// Enumeration happens inside a scope, so the exclusions do not leak.
    pub fn get_all_values(&self, expr: &BV<'ctx>, limit: usize) -> Vec<u64> {
        self.with_scope(|scope| {
            let mut values = Vec::new();
            while values.len() < limit {
                match scope.solver.check() {
                    SatResult::Sat => {
                        let model = match scope.solver.get_model() {
                            Some(model) => model,
                            None => break,
                        };
                        let value = match model.eval(expr, true).and_then(|bv| bv.as_u64()) {
                            Some(value) => value,
                            None => break,
                        };
                        values.push(value);
                        let excluded =
                            expr._eq(&BV::from_u64(scope.ctx, value, expr.get_size())).not();
                        scope.solver.assert(&excluded);
                    }
                    _ => break,
                }
            }
            values
        })
    }
}

impl std::fmt::Debug for ConstraintSet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstraintSet").finish_non_exhaustive()
    }
}
