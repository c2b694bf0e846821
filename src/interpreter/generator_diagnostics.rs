use super::generator_analysis::analyze_generator_body;
use super::generator_builder::build_plan;
use super::generator_plan::GeneratorPlan;
use super::*;
use crate::error::UnsupportedShape;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanFailure {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanDiagnostics {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<PlanFailure>,
}

impl PlanDiagnostics {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

impl Interpreter {
    /// The plan for `body`, built on first request. Closures created from one
    /// definition share the body allocation and therefore the plan.
    pub(crate) fn plan_for(
        &mut self,
        body: &Rc<[Statement]>,
        params: &[Pattern],
        name: &str,
        kind: FunctionKind,
    ) -> Result<Rc<GeneratorPlan>, UnsupportedShape> {
        let key = Rc::as_ptr(body).cast::<Statement>() as usize;
        if let Some(cached) = self.plan_cache.get(&key)
            && Rc::ptr_eq(&cached.body, body)
        {
            return Ok(cached.plan.clone());
        }
        self.diagnostics.attempted += 1;
        match build_plan(body, params, kind.is_async()) {
            Ok(plan) => {
                let analysis = analyze_generator_body(body, kind.is_async());
                debug!(
                    function = name,
                    ?kind,
                    instructions = plan.len(),
                    suspend_points = plan.suspend_points(),
                    ?analysis,
                    "built generator plan"
                );
                self.diagnostics.succeeded += 1;
                let plan = Rc::new(plan);
                self.plan_cache.insert(
                    key,
                    CachedPlan {
                        body: body.clone(),
                        name: name.to_string(),
                        plan: plan.clone(),
                    },
                );
                Ok(plan)
            }
            Err(e) => {
                warn!(function = name, reason = %e.reason, "generator plan rejected");
                self.diagnostics.failures.push(PlanFailure {
                    name: name.to_string(),
                    reason: e.reason.clone(),
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expression as E, FunctionExpr, Statement as S};
    use pretty_assertions::assert_eq;

    #[test]
    fn closures_from_one_definition_share_a_plan() {
        let mut interp = Interpreter::new();
        let make = E::function(FunctionExpr::plain(
            &[],
            vec![S::return_(Some(E::function(FunctionExpr::generator(
                &[],
                vec![S::expr(E::yield_(E::num(1.0)))],
            ))))],
        ));
        interp.run(&[
            S::const_("make", make),
            S::const_("a", E::call(E::ident("make"), vec![])),
            S::const_("b", E::call(E::ident("make"), vec![])),
        ]);
        assert_eq!(
            interp.diagnostics(),
            &PlanDiagnostics {
                attempted: 1,
                succeeded: 1,
                failures: Vec::new(),
            }
        );
        assert_eq!(interp.plans().len(), 1);
    }

    #[test]
    fn rejected_bodies_are_recorded_with_their_reason() {
        let mut interp = Interpreter::new();
        interp.run(&[S::FunctionDeclaration(FunctionDecl {
            name: "bad".to_string(),
            params: Vec::new(),
            body: Rc::from(vec![S::expr(E::binary(
                BinaryOp::Add,
                E::yield_(E::num(1.0)),
                E::yield_(E::num(2.0)),
            ))]),
            is_async: false,
            is_generator: true,
        })]);
        let diagnostics = interp.diagnostics();
        assert_eq!(diagnostics.attempted, 1);
        assert_eq!(diagnostics.succeeded, 0);
        assert_eq!(diagnostics.failed(), 1);
        assert_eq!(diagnostics.failures[0].name, "bad");
    }

    #[test]
    fn plain_functions_never_build_plans() {
        let mut interp = Interpreter::new();
        interp.run(&[S::const_(
            "f",
            E::function(FunctionExpr::plain(&[], vec![S::return_(Some(E::num(1.0)))])),
        )]);
        assert_eq!(interp.diagnostics(), &PlanDiagnostics::default());
    }
}
