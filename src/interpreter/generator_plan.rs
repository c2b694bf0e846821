use crate::ast::{Expression, FunctionDecl, Pattern, Statement, VarKind};
use crate::error::UnsupportedShape;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Loop,
    Switch,
    /// A labeled statement that is not a loop; only `break label` targets it.
    Block,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForBinding {
    /// `None` assigns to an existing target instead of declaring.
    pub kind: Option<VarKind>,
    pub pattern: Pattern,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Runs a suspend-free statement through the tree-walking evaluator.
    Evaluate { statement: Statement, next: usize },
    Yield { argument: Option<Expression>, next: usize },
    YieldStar { argument: Expression, next: usize },
    Await { argument: Expression, next: usize },
    /// Writes the value the instance was resumed with; always follows a
    /// suspend instruction.
    StoreResumeValue { slot: Option<String>, next: usize },
    Jump { target: usize },
    Branch {
        condition: Expression,
        on_true: usize,
        on_false: usize,
    },
    EnterTry {
        catch_target: Option<usize>,
        finally_target: Option<usize>,
        next: usize,
    },
    /// Leaves the innermost protected region, running its finally block if
    /// it has one. `close_iterator` applies to for-of frames broken out of.
    ExitTry { next: usize, close_iterator: bool },
    BindCatch { param: Option<Pattern>, next: usize },
    /// End of a finally block: resumes whatever completion was pending.
    EndFinally { next: usize },
    PushScope {
        functions: Vec<FunctionDecl>,
        next: usize,
    },
    PopScope { next: usize },
    /// Replaces the innermost scope with a copy of itself, giving each
    /// iteration of a `for (let ...)` loop its own bindings.
    CopyScope { next: usize },
    EnterLoop {
        labels: Vec<String>,
        kind: LoopKind,
        continue_target: Option<usize>,
        break_target: usize,
        next: usize,
    },
    ExitLoop { next: usize },
    Break { label: Option<String> },
    Continue { label: Option<String> },
    /// Evaluates the iterable, opens its iterator and protects the loop body
    /// with an iterator frame.
    ForOfInit {
        iterable: Expression,
        is_async: bool,
        enumerate_keys: bool,
        next: usize,
    },
    ForOfMoveNext {
        binding: ForBinding,
        body: usize,
        exit: usize,
        is_async: bool,
    },
    Return { argument: Option<Expression> },
    Throw { argument: Expression },
}

impl Instruction {
    pub fn is_suspend(&self) -> bool {
        matches!(
            self,
            Instruction::Yield { .. } | Instruction::YieldStar { .. } | Instruction::Await { .. }
        )
    }

    /// Every instruction index this one can transfer control to.
    pub fn targets(&self) -> Vec<usize> {
        match self {
            Instruction::Evaluate { next, .. }
            | Instruction::Yield { next, .. }
            | Instruction::YieldStar { next, .. }
            | Instruction::Await { next, .. }
            | Instruction::StoreResumeValue { next, .. }
            | Instruction::BindCatch { next, .. }
            | Instruction::EndFinally { next }
            | Instruction::PushScope { next, .. }
            | Instruction::PopScope { next }
            | Instruction::CopyScope { next }
            | Instruction::ExitLoop { next }
            | Instruction::ExitTry { next, .. }
            | Instruction::ForOfInit { next, .. } => vec![*next],
            Instruction::Jump { target } => vec![*target],
            Instruction::Branch {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
            Instruction::EnterTry {
                catch_target,
                finally_target,
                next,
            } => {
                let mut t = vec![*next];
                t.extend(catch_target.iter().chain(finally_target.iter()));
                t
            }
            Instruction::EnterLoop {
                continue_target,
                break_target,
                next,
                ..
            } => {
                let mut t = vec![*next, *break_target];
                t.extend(continue_target.iter());
                t
            }
            Instruction::ForOfMoveNext { body, exit, .. } => vec![*body, *exit],
            Instruction::Break { .. }
            | Instruction::Continue { .. }
            | Instruction::Return { .. }
            | Instruction::Throw { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorPlan {
    pub instructions: Vec<Instruction>,
    pub entry: usize,
    /// Compiler-introduced bindings, declared in the body scope before entry.
    pub slots: Vec<String>,
}

impl GeneratorPlan {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn get(&self, ip: usize) -> Option<&Instruction> {
        self.instructions.get(ip)
    }

    /// Structural checks: every target lands inside the plan and every
    /// suspend point is followed by the store of its resume value.
    pub fn validate(&self) -> Result<(), UnsupportedShape> {
        let len = self.instructions.len();
        if self.entry >= len {
            return Err(UnsupportedShape::new(format!(
                "entry {} out of range for {len} instructions",
                self.entry
            )));
        }
        for (ip, instr) in self.instructions.iter().enumerate() {
            if let Some(bad) = instr.targets().into_iter().find(|&t| t >= len) {
                return Err(UnsupportedShape::new(format!(
                    "instruction {ip} targets {bad}, past the end of the plan"
                )));
            }
            if instr.is_suspend() {
                let next = instr.targets()[0];
                if !matches!(self.instructions[next], Instruction::StoreResumeValue { .. }) {
                    return Err(UnsupportedShape::new(format!(
                        "suspend at {ip} is not followed by a resume store"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn suspend_points(&self) -> usize {
        self.instructions.iter().filter(|i| i.is_suspend()).count()
    }
}

fn brief(stmt: &Statement) -> &'static str {
    match stmt {
        Statement::Empty => "empty",
        Statement::Expression(_) => "expression",
        Statement::Block(_) => "block",
        Statement::Variable(_) => "declaration",
        Statement::If(_) => "if",
        Statement::While(_) => "while",
        Statement::DoWhile(_) => "do-while",
        Statement::For(_) => "for",
        Statement::ForIn(_) => "for-in",
        Statement::ForOf(_) => "for-of",
        Statement::Return(_) => "return",
        Statement::Break(_) => "break",
        Statement::Continue(_) => "continue",
        Statement::Throw(_) => "throw",
        Statement::Try(_) => "try",
        Statement::Switch(_) => "switch",
        Statement::Labeled(..) => "labeled",
        Statement::FunctionDeclaration(_) => "function",
    }
}

fn opt(target: &Option<usize>) -> String {
    target.map_or_else(|| "-".to_string(), |t| t.to_string())
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Evaluate { statement, next } => {
                write!(f, "evaluate {} -> {next}", brief(statement))
            }
            Instruction::Yield { argument, next } => {
                let arg = if argument.is_some() { " <expr>" } else { "" };
                write!(f, "yield{arg} -> {next}")
            }
            Instruction::YieldStar { next, .. } => write!(f, "yield* <expr> -> {next}"),
            Instruction::Await { next, .. } => write!(f, "await <expr> -> {next}"),
            Instruction::StoreResumeValue { slot, next } => match slot {
                Some(s) => write!(f, "store {s} -> {next}"),
                None => write!(f, "discard -> {next}"),
            },
            Instruction::Jump { target } => write!(f, "jump {target}"),
            Instruction::Branch {
                on_true, on_false, ..
            } => write!(f, "branch <cond> ? {on_true} : {on_false}"),
            Instruction::EnterTry {
                catch_target,
                finally_target,
                next,
            } => write!(
                f,
                "enter-try catch={} finally={} -> {next}",
                opt(catch_target),
                opt(finally_target)
            ),
            Instruction::ExitTry {
                next,
                close_iterator,
            } => {
                let close = if *close_iterator { " close" } else { "" };
                write!(f, "exit-try{close} -> {next}")
            }
            Instruction::BindCatch { param, next } => {
                let bind = if param.is_some() { " <pattern>" } else { "" };
                write!(f, "bind-catch{bind} -> {next}")
            }
            Instruction::EndFinally { next } => write!(f, "end-finally -> {next}"),
            Instruction::PushScope { functions, next } => {
                write!(f, "push-scope")?;
                for func in functions {
                    write!(f, " {}", func.name)?;
                }
                write!(f, " -> {next}")
            }
            Instruction::PopScope { next } => write!(f, "pop-scope -> {next}"),
            Instruction::CopyScope { next } => write!(f, "copy-scope -> {next}"),
            Instruction::EnterLoop {
                labels,
                kind,
                continue_target,
                break_target,
                next,
            } => {
                let kind = match kind {
                    LoopKind::Loop => "loop",
                    LoopKind::Switch => "switch",
                    LoopKind::Block => "block",
                };
                write!(f, "enter-{kind}")?;
                for l in labels {
                    write!(f, " {l}:")?;
                }
                write!(
                    f,
                    " continue={} break={break_target} -> {next}",
                    opt(continue_target)
                )
            }
            Instruction::ExitLoop { next } => write!(f, "exit-loop -> {next}"),
            Instruction::Break { label } => match label {
                Some(l) => write!(f, "break {l}"),
                None => write!(f, "break"),
            },
            Instruction::Continue { label } => match label {
                Some(l) => write!(f, "continue {l}"),
                None => write!(f, "continue"),
            },
            Instruction::ForOfInit {
                is_async,
                enumerate_keys,
                next,
                ..
            } => {
                let name = match (enumerate_keys, is_async) {
                    (true, _) => "for-in-init",
                    (false, true) => "for-await-init",
                    (false, false) => "for-of-init",
                };
                write!(f, "{name} -> {next}")
            }
            Instruction::ForOfMoveNext { body, exit, .. } => {
                write!(f, "move-next body={body} exit={exit}")
            }
            Instruction::Return { argument } => {
                let arg = if argument.is_some() { " <expr>" } else { "" };
                write!(f, "return{arg}")
            }
            Instruction::Throw { .. } => write!(f, "throw <expr>"),
        }
    }
}

impl fmt::Display for GeneratorPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "entry {}", self.entry)?;
        if !self.slots.is_empty() {
            writeln!(f, "slots {}", self.slots.join(", "))?;
        }
        for (ip, instr) in self.instructions.iter().enumerate() {
            writeln!(f, "{ip:4}: {instr}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(instructions: Vec<Instruction>, entry: usize) -> GeneratorPlan {
        GeneratorPlan {
            instructions,
            entry,
            slots: Vec::new(),
        }
    }

    #[test]
    fn valid_plan_passes() {
        let p = plan(
            vec![
                Instruction::Return { argument: None },
                Instruction::StoreResumeValue { slot: None, next: 0 },
                Instruction::Yield {
                    argument: Some(Expression::num(1.0)),
                    next: 1,
                },
            ],
            2,
        );
        assert!(p.validate().is_ok());
        assert_eq!(p.suspend_points(), 1);
    }

    #[test]
    fn out_of_range_target_is_rejected() {
        let p = plan(
            vec![
                Instruction::Return { argument: None },
                Instruction::Jump { target: 7 },
            ],
            1,
        );
        let err = p.validate().unwrap_err();
        assert!(err.reason.contains("targets 7"), "{err}");
    }

    #[test]
    fn suspend_without_store_is_rejected() {
        let p = plan(
            vec![
                Instruction::Return { argument: None },
                Instruction::Yield {
                    argument: None,
                    next: 0,
                },
            ],
            1,
        );
        assert!(p.validate().is_err());
    }

    #[test]
    fn disassembly_lists_every_instruction() {
        let p = plan(
            vec![
                Instruction::Return { argument: None },
                Instruction::StoreResumeValue {
                    slot: Some("%resume0".into()),
                    next: 0,
                },
                Instruction::Yield {
                    argument: None,
                    next: 1,
                },
            ],
            2,
        );
        let text = p.to_string();
        assert_eq!(
            text,
            "entry 2\n   0: return\n   1: store %resume0 -> 0\n   2: yield -> 1\n"
        );
    }
}
