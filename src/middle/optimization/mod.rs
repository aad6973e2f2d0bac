//! The optimisation pipeline. Each round runs common subexpression
//! elimination and dead code elimination over every block, drives constant
//! propagation and constant folding to their own fixed point, then runs
//! dead-store elimination; rounds repeat until one of them changes nothing.

use thiserror::Error;

use crate::{
    frontend::intern::InternedSymbol,
    middle::ir::{Function, Module},
};

pub mod dataflow;
pub mod global;
pub mod local;

pub use dataflow::AnalysisError;

#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error("function `{0}` has no basic blocks")]
    EmptyFunction(InternedSymbol),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

pub fn optimize_module(module: &mut Module) -> Result<bool, OptimizeError> {
    optimize_function(&mut module.function)
}

/// Runs the pipeline to a fixed point. Returns whether any pass changed the
/// function at all.
pub fn optimize_function(function: &mut Function) -> Result<bool, OptimizeError> {
    if function.layout().is_empty() {
        return Err(OptimizeError::EmptyFunction(function.name));
    }

    let mut changed_ever = false;
    let mut iteration = 0usize;

    loop {
        let mut changed = false;

        for block in function.layout().to_vec() {
            changed |= local::common_subexpression_elimination(function, block);
        }

        for block in function.layout().to_vec() {
            changed |= local::dead_code_elimination(function, block);
        }

        // Propagation exposes folds and folds expose propagations, so the two
        // iterate together until stable
        loop {
            let mut inner_changed = global::constant_propagation(function)?;

            for block in function.layout().to_vec() {
                inner_changed |= local::constant_folding(function, block);
            }

            if !inner_changed {
                break;
            }

            changed = true;
        }

        changed |= global::dead_store_elimination(function)?;

        iteration += 1;
        log::debug!(
            "optimisation iteration {iteration} on `{}`: {}",
            function.name,
            if changed { "changed" } else { "stable" }
        );

        if !changed {
            return Ok(changed_ever);
        }

        changed_ever = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{parser::Parser, sema, SourceFile};
    use crate::middle::{
        ir::{ast_lowering::build_module, pretty_print::print_module, BlockId, Instruction},
        resolve::resolve_variables,
    };

    fn compile(source: &str) -> Module {
        let source = SourceFile::in_memory(source);
        let program = Parser::parse_program(Box::leak(Box::new(source)));

        sema::analyze_program(&program).expect("test program is semantically valid");

        let resolved = resolve_variables(&program.function).unwrap();
        let mut module = build_module(&program, &resolved).unwrap();

        optimize_module(&mut module).unwrap();

        module
    }

    fn count_in_block(
        function: &Function,
        block: BlockId,
        predicate: impl Fn(&Instruction) -> bool,
    ) -> usize {
        function
            .block(block)
            .instructions
            .iter()
            .filter(|&&v| predicate(function.instruction(v).unwrap()))
            .count()
    }

    fn count_everywhere(function: &Function, predicate: impl Fn(&Instruction) -> bool) -> usize {
        function
            .layout()
            .iter()
            .map(|&b| count_in_block(function, b, &predicate))
            .sum()
    }

    #[test]
    fn trivial_constant_return() {
        let module = compile("int main() { return 7; }");
        let printed = print_module(&module);

        assert!(printed.contains("ret i32 7"));

        // Everything but the (protected) return-slot alloca and the control
        // flow is gone
        let function = &module.function;
        assert_eq!(
            count_everywhere(function, |i| matches!(i, Instruction::Alloca { .. })),
            1
        );
        assert_eq!(
            count_everywhere(function, |i| matches!(
                i,
                Instruction::Load { .. } | Instruction::Store { .. }
            )),
            0
        );
    }

    #[test]
    fn constant_propagates_through_a_variable() {
        let module = compile("int main() { int x; x = 5; return x + 2; }");
        let printed = print_module(&module);

        assert!(printed.contains("ret i32 7"));
        assert!(!printed.contains("load"));
        assert!(!printed.contains("store"));
        assert!(!printed.contains("add"));
    }

    #[test]
    fn cse_reuses_a_repeated_product() {
        let module = compile("int foo(int a) { int x; x = a * a + a * a; return x; }");
        let function = &module.function;

        assert_eq!(
            count_everywhere(function, |i| matches!(
                i,
                Instruction::Binary {
                    op: crate::middle::ir::BinaryOpKind::Mul,
                    ..
                }
            )),
            1
        );

        // One load of a feeds the multiply; the only other load reads x back
        // for the return
        let entry = function.entry_block();
        assert_eq!(
            count_in_block(function, entry, |i| matches!(i, Instruction::Load { .. })),
            2
        );
    }

    #[test]
    fn differing_branch_constants_are_not_folded() {
        let module = compile(
            "int foo(int a) { int x; if (a > 0) x = 1; else x = 2; return x; }",
        );
        let function = &module.function;
        let printed = print_module(&module);

        // The diamond survives: one comparison, one conditional branch, both
        // stores, and the join's load
        assert!(printed.contains("icmp sgt"));
        assert_eq!(
            count_everywhere(function, |i| matches!(i, Instruction::CondBranch { .. })),
            1
        );
        assert!(printed.contains("store i32 1"));
        assert!(printed.contains("store i32 2"));

        // The load of x at the join was not replaced by a constant
        let layout = function.layout();
        let join = layout[layout.len() - 2];
        assert_eq!(
            count_in_block(function, join, |i| matches!(i, Instruction::Load { .. })),
            1
        );
    }

    #[test]
    fn loop_carried_state_stays_in_memory() {
        let module = compile(
            "int foo(int n) { int i; int s; i = 0; s = 0; \
             while (i < n) { s = s + i; i = i + 1; } return s; }",
        );
        let function = &module.function;

        // entry, cond, body, exit, return
        assert_eq!(function.layout().len(), 5);

        let layout = function.layout().to_vec();
        let (cond, body) = (layout[1], layout[2]);

        // The loop still runs through memory: two stores in the body, and
        // CSE collapsed the two body loads of i into one
        assert_eq!(
            count_in_block(function, body, |i| matches!(i, Instruction::Store { .. })),
            2
        );
        assert_eq!(
            count_in_block(function, body, |i| matches!(i, Instruction::Load { .. })),
            2
        );

        // The condition still loads both i and n
        assert_eq!(
            count_in_block(function, cond, |i| matches!(i, Instruction::Load { .. })),
            2
        );
    }

    #[test]
    fn dead_variables_disappear_entirely() {
        let module = compile("int main() { int x; int y; x = 3; y = 4; return x; }");
        let printed = print_module(&module);

        assert!(printed.contains("ret i32 3"));
        assert!(!printed.contains("store"));
        assert!(!printed.contains("load"));
    }

    #[test]
    fn the_pipeline_is_a_fixed_point() {
        let source = "extern int read();\n\
                      extern void print(int);\n\
                      int foo(int n) { int i; int s; i = 0; s = 0; \
                      while (i < n) { s = s + i * i; i = i + 1; print(s); } \
                      if (s > 100) s = 100; else s = s - 1; return s; }";

        let source_file = SourceFile::in_memory(source);
        let program = Parser::parse_program(Box::leak(Box::new(source_file)));
        sema::analyze_program(&program).expect("test program is semantically valid");
        let resolved = resolve_variables(&program.function).unwrap();
        let mut module = build_module(&program, &resolved).unwrap();

        optimize_module(&mut module).unwrap();
        let first = print_module(&module);

        // A second full run finds nothing to do and changes nothing
        assert!(!optimize_module(&mut module).unwrap());
        assert_eq!(print_module(&module), first);
    }

    #[test]
    fn optimizing_an_empty_function_is_an_error() {
        use crate::frontend::intern::InternedSymbol;

        let mut function = Function::new(InternedSymbol::new("empty"));

        assert!(matches!(
            optimize_function(&mut function),
            Err(OptimizeError::EmptyFunction(_))
        ));
    }

    #[test]
    fn pipeline_postconditions_hold() {
        let module = compile(
            "extern int read();\n\
             extern void print(int);\n\
             int foo(int a) { int x; int y; x = a * a + a * a; y = 2 + 3; \
             if (x > y) { y = x; } else { y = read(); } \
             while (y > 0) { print(y); y = y - 1; } return y; }",
        );
        let function = &module.function;

        for &block in function.layout() {
            let instructions = function.block(block).instructions.clone();

            for (position, &value) in instructions.iter().enumerate() {
                let instruction = function.instruction(value).unwrap();

                // Every remaining non-store, non-alloca, non-call,
                // non-terminator instruction has at least one use
                if !matches!(
                    instruction,
                    Instruction::Store { .. }
                        | Instruction::Alloca { .. }
                        | Instruction::Call { .. }
                ) && !instruction.is_terminator()
                {
                    assert!(
                        function.has_uses(value),
                        "dead instruction survived: {instruction:?}"
                    );
                }

                // No arithmetic over two constants survives
                if let Instruction::Binary { lhs, rhs, .. } = instruction {
                    assert!(
                        function.constant_value(*lhs).is_none()
                            || function.constant_value(*rhs).is_none(),
                        "foldable instruction survived: {instruction:?}"
                    );
                }

                // No redundant pair survives within the block
                for &later in &instructions[position + 1..] {
                    let other = function.instruction(later).unwrap();

                    if matches!(
                        instruction,
                        Instruction::Binary { .. } | Instruction::Icmp { .. }
                    ) {
                        assert_ne!(instruction, other, "common subexpression survived");
                    }

                    if let (
                        Instruction::Load { pointer },
                        Instruction::Load {
                            pointer: later_pointer,
                        },
                    ) = (instruction, other)
                    {
                        if pointer == later_pointer {
                            let store_between = instructions
                                [position + 1..]
                                .iter()
                                .take_while(|&&v| v != later)
                                .any(|&v| {
                                    matches!(
                                        function.instruction(v),
                                        Some(Instruction::Store { pointer: address, .. })
                                            if address == pointer
                                    )
                                });

                            assert!(store_between, "redundant load survived");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn branches_on_read_input_survive() {
        let module = compile(
            "extern int read();\n\
             extern void print(int);\n\
             int main() { int x; x = read(); if (x == 0) print(1); return 0; }",
        );
        let function = &module.function;

        // The call, the branch, and the store of the read result all survive
        assert_eq!(
            count_everywhere(function, |i| matches!(i, Instruction::Call { .. })),
            2
        );
        assert_eq!(
            count_everywhere(function, |i| matches!(i, Instruction::CondBranch { .. })),
            1
        );
    }
}
