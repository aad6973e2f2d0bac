//! Lowers the resolved AST into the block-structured IR. The lowering context
//! keeps an implicit cursor (the block new instructions are appended to);
//! structured control flow turns into explicit conditional branches between
//! blocks that are always inserted just before the dedicated return block.

use thiserror::Error;

use crate::{
    frontend::{
        ast::{
            BinaryOperatorKind, ComparisonOperatorKind, Expression, ExpressionKind,
            FunctionDefinition, Identifier, Program, Statement, StatementKind, UnaryOperatorKind,
        },
        intern::InternedSymbol,
    },
    index::IndexVec,
    middle::{
        ir::{
            BinaryOpKind, BlockId, ExternFunction, ExternId, Function, IcmpPredicate, Instruction,
            Module, StackSlot, Type, ValueId,
        },
        resolve::ResolvedVariables,
    },
};

pub const TARGET_TRIPLE: &str = "x86_64-pc-linux-gnu";

#[derive(Debug, Error)]
pub enum IRBuildError {
    #[error("call to undeclared extern function `{0}`")]
    UndeclaredExtern(InternedSymbol),
    #[error("`{0}` returns no value but is used where one is required")]
    VoidValueUsed(InternedSymbol),
    #[error("variable `{0}` has no resolution")]
    MissingResolution(InternedSymbol),
    #[error("unexpected AST shape: {0}")]
    MalformedAst(&'static str),
}

pub fn build_module(
    program: &Program,
    resolved: &ResolvedVariables,
) -> Result<Module, IRBuildError> {
    let mut externs = IndexVec::new();

    for declaration in &program.externs {
        externs.push(ExternFunction {
            name: declaration.name.symbol,
            parameters: if declaration.has_parameter {
                vec![Type::I32]
            } else {
                Vec::new()
            },
            return_type: if declaration.returns_value {
                Type::I32
            } else {
                Type::Void
            },
        });
    }

    let function = lower_function(&program.function, resolved, &externs)?;

    Ok(Module {
        target_triple: TARGET_TRIPLE,
        externs,
        function,
    })
}

fn lower_function(
    definition: &FunctionDefinition,
    resolved: &ResolvedVariables,
    externs: &IndexVec<ExternId, ExternFunction>,
) -> Result<Function, IRBuildError> {
    let mut function = Function::new(definition.name.symbol);

    let entry_block = function.append_block();
    let return_block = function.append_block();

    // One stack cell per variable, laid out in declaration order, then the
    // return slot
    for variable in resolved.variables.indices() {
        let slot = function.append_instruction(
            entry_block,
            Instruction::Alloca {
                slot: StackSlot::Variable(variable),
            },
        );
        function.variable_slots.insert(variable, slot);
    }

    let return_slot = function.append_instruction(
        entry_block,
        Instruction::Alloca {
            slot: StackSlot::Return,
        },
    );
    function.return_slot = Some(return_slot);

    if let Some(parameter_variable) = resolved.parameter {
        let parameter = function.create_parameter();
        let pointer = function.variable_slots[&parameter_variable];
        function.append_instruction(
            entry_block,
            Instruction::Store {
                value: parameter,
                pointer,
            },
        );
    }

    let mut lowering = FunctionLowering {
        externs,
        resolved,
        function,
        cursor: entry_block,
        return_block,
        return_slot,
    };

    lowering.lower_block_statements(&definition.body.statements)?;

    let mut function = lowering.function;

    // Whatever still falls off the end flows into the return block
    for block in function.layout().to_vec() {
        if block != return_block && !function.is_terminated(block) {
            function.append_instruction(
                block,
                Instruction::Branch {
                    target: return_block,
                },
            );
        }
    }

    let value = function.append_instruction(
        return_block,
        Instruction::Load {
            pointer: return_slot,
        },
    );
    function.append_instruction(return_block, Instruction::Return { value });

    Ok(function)
}

struct FunctionLowering<'a> {
    externs: &'a IndexVec<ExternId, ExternFunction>,
    resolved: &'a ResolvedVariables,
    function: Function,
    cursor: BlockId,
    return_block: BlockId,
    return_slot: ValueId,
}

impl<'a> FunctionLowering<'a> {
    /// New blocks always land immediately before the return block, which
    /// therefore stays last in the layout
    fn create_block(&mut self) -> BlockId {
        self.function.insert_block_before(self.return_block)
    }

    fn append(&mut self, instruction: Instruction) -> ValueId {
        self.function.append_instruction(self.cursor, instruction)
    }

    /// Instructions must never be appended past a terminator. If control flow
    /// already left the cursor block, trailing (unreachable) statements get a
    /// fresh block of their own.
    fn ensure_cursor(&mut self) {
        if self.function.is_terminated(self.cursor) {
            self.cursor = self.create_block();
        }
    }

    fn slot_for(&self, name: &Identifier) -> Result<ValueId, IRBuildError> {
        let variable = self
            .resolved
            .resolution_map
            .get(&name.id)
            .ok_or(IRBuildError::MissingResolution(name.symbol))?;

        Ok(self.function.variable_slots[variable])
    }

    fn lower_block_statements(&mut self, statements: &[Statement]) -> Result<(), IRBuildError> {
        for statement in statements {
            self.lower_statement(statement)?;

            // Nothing after a return is emitted for this statement list
            if matches!(statement.kind, StatementKind::Return(_)) {
                break;
            }
        }

        Ok(())
    }

    fn lower_statement(&mut self, statement: &Statement) -> Result<(), IRBuildError> {
        match &statement.kind {
            // The stack cell was already emitted in the prologue
            StatementKind::Declaration(_) => {}
            StatementKind::Assignment { target, value } => {
                self.ensure_cursor();

                let value = self.lower_expression(value)?;
                let pointer = self.slot_for(target)?;
                self.append(Instruction::Store { value, pointer });
            }
            StatementKind::Block(block) => self.lower_block_statements(&block.statements)?,
            StatementKind::Return(expression) => {
                self.ensure_cursor();

                let value = self.lower_expression(expression)?;
                self.append(Instruction::Store {
                    value,
                    pointer: self.return_slot,
                });
                self.append(Instruction::Branch {
                    target: self.return_block,
                });
            }
            StatementKind::If {
                condition,
                positive,
                negative,
            } => self.lower_if(condition, positive, negative.as_deref())?,
            StatementKind::While { condition, body } => self.lower_while(condition, body)?,
            StatementKind::Call(expression) => {
                self.ensure_cursor();

                let ExpressionKind::Call { callee, argument } = &expression.kind else {
                    return Err(IRBuildError::MalformedAst(
                        "call statement does not hold a call expression",
                    ));
                };

                // Any produced value is discarded
                self.lower_call(callee, argument.as_deref())?;
            }
        }

        Ok(())
    }

    fn lower_if(
        &mut self,
        condition: &Expression,
        positive: &Statement,
        negative: Option<&Statement>,
    ) -> Result<(), IRBuildError> {
        let current = self.cursor;

        // An empty current block serves as the condition block directly;
        // otherwise a new one is linked in (unless the current block already
        // left, in which case the condition is unreachable dead code)
        let condition_block = if self.function.block(current).instructions.is_empty() {
            current
        } else {
            let block = self.create_block();

            if !self.function.is_terminated(current) {
                self.function
                    .append_instruction(current, Instruction::Branch { target: block });
            }

            block
        };

        self.cursor = condition_block;
        let condition_value = self.lower_expression(condition)?;

        let positive_block = self.create_block();
        self.cursor = positive_block;
        self.lower_statement(positive)?;
        let positive_end = self.cursor;
        let positive_falls_through = !self.function.is_terminated(positive_end);

        let mut negative_block = None;
        let mut negative_end = None;
        let mut negative_falls_through = false;

        if let Some(negative) = negative {
            let block = self.create_block();
            negative_block = Some(block);

            self.cursor = block;
            self.lower_statement(negative)?;
            negative_end = Some(self.cursor);
            negative_falls_through = !self.function.is_terminated(self.cursor);
        }

        // The join exists unless both arms already left the function
        let join_needed = negative_block.is_none() || positive_falls_through || negative_falls_through;
        let join_block = join_needed.then(|| self.create_block());

        if positive_falls_through {
            self.function.append_instruction(
                positive_end,
                Instruction::Branch {
                    target: join_block.unwrap(),
                },
            );
        }

        if negative_falls_through {
            self.function.append_instruction(
                negative_end.unwrap(),
                Instruction::Branch {
                    target: join_block.unwrap(),
                },
            );
        }

        self.function.append_instruction(
            condition_block,
            Instruction::CondBranch {
                condition: condition_value,
                positive: positive_block,
                negative: negative_block.or(join_block).unwrap(),
            },
        );

        self.cursor = match join_block {
            Some(join) => join,
            // Both arms returned. Park the cursor on the (terminated) block
            // just before the return block; trailing statements will get a
            // fresh block from ensure_cursor
            None => {
                let layout = self.function.layout();
                layout[layout.len() - 2]
            }
        };

        Ok(())
    }

    fn lower_while(
        &mut self,
        condition: &Expression,
        body: &Statement,
    ) -> Result<(), IRBuildError> {
        let current = self.cursor;

        let condition_block = if self.function.block(current).instructions.is_empty() {
            current
        } else {
            let block = self.create_block();

            if !self.function.is_terminated(current) {
                self.function
                    .append_instruction(current, Instruction::Branch { target: block });
            }

            block
        };

        self.cursor = condition_block;
        let condition_value = self.lower_expression(condition)?;

        let body_block = self.create_block();
        self.cursor = body_block;
        self.lower_statement(body)?;
        let body_end = self.cursor;

        // The backedge only exists if the body can fall through
        if !self.function.is_terminated(body_end) {
            self.function.append_instruction(
                body_end,
                Instruction::Branch {
                    target: condition_block,
                },
            );
        }

        let exit_block = self.create_block();

        self.function.append_instruction(
            condition_block,
            Instruction::CondBranch {
                condition: condition_value,
                positive: body_block,
                negative: exit_block,
            },
        );

        self.cursor = exit_block;

        Ok(())
    }

    fn lower_expression(&mut self, expression: &Expression) -> Result<ValueId, IRBuildError> {
        match &expression.kind {
            ExpressionKind::Constant(value) => Ok(self.function.constant(*value)),
            ExpressionKind::Variable(name) => {
                let pointer = self.slot_for(name)?;

                Ok(self.append(Instruction::Load { pointer }))
            }
            ExpressionKind::Unary {
                operator: UnaryOperatorKind::Minus,
                operand,
            } => {
                // -e is emitted as `sub 0, e`
                let zero = self.function.constant(0);
                let operand = self.lower_expression(operand)?;

                Ok(self.append(Instruction::Binary {
                    op: BinaryOpKind::Sub,
                    lhs: zero,
                    rhs: operand,
                }))
            }
            ExpressionKind::Binary { operator, lhs, rhs } => {
                let lhs = self.lower_expression(lhs)?;
                let rhs = self.lower_expression(rhs)?;

                let op = match operator {
                    BinaryOperatorKind::Add => BinaryOpKind::Add,
                    BinaryOperatorKind::Subtract => BinaryOpKind::Sub,
                    BinaryOperatorKind::Multiply => BinaryOpKind::Mul,
                };

                Ok(self.append(Instruction::Binary { op, lhs, rhs }))
            }
            ExpressionKind::Comparison { operator, lhs, rhs } => {
                let lhs = self.lower_expression(lhs)?;
                let rhs = self.lower_expression(rhs)?;

                let predicate = match operator {
                    ComparisonOperatorKind::Equal => IcmpPredicate::Eq,
                    ComparisonOperatorKind::NotEqual => IcmpPredicate::Ne,
                    ComparisonOperatorKind::LessThan => IcmpPredicate::Slt,
                    ComparisonOperatorKind::LessThanOrEqual => IcmpPredicate::Sle,
                    ComparisonOperatorKind::GreaterThan => IcmpPredicate::Sgt,
                    ComparisonOperatorKind::GreaterThanOrEqual => IcmpPredicate::Sge,
                };

                Ok(self.append(Instruction::Icmp {
                    predicate,
                    lhs,
                    rhs,
                }))
            }
            ExpressionKind::Call { callee, argument } => {
                let value = self.lower_call(callee, argument.as_deref())?;

                value.ok_or(IRBuildError::VoidValueUsed(callee.symbol))
            }
        }
    }

    /// Shared by call statements and call expressions; returns the produced
    /// value, or `None` for calls to void functions
    fn lower_call(
        &mut self,
        callee: &Identifier,
        argument: Option<&Expression>,
    ) -> Result<Option<ValueId>, IRBuildError> {
        let extern_id = self
            .externs
            .enumerate()
            .find(|(_, e)| e.name == callee.symbol)
            .map(|(id, _)| id)
            .ok_or(IRBuildError::UndeclaredExtern(callee.symbol))?;

        let argument = argument
            .map(|argument| self.lower_expression(argument))
            .transpose()?;

        let call = self.append(Instruction::Call {
            callee: extern_id,
            argument,
        });

        if self.externs[extern_id].return_type == Type::Void {
            Ok(None)
        } else {
            Ok(Some(call))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{parser::Parser, sema, SourceFile};
    use crate::middle::resolve::resolve_variables;

    fn lower(source: &str) -> Module {
        let source = SourceFile::in_memory(source);
        let program = Parser::parse_program(Box::leak(Box::new(source)));

        sema::analyze_program(&program).expect("test program is semantically valid");

        let resolved = resolve_variables(&program.function).unwrap();

        build_module(&program, &resolved).unwrap()
    }

    fn block_instructions<'m>(function: &'m Function, block: BlockId) -> Vec<&'m Instruction> {
        function
            .block(block)
            .instructions
            .iter()
            .map(|&v| function.instruction(v).unwrap())
            .collect()
    }

    #[test]
    fn trivial_return_uses_the_return_slot() {
        let module = lower("int main() { return 7; }");
        let function = &module.function;

        assert_eq!(function.layout().len(), 2);

        let entry = function.entry_block();
        let instructions = block_instructions(function, entry);

        assert!(matches!(
            instructions[0],
            Instruction::Alloca {
                slot: StackSlot::Return
            }
        ));
        assert!(matches!(instructions[1], Instruction::Store { .. }));
        assert!(matches!(instructions[2], Instruction::Branch { .. }));
        assert_eq!(instructions.len(), 3);

        let return_block = *function.layout().last().unwrap();
        let instructions = block_instructions(function, return_block);

        assert!(matches!(instructions[0], Instruction::Load { .. }));
        assert!(matches!(instructions[1], Instruction::Return { .. }));
    }

    #[test]
    fn allocas_are_laid_out_in_declaration_order() {
        let module = lower("int foo(int a) { int x; { int y; } return a; }");
        let function = &module.function;

        let entry = function.entry_block();
        let instructions = block_instructions(function, entry);

        let slots: Vec<&Instruction> = instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Alloca { .. }))
            .copied()
            .collect();

        // a, x, y, then the return slot
        assert_eq!(slots.len(), 4);

        for (index, slot) in slots.iter().take(3).enumerate() {
            let Instruction::Alloca {
                slot: StackSlot::Variable(variable),
            } = slot
            else {
                panic!("expected a variable alloca");
            };

            assert_eq!(crate::index::Index::index(*variable), index);
        }

        assert!(matches!(
            slots[3],
            Instruction::Alloca {
                slot: StackSlot::Return
            }
        ));

        // The parameter is spilled right after the allocas
        assert!(matches!(instructions[4], Instruction::Store { .. }));
    }

    #[test]
    fn if_else_builds_a_diamond() {
        let module = lower("int foo(int a) { int x; if (a > 0) x = 1; else x = 2; return x; }");
        let function = &module.function;

        // entry, cond, then, else, join, return
        assert_eq!(function.layout().len(), 6);

        let layout = function.layout().to_vec();
        let (entry, cond, positive, negative, join, ret) =
            (layout[0], layout[1], layout[2], layout[3], layout[4], layout[5]);

        assert_eq!(function.successors(entry), Some(vec![cond]));
        assert_eq!(function.successors(cond), Some(vec![positive, negative]));
        assert_eq!(function.successors(positive), Some(vec![join]));
        assert_eq!(function.successors(negative), Some(vec![join]));
        assert_eq!(function.successors(join), Some(vec![ret]));
        assert_eq!(function.successors(ret), Some(vec![]));

        let instructions = block_instructions(function, cond);
        assert!(matches!(
            instructions[1],
            Instruction::Icmp {
                predicate: IcmpPredicate::Sgt,
                ..
            }
        ));
    }

    #[test]
    fn if_without_else_branches_to_the_join() {
        let module = lower("int foo(int a) { int x; x = 0; if (a > 0) x = 1; return x; }");
        let function = &module.function;

        // entry, cond, then, join, return
        assert_eq!(function.layout().len(), 5);

        let layout = function.layout().to_vec();
        let (cond, positive, join) = (layout[1], layout[2], layout[3]);

        assert_eq!(function.successors(cond), Some(vec![positive, join]));
        assert_eq!(function.successors(positive), Some(vec![join]));
    }

    #[test]
    fn while_builds_a_backedge() {
        let module = lower(
            "int foo(int n) { int i; int s; i = 0; s = 0; \
             while (i < n) { s = s + i; i = i + 1; } return s; }",
        );
        let function = &module.function;

        // entry, cond, body, exit, return
        assert_eq!(function.layout().len(), 5);

        let layout = function.layout().to_vec();
        let (entry, cond, body, exit, ret) = (layout[0], layout[1], layout[2], layout[3], layout[4]);

        assert_eq!(function.successors(entry), Some(vec![cond]));
        assert_eq!(function.successors(cond), Some(vec![body, exit]));
        assert_eq!(function.successors(body), Some(vec![cond]));
        assert_eq!(function.successors(exit), Some(vec![ret]));
    }

    #[test]
    fn while_body_that_always_returns_does_not_corrupt_the_return_block() {
        let module = lower("int foo(int n) { while (n > 0) { return 1; } return 0; }");
        let function = &module.function;

        // entry, cond, body, exit, return. The exit block is materialised
        // even though the body never falls through: the trailing `return 0`
        // must not share a block with the function epilogue
        assert_eq!(function.layout().len(), 5);

        let layout = function.layout().to_vec();
        let (cond, body, exit, ret) = (layout[1], layout[2], layout[3], layout[4]);

        // No backedge: the body leaves straight for the return block, and
        // the condition's false edge lands on the exit, not the return block
        assert_eq!(function.successors(cond), Some(vec![body, exit]));
        assert_eq!(function.successors(body), Some(vec![ret]));
        assert_eq!(function.successors(exit), Some(vec![ret]));

        // The trailing return landed in the exit block
        let instructions = block_instructions(function, exit);
        assert!(matches!(instructions[0], Instruction::Store { .. }));
        assert!(matches!(instructions[1], Instruction::Branch { .. }));

        // The epilogue is intact: the return block holds exactly its load
        // and ret
        let instructions = block_instructions(function, ret);
        assert_eq!(instructions.len(), 2);
        assert!(matches!(instructions[0], Instruction::Load { .. }));
        assert!(matches!(instructions[1], Instruction::Return { .. }));
    }

    #[test]
    fn both_arms_returning_skips_the_join() {
        let module = lower("int foo(int a) { if (a > 0) return 1; else return 2; }");
        let function = &module.function;

        // entry, cond, then, else, return; no join
        assert_eq!(function.layout().len(), 5);

        let layout = function.layout().to_vec();
        let (positive, negative, ret) = (layout[2], layout[3], layout[4]);

        assert_eq!(function.successors(positive), Some(vec![ret]));
        assert_eq!(function.successors(negative), Some(vec![ret]));

        // Every block is terminated
        for block in function.layout() {
            assert!(function.is_terminated(*block));
        }
    }

    #[test]
    fn trailing_statements_after_a_returning_if_get_their_own_block() {
        let module = lower("int foo(int a) { if (a > 0) return 1; else return 2; a = 3; }");
        let function = &module.function;

        // entry, cond, then, else, trailing, return
        assert_eq!(function.layout().len(), 6);

        let trailing = function.layout()[4];
        let instructions = block_instructions(function, trailing);

        assert!(matches!(instructions[0], Instruction::Store { .. }));
        assert!(matches!(instructions[1], Instruction::Branch { .. }));

        // Nothing branches to the trailing block
        let predecessors = function.predecessors().unwrap();
        assert!(predecessors[&trailing].is_empty());
    }

    #[test]
    fn statements_after_a_return_are_dropped() {
        let module = lower("int main() { return 1; return 2; }");
        let function = &module.function;

        assert_eq!(function.layout().len(), 2);

        let entry = function.entry_block();
        let stores: Vec<&Instruction> = block_instructions(function, entry)
            .into_iter()
            .filter(|i| matches!(i, Instruction::Store { .. }))
            .collect();

        assert_eq!(stores.len(), 1);
    }

    #[test]
    fn unary_minus_subtracts_from_zero() {
        let module = lower("int main() { return -5; }");
        let function = &module.function;

        let entry = function.entry_block();
        let instructions = block_instructions(function, entry);

        let Instruction::Binary { op, lhs, rhs } = instructions[1] else {
            panic!("expected the negation");
        };

        assert_eq!(*op, BinaryOpKind::Sub);
        assert_eq!(function.constant_value(*lhs), Some(0));
        assert_eq!(function.constant_value(*rhs), Some(5));
    }

    #[test]
    fn calls_lower_through_one_path() {
        let module = lower(
            "extern int read();\n\
             extern void print(int);\n\
             int main() { int x; x = read(); print(x + 1); return 0; }",
        );
        let function = &module.function;

        let entry = function.entry_block();
        let instructions = block_instructions(function, entry);

        let calls: Vec<&Instruction> = instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Call { .. }))
            .copied()
            .collect();

        assert_eq!(calls.len(), 2);

        let Instruction::Call {
            callee: read_id,
            argument: None,
        } = calls[0]
        else {
            panic!("expected the read call to take no argument");
        };
        assert_eq!(module.externs[*read_id].name.value(), "read");

        let Instruction::Call {
            callee: print_id,
            argument: Some(_),
        } = calls[1]
        else {
            panic!("expected the print call to take an argument");
        };
        assert_eq!(module.externs[*print_id].name.value(), "print");
    }

    #[test]
    fn falling_off_the_end_still_returns() {
        let module = lower("int main() { int x; x = 1; }");
        let function = &module.function;

        assert_eq!(function.layout().len(), 2);

        for block in function.layout() {
            assert!(function.is_terminated(*block));
        }
    }
}
