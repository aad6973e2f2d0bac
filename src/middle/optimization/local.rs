//! The per-block rewrites: common subexpression elimination, dead code
//! elimination, and constant folding. Each pass reports whether it changed
//! anything so the pass manager can drive the pipeline to a fixed point.

use crate::middle::ir::{BinaryOpKind, BlockId, Function, Instruction, ValueId};

/// Replaces the uses of any instruction that repeats an earlier instruction
/// with the same opcode and operands. A repeated load is only merged while no
/// store to its address intervenes. Subsumed instructions are left in place
/// for dead code elimination to collect.
pub fn common_subexpression_elimination(function: &mut Function, block: BlockId) -> bool {
    let mut changed = false;
    let instructions = function.block(block).instructions.clone();

    for (position, &earlier) in instructions.iter().enumerate() {
        let candidate = function.instruction(earlier).cloned().unwrap();

        // Calls, stores, allocas, and terminators are never merged
        if matches!(
            candidate,
            Instruction::Call { .. } | Instruction::Store { .. } | Instruction::Alloca { .. }
        ) || candidate.is_terminator()
        {
            continue;
        }

        let loaded_address = match candidate {
            Instruction::Load { pointer } => Some(pointer),
            _ => None,
        };

        for &later in &instructions[position + 1..] {
            let other = function.instruction(later).cloned().unwrap();

            // A store to the loaded address ends the load's validity
            if let (Some(address), Instruction::Store { pointer, .. }) = (loaded_address, &other) {
                if *pointer == address {
                    break;
                }
            }

            if function.has_uses(later) && other == candidate {
                function.replace_all_uses_with(later, earlier);
                changed = true;
            }
        }
    }

    changed
}

/// Deletes unused instructions. Stores, allocas, calls, and terminators
/// always stay: their effects are not visible through the use-lists.
pub fn dead_code_elimination(function: &mut Function, block: BlockId) -> bool {
    let mut changed = false;
    let mut position = 0;

    while position < function.block(block).instructions.len() {
        let value = function.block(block).instructions[position];
        let instruction = function.instruction(value).unwrap();

        let deletable = !function.has_uses(value)
            && !matches!(
                instruction,
                Instruction::Store { .. } | Instruction::Alloca { .. } | Instruction::Call { .. }
            )
            && !instruction.is_terminator();

        if deletable {
            function.erase_instruction(block, value);
            changed = true;
            // The successor of the last retained instruction has shifted into
            // this position
        } else {
            position += 1;
        }
    }

    changed
}

/// Evaluates `add`/`sub`/`mul` over two constants (two's complement wrap),
/// replaces their uses with the result, and deletes them after the walk
pub fn constant_folding(function: &mut Function, block: BlockId) -> bool {
    let mut changed = false;
    let mut folded: Vec<ValueId> = Vec::new();

    for value in function.block(block).instructions.clone() {
        let Some(Instruction::Binary { op, lhs, rhs }) = function.instruction(value).cloned()
        else {
            continue;
        };

        let (Some(lhs), Some(rhs)) = (function.constant_value(lhs), function.constant_value(rhs))
        else {
            continue;
        };

        let result = match op {
            BinaryOpKind::Add => lhs.wrapping_add(rhs),
            BinaryOpKind::Sub => lhs.wrapping_sub(rhs),
            BinaryOpKind::Mul => lhs.wrapping_mul(rhs),
        };

        let constant = function.constant(result);

        if function.has_uses(value) {
            function.replace_all_uses_with(value, constant);
        }

        folded.push(value);
        changed = true;
    }

    for value in folded {
        function.erase_instruction(block, value);
    }

    changed
}
