//! The per-function rewrites: constant propagation over the reaching-store
//! analysis, and dead-store elimination over the live-load analysis.

use std::collections::BTreeSet;

use crate::middle::{
    ir::{BlockId, Function, Instruction, ValueId},
    optimization::dataflow::{
        live_load_sets, reaching_store_sets, solve_backward, solve_forward, AnalysisError,
    },
};

/// Replaces a load whose every reaching store writes the same compile-time
/// constant with that constant. Replaced loads are deleted after the walk.
pub fn constant_propagation(function: &mut Function) -> Result<bool, AnalysisError> {
    let sets = reaching_store_sets(function);
    let solution = solve_forward(function, &sets)?;

    let mut changed = false;
    let mut deletions: Vec<(BlockId, ValueId)> = Vec::new();

    for block in function.layout().to_vec() {
        // R starts as the stores reaching the block entry and tracks the
        // most recent writers while walking the block
        let mut reaching: BTreeSet<ValueId> = solution.inputs[&block].clone();

        for value in function.block(block).instructions.clone() {
            match function.instruction(value).cloned() {
                Some(Instruction::Store { pointer, .. }) => {
                    reaching.retain(|&store| !stores_to(function, store, pointer));
                    reaching.insert(value);
                }
                Some(Instruction::Load { pointer }) => {
                    let stores: Vec<ValueId> = reaching
                        .iter()
                        .copied()
                        .filter(|&store| stores_to(function, store, pointer))
                        .collect();

                    let Some(constant) = common_stored_constant(function, &stores) else {
                        continue;
                    };

                    let replacement = function.constant(constant);

                    if function.has_uses(value) {
                        function.replace_all_uses_with(value, replacement);
                    }

                    deletions.push((block, value));
                    changed = true;
                }
                _ => {}
            }
        }
    }

    for (block, value) in deletions {
        function.erase_instruction(block, value);
    }

    Ok(changed)
}

fn stores_to(function: &Function, store: ValueId, address: ValueId) -> bool {
    matches!(
        function.instruction(store),
        Some(Instruction::Store { pointer, .. }) if *pointer == address
    )
}

/// The single constant written by every store in the set, if there is one
fn common_stored_constant(function: &Function, stores: &[ValueId]) -> Option<i32> {
    let mut common = None;

    if stores.is_empty() {
        return None;
    }

    for &store in stores {
        let Some(Instruction::Store { value, .. }) = function.instruction(store) else {
            unreachable!("reaching sets only hold stores");
        };

        let constant = function.constant_value(*value)?;

        match common {
            None => common = Some(constant),
            Some(seen) if seen == constant => {}
            Some(_) => return None,
        }
    }

    common
}

/// Deletes a store when the value it writes can never be read: no later load
/// of the address within the block and no live load of it at the block exit
pub fn dead_store_elimination(function: &mut Function) -> Result<bool, AnalysisError> {
    let sets = live_load_sets(function);
    let solution = solve_backward(function, &sets)?;

    let mut changed = false;
    let mut deletions: Vec<(BlockId, ValueId)> = Vec::new();

    for block in function.layout().to_vec() {
        let instructions = function.block(block).instructions.clone();

        for (position, &value) in instructions.iter().enumerate() {
            let Some(Instruction::Store { pointer, .. }) = function.instruction(value).cloned()
            else {
                continue;
            };

            let future_in_block = instructions[position + 1..].iter().any(|&later| {
                matches!(
                    function.instruction(later),
                    Some(Instruction::Load { pointer: address }) if *address == pointer
                )
            });

            let future_after_block = solution.outputs[&block]
                .iter()
                .any(|&load| matches!(
                    function.instruction(load),
                    Some(Instruction::Load { pointer: address }) if *address == pointer
                ));

            if !future_in_block && !future_after_block {
                deletions.push((block, value));
                changed = true;
            }
        }
    }

    for (block, value) in deletions {
        function.erase_instruction(block, value);
    }

    Ok(changed)
}
