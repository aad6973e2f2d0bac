//! The iterative dataflow framework: forward and backward solvers over sets
//! of instructions with a union meet, plus the GEN/KILL builders for the two
//! analyses the optimiser runs (reaching stores, live loads).

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashSet;
use thiserror::Error;

use crate::middle::ir::{BlockId, Function, Instruction, ValueId};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("basic block {0:?} has no terminator")]
    MissingTerminator(BlockId),
    #[error("missing gen/kill sets for block {0:?}")]
    MissingGenKill(BlockId),
}

#[derive(Debug, Default, Clone)]
pub struct GenKill {
    pub gen: BTreeSet<ValueId>,
    pub kill: BTreeSet<ValueId>,
}

/// The fixed point of a dataflow problem: IN and OUT per block
#[derive(Debug)]
pub struct Solution {
    pub inputs: BTreeMap<BlockId, BTreeSet<ValueId>>,
    pub outputs: BTreeMap<BlockId, BTreeSet<ValueId>>,
}

fn successor_map(function: &Function) -> Result<BTreeMap<BlockId, Vec<BlockId>>, AnalysisError> {
    function
        .layout()
        .iter()
        .map(|&block| {
            function
                .successors(block)
                .map(|successors| (block, successors))
                .ok_or(AnalysisError::MissingTerminator(block))
        })
        .collect()
}

fn predecessor_map(
    function: &Function,
) -> Result<BTreeMap<BlockId, BTreeSet<BlockId>>, AnalysisError> {
    let mut predecessors: BTreeMap<BlockId, BTreeSet<BlockId>> = function
        .layout()
        .iter()
        .map(|&block| (block, BTreeSet::new()))
        .collect();

    for (block, successors) in successor_map(function)? {
        for successor in successors {
            predecessors
                .get_mut(&successor)
                .expect("terminator targets a block outside the layout")
                .insert(block);
        }
    }

    Ok(predecessors)
}

/// IN[B] = union of OUT[P] over predecessors P;
/// OUT[B] = GEN[B] ∪ (IN[B] \ KILL[B]).
/// OUT starts at GEN; iterates until no OUT changes.
pub fn solve_forward(
    function: &Function,
    sets: &BTreeMap<BlockId, GenKill>,
) -> Result<Solution, AnalysisError> {
    let predecessors = predecessor_map(function)?;

    let mut inputs: BTreeMap<BlockId, BTreeSet<ValueId>> = BTreeMap::new();
    let mut outputs: BTreeMap<BlockId, BTreeSet<ValueId>> = BTreeMap::new();

    for &block in function.layout() {
        let gen_kill = sets
            .get(&block)
            .ok_or(AnalysisError::MissingGenKill(block))?;

        inputs.insert(block, BTreeSet::new());
        outputs.insert(block, gen_kill.gen.clone());
    }

    loop {
        let mut changed = false;

        for &block in function.layout() {
            let mut input = inputs[&block].clone();

            for predecessor in &predecessors[&block] {
                input.extend(outputs[predecessor].iter().copied());
            }

            inputs.insert(block, input);
        }

        for &block in function.layout() {
            let gen_kill = &sets[&block];

            let output: BTreeSet<ValueId> = gen_kill
                .gen
                .iter()
                .copied()
                .chain(inputs[&block].difference(&gen_kill.kill).copied())
                .collect();

            if output != outputs[&block] {
                outputs.insert(block, output);
                changed = true;
            }
        }

        if !changed {
            return Ok(Solution { inputs, outputs });
        }
    }
}

/// OUT[B] = union of IN[S] over successors S;
/// IN[B] = GEN[B] ∪ (OUT[B] \ KILL[B]).
/// IN starts at GEN; iterates until no IN changes.
pub fn solve_backward(
    function: &Function,
    sets: &BTreeMap<BlockId, GenKill>,
) -> Result<Solution, AnalysisError> {
    let successors = successor_map(function)?;

    let mut inputs: BTreeMap<BlockId, BTreeSet<ValueId>> = BTreeMap::new();
    let mut outputs: BTreeMap<BlockId, BTreeSet<ValueId>> = BTreeMap::new();

    for &block in function.layout() {
        let gen_kill = sets
            .get(&block)
            .ok_or(AnalysisError::MissingGenKill(block))?;

        outputs.insert(block, BTreeSet::new());
        inputs.insert(block, gen_kill.gen.clone());
    }

    loop {
        let mut changed = false;

        for &block in function.layout() {
            let mut output = outputs[&block].clone();

            for successor in &successors[&block] {
                output.extend(inputs[successor].iter().copied());
            }

            outputs.insert(block, output);
        }

        for &block in function.layout() {
            let gen_kill = &sets[&block];

            let input: BTreeSet<ValueId> = gen_kill
                .gen
                .iter()
                .copied()
                .chain(outputs[&block].difference(&gen_kill.kill).copied())
                .collect();

            if input != inputs[&block] {
                inputs.insert(block, input);
                changed = true;
            }
        }

        if !changed {
            return Ok(Solution { inputs, outputs });
        }
    }
}

/// GEN/KILL over `store` instructions for the reaching-definition analysis:
/// GEN keeps the last store per address within the block; KILL holds every
/// store elsewhere in the function to an address this block stores to.
pub fn reaching_store_sets(function: &Function) -> BTreeMap<BlockId, GenKill> {
    let all_stores: Vec<(ValueId, ValueId)> = function
        .layout()
        .iter()
        .flat_map(|&block| function.block(block).instructions.iter().copied())
        .filter_map(|value| match function.instruction(value) {
            Some(Instruction::Store { pointer, .. }) => Some((value, *pointer)),
            _ => None,
        })
        .collect();

    let mut sets = BTreeMap::new();

    for &block in function.layout() {
        let mut gen_kill = GenKill::default();
        let block_stores: HashSet<ValueId> = function
            .block(block)
            .instructions
            .iter()
            .copied()
            .filter(|&v| matches!(function.instruction(v), Some(Instruction::Store { .. })))
            .collect();

        for &value in &function.block(block).instructions {
            let Some(Instruction::Store { pointer, .. }) = function.instruction(value) else {
                continue;
            };

            // Last writer per address wins within the block
            gen_kill
                .gen
                .retain(|&earlier| match function.instruction(earlier) {
                    Some(Instruction::Store {
                        pointer: earlier_pointer,
                        ..
                    }) => earlier_pointer != pointer,
                    _ => true,
                });
            gen_kill.gen.insert(value);

            // Every other store in the function to the same address dies here
            for &(store, target) in &all_stores {
                if target == *pointer && !block_stores.contains(&store) {
                    gen_kill.kill.insert(store);
                }
            }
        }

        sets.insert(block, gen_kill);
    }

    sets
}

/// GEN/KILL over `load` instructions for the live-load (backward) analysis:
/// GEN holds the loads not preceded by a store to their address within the
/// block; KILL holds every load in the function whose address this block
/// stores to.
pub fn live_load_sets(function: &Function) -> BTreeMap<BlockId, GenKill> {
    let all_loads: Vec<(ValueId, ValueId)> = function
        .layout()
        .iter()
        .flat_map(|&block| function.block(block).instructions.iter().copied())
        .filter_map(|value| match function.instruction(value) {
            Some(Instruction::Load { pointer }) => Some((value, *pointer)),
            _ => None,
        })
        .collect();

    let mut sets = BTreeMap::new();

    for &block in function.layout() {
        let mut gen_kill = GenKill::default();
        let mut stored_addresses: HashSet<ValueId> = HashSet::new();

        for &value in &function.block(block).instructions {
            match function.instruction(value) {
                Some(Instruction::Load { pointer }) => {
                    if !stored_addresses.contains(pointer) {
                        gen_kill.gen.insert(value);
                    }
                }
                Some(Instruction::Store { pointer, .. }) => {
                    stored_addresses.insert(*pointer);

                    for &(load, address) in &all_loads {
                        if address == *pointer {
                            gen_kill.kill.insert(load);
                        }
                    }
                }
                _ => {}
            }
        }

        sets.insert(block, gen_kill);
    }

    sets
}
