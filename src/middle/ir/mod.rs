//! The IR: a module holding one user function lowered into basic blocks of
//! three-address instructions. Every source variable gets an explicit stack
//! cell (`alloca`) in the entry block; all values that cross block boundaries
//! do so through memory, so non-loop edges never carry SSA values.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;

use crate::{
    frontend::intern::InternedSymbol,
    index::{simple_index, IndexVec},
    middle::resolve::VarId,
};

pub mod ast_lowering;
pub mod pretty_print;

simple_index! {
    /// Identifies a value in a function's value arena
    pub struct ValueId;
}

simple_index! {
    /// Identifies a basic block; stable across rewrites
    pub struct BlockId;
}

simple_index! {
    /// Identifies an extern function declaration in the module
    pub struct ExternId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    I1,
    I32,
    Ptr,
    Void,
}

#[derive(Debug)]
pub struct Module {
    pub target_triple: &'static str,
    pub externs: IndexVec<ExternId, ExternFunction>,
    pub function: Function,
}

#[derive(Debug)]
pub struct ExternFunction {
    pub name: InternedSymbol,
    pub parameters: Vec<Type>,
    pub return_type: Type,
}

/// A value: either a constant, the function parameter, or the result of an
/// instruction. Instructions that produce nothing (stores, branches, calls to
/// void functions) still occupy a value slot so they have stable identity.
#[derive(Debug)]
pub struct Value {
    pub kind: ValueKind,
    /// The instructions consuming this value, one entry per using operand
    uses: Vec<ValueId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    Constant(i32),
    Parameter,
    Instruction(Instruction),
}

/// Which stack cell an `alloca` reserves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSlot {
    Variable(VarId),
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BinaryOpKind {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum IcmpPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Reserves an i32 stack cell; appears only in the entry block
    Alloca { slot: StackSlot },
    Load {
        pointer: ValueId,
    },
    Store {
        value: ValueId,
        pointer: ValueId,
    },
    Binary {
        op: BinaryOpKind,
        lhs: ValueId,
        rhs: ValueId,
    },
    Icmp {
        predicate: IcmpPredicate,
        lhs: ValueId,
        rhs: ValueId,
    },
    Call {
        callee: ExternId,
        argument: Option<ValueId>,
    },
    Branch {
        target: BlockId,
    },
    CondBranch {
        condition: ValueId,
        positive: BlockId,
        negative: BlockId,
    },
    Return {
        value: ValueId,
    },
}

impl Instruction {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Branch { .. } | Instruction::CondBranch { .. } | Instruction::Return { .. }
        )
    }

    /// The value operands, in operand order. Block references are not values.
    pub fn operands(&self) -> Vec<ValueId> {
        match *self {
            Instruction::Alloca { .. } | Instruction::Branch { .. } => Vec::new(),
            Instruction::Load { pointer } => vec![pointer],
            Instruction::Store { value, pointer } => vec![value, pointer],
            Instruction::Binary { lhs, rhs, .. } | Instruction::Icmp { lhs, rhs, .. } => {
                vec![lhs, rhs]
            }
            Instruction::Call { argument, .. } => argument.into_iter().collect(),
            Instruction::CondBranch { condition, .. } => vec![condition],
            Instruction::Return { value } => vec![value],
        }
    }

    fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut ValueId)) {
        match self {
            Instruction::Alloca { .. } | Instruction::Branch { .. } => {}
            Instruction::Load { pointer } => f(pointer),
            Instruction::Store { value, pointer } => {
                f(value);
                f(pointer);
            }
            Instruction::Binary { lhs, rhs, .. } | Instruction::Icmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Instruction::Call { argument, .. } => {
                if let Some(argument) = argument {
                    f(argument);
                }
            }
            Instruction::CondBranch { condition, .. } => f(condition),
            Instruction::Return { value } => f(value),
        }
    }
}

#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    /// Non-terminator instructions followed by at most one terminator, which
    /// is always last
    pub instructions: Vec<ValueId>,
}

#[derive(Debug)]
pub struct Function {
    pub name: InternedSymbol,
    pub parameter: Option<ValueId>,
    values: IndexVec<ValueId, Value>,
    blocks: IndexVec<BlockId, Block>,
    /// Block ordering; the entry block is first and the return block last
    layout: Vec<BlockId>,
    /// Interned i32 constants, so equal constants share one value identity
    constants: HashMap<i32, ValueId>,
    /// Every variable id maps to its entry-block `alloca`
    pub variable_slots: BTreeMap<VarId, ValueId>,
    pub return_slot: Option<ValueId>,
}

impl Function {
    pub fn new(name: InternedSymbol) -> Self {
        Self {
            name,
            parameter: None,
            values: IndexVec::new(),
            blocks: IndexVec::new(),
            layout: Vec::new(),
            constants: HashMap::new(),
            variable_slots: BTreeMap::new(),
            return_slot: None,
        }
    }

    /* Blocks */

    pub fn append_block(&mut self) -> BlockId {
        let id = self.blocks.next_index();

        self.blocks.push(Block {
            id,
            instructions: Vec::new(),
        });
        self.layout.push(id);

        id
    }

    pub fn insert_block_before(&mut self, before: BlockId) -> BlockId {
        let id = self.blocks.next_index();

        self.blocks.push(Block {
            id,
            instructions: Vec::new(),
        });

        let position = self
            .layout
            .iter()
            .position(|&b| b == before)
            .expect("insertion point is not in the layout");
        self.layout.insert(position, id);

        id
    }

    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    pub fn entry_block(&self) -> BlockId {
        *self.layout.first().expect("function has no blocks")
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    /* Values */

    pub fn value_kind(&self, id: ValueId) -> &ValueKind {
        &self.values[id].kind
    }

    pub fn instruction(&self, id: ValueId) -> Option<&Instruction> {
        match &self.values[id].kind {
            ValueKind::Instruction(instruction) => Some(instruction),
            _ => None,
        }
    }

    pub fn constant_value(&self, id: ValueId) -> Option<i32> {
        match self.values[id].kind {
            ValueKind::Constant(value) => Some(value),
            _ => None,
        }
    }

    /// The interned value for an i32 constant
    pub fn constant(&mut self, value: i32) -> ValueId {
        if let Some(&id) = self.constants.get(&value) {
            return id;
        }

        let id = self.values.push(Value {
            kind: ValueKind::Constant(value),
            uses: Vec::new(),
        });
        self.constants.insert(value, id);

        id
    }

    pub fn create_parameter(&mut self) -> ValueId {
        assert!(self.parameter.is_none(), "function already has a parameter");

        let id = self.values.push(Value {
            kind: ValueKind::Parameter,
            uses: Vec::new(),
        });
        self.parameter = Some(id);

        id
    }

    /* Instructions */

    /// Appends an instruction at the end of a block, recording a use of each
    /// of its operands
    pub fn append_instruction(&mut self, block: BlockId, instruction: Instruction) -> ValueId {
        assert!(
            !self.is_terminated(block),
            "appended an instruction to a block that already has a terminator"
        );

        let operands = instruction.operands();

        let id = self.values.push(Value {
            kind: ValueKind::Instruction(instruction),
            uses: Vec::new(),
        });

        for operand in operands {
            self.values[operand].uses.push(id);
        }

        self.blocks[block].instructions.push(id);

        id
    }

    pub fn terminator(&self, block: BlockId) -> Option<ValueId> {
        let last = *self.blocks[block].instructions.last()?;

        self.instruction(last)
            .is_some_and(Instruction::is_terminator)
            .then_some(last)
    }

    pub fn is_terminated(&self, block: BlockId) -> bool {
        self.terminator(block).is_some()
    }

    /// The successor blocks named by a block's terminator, or `None` if the
    /// block is not terminated
    pub fn successors(&self, block: BlockId) -> Option<Vec<BlockId>> {
        let terminator = self.terminator(block)?;

        Some(match *self.instruction(terminator).unwrap() {
            Instruction::Branch { target } => vec![target],
            Instruction::CondBranch {
                positive, negative, ..
            } => vec![positive, negative],
            Instruction::Return { .. } => Vec::new(),
            _ => unreachable!(),
        })
    }

    /// Computes the inverse edge relation by scanning every terminator.
    /// Returns `None` if any block lacks a terminator.
    pub fn predecessors(&self) -> Option<BTreeMap<BlockId, BTreeSet<BlockId>>> {
        let mut predecessors: BTreeMap<BlockId, BTreeSet<BlockId>> =
            self.layout.iter().map(|&b| (b, BTreeSet::new())).collect();

        for &block in &self.layout {
            for successor in self.successors(block)? {
                predecessors
                    .get_mut(&successor)
                    .expect("terminator targets a block outside the layout")
                    .insert(block);
            }
        }

        Some(predecessors)
    }

    /* Rewriting */

    pub fn has_uses(&self, id: ValueId) -> bool {
        !self.values[id].uses.is_empty()
    }

    pub fn use_count(&self, id: ValueId) -> usize {
        self.values[id].uses.len()
    }

    /// Rewires every consumer of `old` to reference `new` instead. Atomic
    /// from the caller's perspective: afterwards `old` has no uses.
    pub fn replace_all_uses_with(&mut self, old: ValueId, new: ValueId) {
        assert_ne!(old, new, "cannot replace a value with itself");

        let users = std::mem::take(&mut self.values[old].uses);

        for &user in &users {
            let ValueKind::Instruction(instruction) = &mut self.values[user].kind else {
                unreachable!("only instructions consume values");
            };

            instruction.for_each_operand_mut(|operand| {
                if *operand == old {
                    *operand = new;
                }
            });
        }

        self.values[new].uses.extend(users);
    }

    /// Removes an instruction from its block and releases its operand uses.
    /// The instruction must itself be unused.
    pub fn erase_instruction(&mut self, block: BlockId, id: ValueId) {
        assert!(
            !self.has_uses(id),
            "cannot erase an instruction that still has uses"
        );

        let instructions = &mut self.blocks[block].instructions;
        let position = instructions
            .iter()
            .position(|&v| v == id)
            .expect("instruction is not in the given block");
        instructions.remove(position);

        let operands = match &self.values[id].kind {
            ValueKind::Instruction(instruction) => instruction.operands(),
            _ => unreachable!("only instructions live in blocks"),
        };

        for operand in operands {
            let uses = &mut self.values[operand].uses;
            let position = uses
                .iter()
                .position(|&u| u == id)
                .expect("operand has no recorded use of this instruction");
            uses.remove(position);
        }
    }
}
