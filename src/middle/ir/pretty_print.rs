//! Deterministic textual emission of the IR in LLVM-flavoured form (opaque
//! pointers). Variable slots print as `%v<N>`, the return slot as `%ret`,
//! temporaries as `%t<N>` in emission order, and blocks as `entry`, `b<N>`
//! in layout order, so printing an unchanged module twice yields identical
//! text.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::{
    index::Index,
    middle::ir::{
        BlockId, Function, Instruction, Module, StackSlot, Type, ValueId, ValueKind,
    },
};

pub fn print_module(module: &Module) -> String {
    let mut output = String::new();

    output.push_str(&format!("; ModuleID = '{}'\n", module.function.name));
    output.push_str(&format!("target triple = \"{}\"\n", module.target_triple));

    for declaration in module.externs.iter() {
        output.push('\n');
        output.push_str(&format!(
            "declare {} @{}({})\n",
            type_name(declaration.return_type),
            declaration.name,
            declaration.parameters.iter().map(|&t| type_name(t)).join(", ")
        ));
    }

    output.push('\n');
    output.push_str(&Printer::new(module).print_function());

    output
}

fn type_name(ty: Type) -> &'static str {
    match ty {
        Type::I1 => "i1",
        Type::I32 => "i32",
        Type::Ptr => "ptr",
        Type::Void => "void",
    }
}

struct Printer<'m> {
    module: &'m Module,
    function: &'m Function,
    value_names: BTreeMap<ValueId, String>,
    block_names: BTreeMap<BlockId, String>,
}

impl<'m> Printer<'m> {
    fn new(module: &'m Module) -> Self {
        let function = &module.function;
        let mut value_names = BTreeMap::new();
        let mut block_names = BTreeMap::new();

        if let Some(parameter) = function.parameter {
            value_names.insert(parameter, "%arg0".to_owned());
        }

        let mut temporaries = 0usize;

        for (position, &block) in function.layout().iter().enumerate() {
            block_names.insert(
                block,
                if position == 0 {
                    "entry".to_owned()
                } else {
                    format!("b{position}")
                },
            );

            for &value in &function.block(block).instructions {
                let name = match function.instruction(value).unwrap() {
                    Instruction::Alloca {
                        slot: StackSlot::Variable(variable),
                    } => format!("%v{}", variable.index()),
                    Instruction::Alloca {
                        slot: StackSlot::Return,
                    } => "%ret".to_owned(),
                    Instruction::Load { .. }
                    | Instruction::Binary { .. }
                    | Instruction::Icmp { .. } => {
                        let name = format!("%t{temporaries}");
                        temporaries += 1;
                        name
                    }
                    Instruction::Call { callee, .. }
                        if module.externs[*callee].return_type != Type::Void =>
                    {
                        let name = format!("%t{temporaries}");
                        temporaries += 1;
                        name
                    }
                    _ => continue,
                };

                value_names.insert(value, name);
            }
        }

        Self {
            module,
            function,
            value_names,
            block_names,
        }
    }

    fn operand(&self, value: ValueId) -> String {
        match self.function.value_kind(value) {
            ValueKind::Constant(constant) => constant.to_string(),
            _ => self.value_names[&value].clone(),
        }
    }

    fn print_function(&self) -> String {
        let mut output = String::new();

        let parameters = match self.function.parameter {
            Some(parameter) => format!("i32 {}", self.value_names[&parameter]),
            None => String::new(),
        };

        output.push_str(&format!(
            "define i32 @{}({}) {{\n",
            self.function.name, parameters
        ));

        for (position, &block) in self.function.layout().iter().enumerate() {
            if position != 0 {
                output.push('\n');
            }

            output.push_str(&format!("{}:\n", self.block_names[&block]));

            for &value in &self.function.block(block).instructions {
                output.push_str(&format!(
                    "  {}\n",
                    self.print_instruction(value, self.function.instruction(value).unwrap())
                ));
            }
        }

        output.push_str("}\n");

        output
    }

    fn print_instruction(&self, value: ValueId, instruction: &Instruction) -> String {
        match instruction {
            Instruction::Alloca { .. } => {
                format!("{} = alloca i32, align 4", self.value_names[&value])
            }
            Instruction::Load { pointer } => format!(
                "{} = load i32, ptr {}",
                self.value_names[&value],
                self.operand(*pointer)
            ),
            Instruction::Store {
                value: stored,
                pointer,
            } => format!(
                "store i32 {}, ptr {}",
                self.operand(*stored),
                self.operand(*pointer)
            ),
            Instruction::Binary { op, lhs, rhs } => format!(
                "{} = {} i32 {}, {}",
                self.value_names[&value],
                op,
                self.operand(*lhs),
                self.operand(*rhs)
            ),
            Instruction::Icmp {
                predicate,
                lhs,
                rhs,
            } => format!(
                "{} = icmp {} i32 {}, {}",
                self.value_names[&value],
                predicate,
                self.operand(*lhs),
                self.operand(*rhs)
            ),
            Instruction::Call { callee, argument } => {
                let declaration = &self.module.externs[*callee];

                let arguments = argument
                    .iter()
                    .zip(declaration.parameters.iter())
                    .map(|(&argument, &ty)| format!("{} {}", type_name(ty), self.operand(argument)))
                    .join(", ");

                let call = format!(
                    "call {} @{}({})",
                    type_name(declaration.return_type),
                    declaration.name,
                    arguments
                );

                if declaration.return_type == Type::Void {
                    call
                } else {
                    format!("{} = {}", self.value_names[&value], call)
                }
            }
            Instruction::Branch { target } => {
                format!("br label %{}", self.block_names[target])
            }
            Instruction::CondBranch {
                condition,
                positive,
                negative,
            } => format!(
                "br i1 {}, label %{}, label %{}",
                self.operand(*condition),
                self.block_names[positive],
                self.block_names[negative]
            ),
            Instruction::Return { value } => format!("ret i32 {}", self.operand(*value)),
        }
    }
}
