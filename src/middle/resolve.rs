use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    frontend::{
        ast::{
            Expression, ExpressionKind, FunctionDefinition, Identifier, NodeId, Statement,
            StatementKind,
        },
        intern::InternedSymbol,
    },
    index::{simple_index, IndexVec},
};

simple_index! {
    /// Identifies one source variable after renaming; `v0, v1, …` in
    /// declaration order across the whole function
    pub struct VarId;
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unresolved variable `{0}`")]
    UnresolvedName(InternedSymbol),
}

#[derive(Debug)]
pub struct VariableInfo {
    pub name: InternedSymbol,
}

/// The output of scope resolution. Consumers never revisit source names:
/// every declaration, assignment target, and variable use is mapped to its
/// `VarId` here.
#[derive(Debug)]
pub struct ResolvedVariables {
    pub variables: IndexVec<VarId, VariableInfo>,
    pub resolution_map: BTreeMap<NodeId, VarId>,
    /// The function parameter's id (always `v0` when present)
    pub parameter: Option<VarId>,
}

/// Walks the semantically-valid function in pre-order, assigning each
/// declaration a fresh id and resolving every use to the innermost binding.
pub fn resolve_variables(function: &FunctionDefinition) -> Result<ResolvedVariables, ResolveError> {
    let mut resolver = Resolver {
        scope_stack: ScopeStack::new(),
        result: ResolvedVariables {
            variables: IndexVec::new(),
            resolution_map: BTreeMap::new(),
            parameter: None,
        },
    };

    // The parameter lives in the same frame as the outermost body block
    resolver.scope_stack.push_scope();

    if let Some(parameter) = &function.parameter {
        let id = resolver.declare(parameter);
        resolver.result.parameter = Some(id);
    }

    for statement in &function.body.statements {
        resolver.resolve_statement(statement)?;
    }

    resolver.scope_stack.pop_scope();

    Ok(resolver.result)
}

#[derive(Debug)]
struct Resolver {
    scope_stack: ScopeStack,
    result: ResolvedVariables,
}

impl Resolver {
    /// Mints the next id and binds it in the innermost frame. Shadowing an
    /// outer binding is allowed; same-frame duplicates were rejected by sema.
    fn declare(&mut self, name: &Identifier) -> VarId {
        let id = self.result.variables.push(VariableInfo { name: name.symbol });

        self.scope_stack.add_binding(name.symbol, id);
        self.result.resolution_map.insert(name.id, id);

        id
    }

    fn resolve_use(&mut self, name: &Identifier) -> Result<(), ResolveError> {
        let Some(id) = self.scope_stack.get_binding(name.symbol) else {
            return Err(ResolveError::UnresolvedName(name.symbol));
        };

        self.result.resolution_map.insert(name.id, id);

        Ok(())
    }

    fn resolve_statement(&mut self, statement: &Statement) -> Result<(), ResolveError> {
        match &statement.kind {
            StatementKind::Declaration(name) => {
                self.declare(name);
            }
            StatementKind::Assignment { target, value } => {
                self.resolve_expression(value)?;
                self.resolve_use(target)?;
            }
            StatementKind::If {
                condition,
                positive,
                negative,
            } => {
                self.resolve_expression(condition)?;
                self.resolve_statement(positive)?;

                if let Some(negative) = negative {
                    self.resolve_statement(negative)?;
                }
            }
            StatementKind::While { condition, body } => {
                self.resolve_expression(condition)?;
                self.resolve_statement(body)?;
            }
            StatementKind::Block(block) => {
                self.scope_stack.push_scope();

                for statement in &block.statements {
                    self.resolve_statement(statement)?;
                }

                self.scope_stack.pop_scope();
            }
            StatementKind::Return(value) => self.resolve_expression(value)?,
            StatementKind::Call(call) => self.resolve_expression(call)?,
        }

        Ok(())
    }

    fn resolve_expression(&mut self, expression: &Expression) -> Result<(), ResolveError> {
        match &expression.kind {
            ExpressionKind::Constant(_) => {}
            ExpressionKind::Variable(name) => self.resolve_use(name)?,
            ExpressionKind::Unary { operand, .. } => self.resolve_expression(operand)?,
            ExpressionKind::Binary { lhs, rhs, .. }
            | ExpressionKind::Comparison { lhs, rhs, .. } => {
                self.resolve_expression(lhs)?;
                self.resolve_expression(rhs)?;
            }
            ExpressionKind::Call { argument, .. } => {
                if let Some(argument) = argument {
                    self.resolve_expression(argument)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
struct ScopeStack {
    stack: Vec<BTreeMap<InternedSymbol, VarId>>,
}

impl ScopeStack {
    fn new() -> Self {
        Self { stack: Vec::new() }
    }

    /// Creates a new block scope
    fn push_scope(&mut self) {
        self.stack.push(BTreeMap::new());
    }

    /// Destroys the current block scope
    fn pop_scope(&mut self) {
        assert!(
            self.stack.pop().is_some(),
            "Attempted to pop a scope that was never pushed"
        );
    }

    /// Adds a binding in the current (most nested) scope
    fn add_binding(&mut self, symbol: InternedSymbol, id: VarId) {
        let scope = self
            .stack
            .last_mut()
            .expect("Tried to add a binding with no scope on the stack");

        scope.insert(symbol, id);
    }

    /// Traverses the scope stack from the innermost scope outward looking for
    /// a binding
    fn get_binding(&self, symbol: InternedSymbol) -> Option<VarId> {
        for scope in self.stack.iter().rev() {
            if let Some(binding) = scope.get(&symbol) {
                return Some(*binding);
            }
        }

        None
    }
}
