use std::collections::BTreeSet;

use thiserror::Error;

use crate::frontend::{
    ast::{
        Block, Expression, ExpressionKind, ExternDeclaration, FunctionDefinition, Identifier,
        Program, Statement, StatementKind,
    },
    intern::InternedSymbol,
    lexer::Span,
};

#[derive(Debug)]
pub struct SemanticError {
    pub kind: SemanticErrorKind,
    pub span: Span,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SemanticErrorKind {
    #[error("variable `{0}` is already declared in this scope")]
    DuplicateDeclaration(InternedSymbol),
    #[error("use of undeclared variable `{0}`")]
    UndeclaredVariable(InternedSymbol),
    #[error("call to unknown function `{0}` (only `read` and `print` exist)")]
    UnknownFunction(InternedSymbol),
    #[error("`{0}` is called but was never declared `extern`")]
    UndeclaredExtern(InternedSymbol),
    #[error("`read` takes no arguments")]
    ReadWithArgument,
    #[error("`print` expects exactly one argument")]
    PrintWithoutArgument,
    #[error("extern `{0}` does not match a known signature")]
    MalformedExtern(InternedSymbol),
}

/// Checks that the program only uses declared variables, never declares the
/// same name twice within one scope, and only calls the two known externs
/// with the right shape. Downstream stages rely on these guarantees.
pub fn analyze_program(program: &Program) -> Result<(), Vec<SemanticError>> {
    let mut analyzer = Analyzer {
        scopes: Vec::new(),
        read_declared: false,
        print_declared: false,
        errors: Vec::new(),
    };

    for declaration in &program.externs {
        analyzer.check_extern(declaration);
    }

    analyzer.check_function(&program.function);

    if analyzer.errors.is_empty() {
        Ok(())
    } else {
        Err(analyzer.errors)
    }
}

#[derive(Debug)]
struct Analyzer {
    scopes: Vec<BTreeSet<InternedSymbol>>,
    read_declared: bool,
    print_declared: bool,
    errors: Vec<SemanticError>,
}

impl Analyzer {
    fn report(&mut self, kind: SemanticErrorKind, span: Span) {
        self.errors.push(SemanticError { kind, span });
    }

    fn check_extern(&mut self, declaration: &ExternDeclaration) {
        match declaration.name.symbol.value() {
            "read" if declaration.returns_value && !declaration.has_parameter => {
                self.read_declared = true;
            }
            "print" if !declaration.returns_value && declaration.has_parameter => {
                self.print_declared = true;
            }
            _ => self.report(
                SemanticErrorKind::MalformedExtern(declaration.name.symbol),
                declaration.span,
            ),
        }
    }

    fn check_function(&mut self, function: &FunctionDefinition) {
        // The parameter shares a scope with the outermost body block, so
        // `int foo(int a) { int a; ... }` is a duplicate declaration
        self.scopes.push(BTreeSet::new());

        if let Some(parameter) = &function.parameter {
            self.declare(parameter);
        }

        for statement in &function.body.statements {
            self.check_statement(statement);
        }

        self.scopes.pop();
    }

    fn declare(&mut self, name: &Identifier) {
        let scope = self
            .scopes
            .last_mut()
            .expect("declaration outside of any scope");

        if !scope.insert(name.symbol) {
            self.report(
                SemanticErrorKind::DuplicateDeclaration(name.symbol),
                name.span,
            );
        }
    }

    fn is_declared(&self, symbol: InternedSymbol) -> bool {
        self.scopes.iter().rev().any(|scope| scope.contains(&symbol))
    }

    fn check_variable_use(&mut self, name: &Identifier) {
        if !self.is_declared(name.symbol) {
            self.report(
                SemanticErrorKind::UndeclaredVariable(name.symbol),
                name.span,
            );
        }
    }

    fn check_block(&mut self, block: &Block) {
        self.scopes.push(BTreeSet::new());

        for statement in &block.statements {
            self.check_statement(statement);
        }

        self.scopes.pop();
    }

    fn check_statement(&mut self, statement: &Statement) {
        match &statement.kind {
            StatementKind::Declaration(name) => self.declare(name),
            StatementKind::Assignment { target, value } => {
                self.check_variable_use(target);
                self.check_expression(value);
            }
            StatementKind::If {
                condition,
                positive,
                negative,
            } => {
                self.check_expression(condition);
                self.check_statement(positive);

                if let Some(negative) = negative {
                    self.check_statement(negative);
                }
            }
            StatementKind::While { condition, body } => {
                self.check_expression(condition);
                self.check_statement(body);
            }
            StatementKind::Block(block) => self.check_block(block),
            StatementKind::Return(value) => self.check_expression(value),
            StatementKind::Call(call) => self.check_expression(call),
        }
    }

    fn check_expression(&mut self, expression: &Expression) {
        match &expression.kind {
            ExpressionKind::Constant(_) => {}
            ExpressionKind::Variable(name) => self.check_variable_use(name),
            ExpressionKind::Unary { operand, .. } => self.check_expression(operand),
            ExpressionKind::Binary { lhs, rhs, .. }
            | ExpressionKind::Comparison { lhs, rhs, .. } => {
                self.check_expression(lhs);
                self.check_expression(rhs);
            }
            ExpressionKind::Call { callee, argument } => {
                self.check_call(expression.span, callee, argument.as_deref());
            }
        }
    }

    fn check_call(&mut self, span: Span, callee: &Identifier, argument: Option<&Expression>) {
        match callee.symbol.value() {
            "read" => {
                if !self.read_declared {
                    self.report(SemanticErrorKind::UndeclaredExtern(callee.symbol), span);
                }

                if argument.is_some() {
                    self.report(SemanticErrorKind::ReadWithArgument, span);
                }
            }
            "print" => {
                if !self.print_declared {
                    self.report(SemanticErrorKind::UndeclaredExtern(callee.symbol), span);
                }

                if argument.is_none() {
                    self.report(SemanticErrorKind::PrintWithoutArgument, span);
                }
            }
            _ => self.report(SemanticErrorKind::UnknownFunction(callee.symbol), span),
        }

        if let Some(argument) = argument {
            self.check_expression(argument);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{parser::Parser, SourceFile};

    fn analyze(source: &str) -> Result<(), Vec<SemanticError>> {
        let source = SourceFile::in_memory(source);
        let program = Parser::parse_program(Box::leak(Box::new(source)));

        analyze_program(&program)
    }

    fn error_kinds(result: Result<(), Vec<SemanticError>>) -> Vec<SemanticErrorKind> {
        result.unwrap_err().into_iter().map(|e| e.kind).collect()
    }

    #[test]
    fn accepts_a_well_formed_program() {
        assert!(analyze(
            "extern int read();\n\
             extern void print(int);\n\
             int main() { int x; x = read(); print(x); return x; }"
        )
        .is_ok());
    }

    #[test]
    fn rejects_undeclared_variable_use() {
        let kinds = error_kinds(analyze("int main() { return x; }"));

        assert_eq!(
            kinds,
            vec![SemanticErrorKind::UndeclaredVariable(InternedSymbol::new(
                "x"
            ))]
        );
    }

    #[test]
    fn rejects_undeclared_assignment_target() {
        let kinds = error_kinds(analyze("int main() { x = 1; return 0; }"));

        assert_eq!(
            kinds,
            vec![SemanticErrorKind::UndeclaredVariable(InternedSymbol::new(
                "x"
            ))]
        );
    }

    #[test]
    fn rejects_duplicate_declarations_in_one_scope() {
        let kinds = error_kinds(analyze("int main() { int x; int x; return 0; }"));

        assert_eq!(
            kinds,
            vec![SemanticErrorKind::DuplicateDeclaration(InternedSymbol::new(
                "x"
            ))]
        );
    }

    #[test]
    fn parameter_conflicts_with_body_declaration() {
        let kinds = error_kinds(analyze("int foo(int a) { int a; return a; }"));

        assert_eq!(
            kinds,
            vec![SemanticErrorKind::DuplicateDeclaration(InternedSymbol::new(
                "a"
            ))]
        );
    }

    #[test]
    fn shadowing_in_an_inner_block_is_allowed() {
        assert!(analyze("int main() { int x; x = 1; { int x; x = 2; } return x; }").is_ok());
    }

    #[test]
    fn outer_variables_are_visible_in_inner_blocks() {
        assert!(analyze("int main() { int x; { x = 2; } return x; }").is_ok());
    }

    #[test]
    fn declarations_do_not_leak_out_of_their_block() {
        let kinds = error_kinds(analyze("int main() { { int x; } return x; }"));

        assert_eq!(
            kinds,
            vec![SemanticErrorKind::UndeclaredVariable(InternedSymbol::new(
                "x"
            ))]
        );
    }

    #[test]
    fn rejects_calls_without_extern_declarations() {
        let kinds = error_kinds(analyze("int main() { return read(); }"));

        assert_eq!(
            kinds,
            vec![SemanticErrorKind::UndeclaredExtern(InternedSymbol::new(
                "read"
            ))]
        );
    }

    #[test]
    fn rejects_read_with_an_argument() {
        let kinds = error_kinds(analyze(
            "extern int read();\nint main() { return read(1); }",
        ));

        assert_eq!(kinds, vec![SemanticErrorKind::ReadWithArgument]);
    }

    #[test]
    fn rejects_unknown_callees() {
        let kinds = error_kinds(analyze("int main() { return foo(); }"));

        assert_eq!(
            kinds,
            vec![SemanticErrorKind::UnknownFunction(InternedSymbol::new(
                "foo"
            ))]
        );
    }

    #[test]
    fn rejects_malformed_externs() {
        let kinds = error_kinds(analyze(
            "extern void read();\nint main() { return 0; }",
        ));

        assert_eq!(
            kinds,
            vec![SemanticErrorKind::MalformedExtern(InternedSymbol::new(
                "read"
            ))]
        );
    }

    #[test]
    fn collects_multiple_errors() {
        let kinds = error_kinds(analyze("int main() { int x; int x; y = 1; return z; }"));

        assert_eq!(kinds.len(), 3);
    }
}
