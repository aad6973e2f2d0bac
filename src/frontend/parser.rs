use crate::frontend::{
    ast::{
        BinaryOperatorKind, Block, ComparisonOperatorKind, Expression, ExpressionKind,
        ExternDeclaration, FunctionDefinition, Identifier, NodeId, Program, Statement,
        StatementKind, UnaryOperatorKind,
    },
    intern::InternedSymbol,
    lexer::{Keyword, Lexer, Span, Token, TokenKind},
    SourceFile,
};

#[derive(Debug)]
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    next_node_id: u32,
}

impl<'source> Parser<'source> {
    pub fn parse_program(source_file: &'source SourceFile) -> Program {
        let mut parser = Self {
            lexer: Lexer::new(source_file),
            next_node_id: 0,
        };

        let mut externs = Vec::new();

        while parser
            .lexer
            .peek()
            .is_some_and(|t| t.kind == TokenKind::Keyword(Keyword::Extern))
        {
            externs.push(parser.parse_extern_declaration());
        }

        let function = parser.parse_function_definition();

        if let Some(trailing) = parser.lexer.peek() {
            parser.report_fatal_error(
                trailing.span,
                "Unexpected trailing tokens after the function definition",
            );
        }

        Program { externs, function }
    }

    fn create_node_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    fn report_fatal_error(&self, offending_span: Span, message: &str) -> ! {
        eprintln!(
            "{} ({}:{}:{})",
            message,
            self.lexer.source().origin,
            self.lexer
                .source()
                .line_number_for_position(offending_span.start),
            self.lexer
                .source()
                .column_for_position(offending_span.start)
        );
        std::process::exit(1);
    }

    fn expect_next(&mut self, expecting: &str) -> Token {
        let Some(token) = self.lexer.next() else {
            eprintln!(
                "Expected {expecting} but reached end of file ({})",
                self.lexer.source().origin
            );
            std::process::exit(1);
        };

        token
    }

    fn expect_next_to_be(&mut self, kind: TokenKind) -> Token {
        let token = self.expect_next(&format!("{kind:?}"));

        if token.kind != kind {
            self.report_fatal_error(
                token.span,
                &format!(
                    "Expected {:?} but found {:?} (`{}`)",
                    kind,
                    token.kind,
                    self.lexer.source().value_of_span(token.span)
                ),
            )
        }

        token
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> Token {
        self.expect_next_to_be(TokenKind::Keyword(keyword))
    }

    fn parse_identifier(&mut self) -> Identifier {
        let token = self.expect_next_to_be(TokenKind::Identifier);

        Identifier {
            id: self.create_node_id(),
            span: token.span,
            symbol: InternedSymbol::new(self.lexer.source().value_of_span(token.span)),
        }
    }

    /// `extern int read();` or `extern void print(int);`
    fn parse_extern_declaration(&mut self) -> ExternDeclaration {
        let extern_token = self.expect_keyword(Keyword::Extern);

        let return_token = self.expect_next("`int` or `void`");
        let returns_value = match return_token.kind {
            TokenKind::Keyword(Keyword::Int) => true,
            TokenKind::Keyword(Keyword::Void) => false,
            _ => self.report_fatal_error(
                return_token.span,
                "Expected `int` or `void` as the extern return type",
            ),
        };

        let name = self.parse_identifier();

        self.expect_next_to_be(TokenKind::OpenParen);

        let has_parameter = if self
            .lexer
            .peek()
            .is_some_and(|t| t.kind == TokenKind::Keyword(Keyword::Int))
        {
            self.lexer.next();
            true
        } else {
            false
        };

        self.expect_next_to_be(TokenKind::CloseParen);
        let semicolon = self.expect_next_to_be(TokenKind::Semicolon);

        ExternDeclaration {
            id: self.create_node_id(),
            span: Span::new(extern_token.span.start, semicolon.span.end),
            name,
            returns_value,
            has_parameter,
        }
    }

    /// `int NAME ( param? ) block`
    fn parse_function_definition(&mut self) -> FunctionDefinition {
        let int_token = self.expect_keyword(Keyword::Int);
        let name = self.parse_identifier();

        self.expect_next_to_be(TokenKind::OpenParen);

        let parameter = if self
            .lexer
            .peek()
            .is_some_and(|t| t.kind == TokenKind::Keyword(Keyword::Int))
        {
            self.lexer.next();
            Some(self.parse_identifier())
        } else {
            None
        };

        self.expect_next_to_be(TokenKind::CloseParen);

        let body = self.parse_block();

        FunctionDefinition {
            id: self.create_node_id(),
            span: Span::new(int_token.span.start, body.span.end),
            name,
            parameter,
            body,
        }
    }

    fn parse_block(&mut self) -> Block {
        let open = self.expect_next_to_be(TokenKind::OpenBrace);
        let mut statements = Vec::new();

        loop {
            let peeked = self.expect_peek("a statement or `}`");

            if peeked.kind == TokenKind::CloseBrace {
                break;
            }

            statements.push(self.parse_statement());
        }

        let close = self.expect_next_to_be(TokenKind::CloseBrace);

        Block {
            id: self.create_node_id(),
            span: Span::new(open.span.start, close.span.end),
            statements,
        }
    }

    fn expect_peek(&mut self, expecting: &str) -> Token {
        let Some(token) = self.lexer.peek() else {
            eprintln!(
                "Expected {expecting} but reached end of file ({})",
                self.lexer.source().origin
            );
            std::process::exit(1);
        };

        token
    }

    fn parse_statement(&mut self) -> Statement {
        let peeked = self.expect_peek("a statement");

        match peeked.kind {
            TokenKind::Keyword(Keyword::Int) => self.parse_declaration(),
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::While) => self.parse_while(),
            TokenKind::Keyword(Keyword::Return) => self.parse_return(),
            TokenKind::OpenBrace => {
                let block = self.parse_block();

                Statement {
                    id: self.create_node_id(),
                    span: block.span,
                    kind: StatementKind::Block(block),
                }
            }
            TokenKind::Identifier => self.parse_assignment_or_call(),
            _ => self.report_fatal_error(
                peeked.span,
                &format!("Expected a statement but found {:?}", peeked.kind),
            ),
        }
    }

    /// `int x;`
    fn parse_declaration(&mut self) -> Statement {
        let int_token = self.expect_keyword(Keyword::Int);
        let name = self.parse_identifier();
        let semicolon = self.expect_next_to_be(TokenKind::Semicolon);

        Statement {
            id: self.create_node_id(),
            span: Span::new(int_token.span.start, semicolon.span.end),
            kind: StatementKind::Declaration(name),
        }
    }

    fn parse_if(&mut self) -> Statement {
        let if_token = self.expect_keyword(Keyword::If);

        self.expect_next_to_be(TokenKind::OpenParen);
        let condition = Box::new(self.parse_condition());
        self.expect_next_to_be(TokenKind::CloseParen);

        let positive = Box::new(self.parse_statement());

        let negative = if self
            .lexer
            .peek()
            .is_some_and(|t| t.kind == TokenKind::Keyword(Keyword::Else))
        {
            self.lexer.next();
            Some(Box::new(self.parse_statement()))
        } else {
            None
        };

        let end = negative
            .as_ref()
            .map(|n| n.span.end)
            .unwrap_or(positive.span.end);

        Statement {
            id: self.create_node_id(),
            span: Span::new(if_token.span.start, end),
            kind: StatementKind::If {
                condition,
                positive,
                negative,
            },
        }
    }

    fn parse_while(&mut self) -> Statement {
        let while_token = self.expect_keyword(Keyword::While);

        self.expect_next_to_be(TokenKind::OpenParen);
        let condition = Box::new(self.parse_condition());
        self.expect_next_to_be(TokenKind::CloseParen);

        let body = Box::new(self.parse_statement());

        Statement {
            id: self.create_node_id(),
            span: Span::new(while_token.span.start, body.span.end),
            kind: StatementKind::While { condition, body },
        }
    }

    fn parse_return(&mut self) -> Statement {
        let return_token = self.expect_keyword(Keyword::Return);
        let value = Box::new(self.parse_expression());
        let semicolon = self.expect_next_to_be(TokenKind::Semicolon);

        Statement {
            id: self.create_node_id(),
            span: Span::new(return_token.span.start, semicolon.span.end),
            kind: StatementKind::Return(value),
        }
    }

    /// Distinguishes `x = e;` from `f(...);` after the leading identifier
    fn parse_assignment_or_call(&mut self) -> Statement {
        let name = self.parse_identifier();
        let peeked = self.expect_peek("`=` or `(`");

        match peeked.kind {
            TokenKind::Equals => {
                self.lexer.next();
                let value = Box::new(self.parse_expression());
                let semicolon = self.expect_next_to_be(TokenKind::Semicolon);

                Statement {
                    id: self.create_node_id(),
                    span: Span::new(name.span.start, semicolon.span.end),
                    kind: StatementKind::Assignment {
                        target: name,
                        value,
                    },
                }
            }
            TokenKind::OpenParen => {
                let call = self.parse_call(name);
                let semicolon = self.expect_next_to_be(TokenKind::Semicolon);

                Statement {
                    id: self.create_node_id(),
                    span: Span::new(call.span.start, semicolon.span.end),
                    kind: StatementKind::Call(Box::new(call)),
                }
            }
            _ => self.report_fatal_error(
                peeked.span,
                &format!("Expected `=` or `(` but found {:?}", peeked.kind),
            ),
        }
    }

    /// `expr REL expr`; relational operators appear only in `if`/`while`
    /// conditions
    fn parse_condition(&mut self) -> Expression {
        let lhs = Box::new(self.parse_expression());

        let operator_token = self.expect_next("a comparison operator");

        if !operator_token.kind.is_comparison_operator() {
            self.report_fatal_error(
                operator_token.span,
                &format!(
                    "Expected a comparison operator but found {:?}",
                    operator_token.kind
                ),
            )
        }

        let operator = match operator_token.kind {
            TokenKind::DoubleEquals => ComparisonOperatorKind::Equal,
            TokenKind::NotEquals => ComparisonOperatorKind::NotEqual,
            TokenKind::LessThan => ComparisonOperatorKind::LessThan,
            TokenKind::LessThanOrEqualTo => ComparisonOperatorKind::LessThanOrEqual,
            TokenKind::GreaterThan => ComparisonOperatorKind::GreaterThan,
            TokenKind::GreaterThanOrEqualTo => ComparisonOperatorKind::GreaterThanOrEqual,
            _ => unreachable!(),
        };

        let rhs = Box::new(self.parse_expression());

        Expression {
            id: self.create_node_id(),
            span: Span::new(lhs.span.start, rhs.span.end),
            kind: ExpressionKind::Comparison { operator, lhs, rhs },
        }
    }

    /// `term (('+'|'-') term)*`, left associative
    fn parse_expression(&mut self) -> Expression {
        let mut lhs = self.parse_term();

        while let Some(token) = self.lexer.peek() {
            if !token.kind.is_term_operator() {
                break;
            }

            self.lexer.next();

            let operator = match token.kind {
                TokenKind::Plus => BinaryOperatorKind::Add,
                TokenKind::Minus => BinaryOperatorKind::Subtract,
                _ => unreachable!(),
            };

            let rhs = self.parse_term();

            lhs = Expression {
                id: self.create_node_id(),
                span: Span::new(lhs.span.start, rhs.span.end),
                kind: ExpressionKind::Binary {
                    operator,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            };
        }

        lhs
    }

    /// `factor ('*' factor)*`, left associative
    fn parse_term(&mut self) -> Expression {
        let mut lhs = self.parse_factor();

        while let Some(token) = self.lexer.peek() {
            if !token.kind.is_factor_operator() {
                break;
            }

            self.lexer.next();

            let rhs = self.parse_factor();

            lhs = Expression {
                id: self.create_node_id(),
                span: Span::new(lhs.span.start, rhs.span.end),
                kind: ExpressionKind::Binary {
                    operator: BinaryOperatorKind::Multiply,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            };
        }

        lhs
    }

    fn parse_factor(&mut self) -> Expression {
        let peeked = self.expect_peek("an expression");

        match peeked.kind {
            TokenKind::Minus => {
                let minus_token = self.expect_next_to_be(TokenKind::Minus);
                let operand = Box::new(self.parse_factor());

                Expression {
                    id: self.create_node_id(),
                    span: Span::new(minus_token.span.start, operand.span.end),
                    kind: ExpressionKind::Unary {
                        operator: UnaryOperatorKind::Minus,
                        operand,
                    },
                }
            }
            TokenKind::IntegerLiteral => {
                let token = self.expect_next_to_be(TokenKind::IntegerLiteral);
                let text = self.lexer.source().value_of_span(token.span);

                let Ok(value) = text.parse::<i32>() else {
                    self.report_fatal_error(
                        token.span,
                        &format!("Integer literal `{text}` does not fit in 32 bits"),
                    )
                };

                Expression {
                    id: self.create_node_id(),
                    span: token.span,
                    kind: ExpressionKind::Constant(value),
                }
            }
            TokenKind::OpenParen => {
                self.lexer.next();
                let inner = self.parse_expression();
                let close = self.expect_next_to_be(TokenKind::CloseParen);

                Expression {
                    id: self.create_node_id(),
                    span: Span::new(peeked.span.start, close.span.end),
                    kind: inner.kind,
                }
            }
            TokenKind::Identifier => {
                let name = self.parse_identifier();

                if self
                    .lexer
                    .peek()
                    .is_some_and(|t| t.kind == TokenKind::OpenParen)
                {
                    self.parse_call(name)
                } else {
                    Expression {
                        id: self.create_node_id(),
                        span: name.span,
                        kind: ExpressionKind::Variable(name),
                    }
                }
            }
            _ => self.report_fatal_error(
                peeked.span,
                &format!("Expected an expression but found {:?}", peeked.kind),
            ),
        }
    }

    /// `read()` or `print(expr)`, with the callee already consumed
    fn parse_call(&mut self, callee: Identifier) -> Expression {
        self.expect_next_to_be(TokenKind::OpenParen);

        let argument = if self
            .lexer
            .peek()
            .is_some_and(|t| t.kind == TokenKind::CloseParen)
        {
            None
        } else {
            Some(Box::new(self.parse_expression()))
        };

        let close = self.expect_next_to_be(TokenKind::CloseParen);

        Expression {
            id: self.create_node_id(),
            span: Span::new(callee.span.start, close.span.end),
            kind: ExpressionKind::Call { callee, argument },
        }
    }
}
