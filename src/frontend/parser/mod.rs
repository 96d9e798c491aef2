// Recursive-descent parser for Glimmer source, with precedence climbing for
// binary expressions (structure grounded on the Lua-like parser this crate
// started from; the grammar itself is Glimmer's).
pub mod ast;

use crate::frontend::lexer::{Lexer, token::Token};
use ast::{AssignTarget, BinOp, Expression, IncDecOp, Literal, LogicalOp, Program, Statement, UnOp};

#[derive(Debug, Clone, PartialEq)]
pub enum ParserErrorType {
    UnexpectedToken,
    UnclosedBrackets,
    UnexpectedEof,
    InvalidExpression,
    InvalidAssignTarget,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParserError {
    pub err_type: ParserErrorType,
    pub message: String,
    pub pos: usize,
}

pub struct Parser<'a> {
    lexer: &'a mut Lexer<'a>,
    current_token: Option<Token>,
    next_token: Option<Token>,
    lookahead2: Option<Token>,
    errors: Vec<ParserError>,
}

/// Binary-ish operator, resolved from a token during precedence climbing.
/// Kept distinct from `ast::BinOp`/`ast::LogicalOp` because `&&`/`||` build a
/// different AST node (short-circuit) than arithmetic/bitwise/comparison ops.
enum OpTok {
    Bin(BinOp),
    Log(LogicalOp),
}

impl<'a> Parser<'a> {
    pub fn new(lexer: &'a mut Lexer<'a>) -> Parser<'a> {
        let next = lexer.next_token();
        Parser { lexer, current_token: None, next_token: Some(next), lookahead2: None, errors: vec![] }
    }

    pub fn get_err(&self) -> &Vec<ParserError> {
        &self.errors
    }

    pub fn get_lexer(&self) -> &Lexer<'_> {
        self.lexer
    }

    fn emit_err(&mut self, err_type: ParserErrorType, message: String) {
        let pos = self.lexer.get_pos();
        self.errors.push(ParserError { err_type, message, pos });
    }

    fn advance_tokens(&mut self) {
        self.current_token = self.next_token.take();
        self.next_token = Some(self.lookahead2.take().unwrap_or_else(|| self.lexer.next_token()));
    }

    fn peek_token(&self) -> &Token {
        self.next_token.as_ref().unwrap_or(&Token::Eof)
    }

    /// Two tokens ahead of `current_token`. Only needed to disambiguate
    /// `for (init; cond; update)` from `for (name in source)` right after
    /// consuming the opening paren.
    fn peek2_token(&mut self) -> Token {
        if self.lookahead2.is_none() {
            self.lookahead2 = Some(self.lexer.next_token());
        }
        self.lookahead2.clone().unwrap()
    }

    fn expect(&mut self, expected: Token) -> bool {
        if self.peek_token() == &expected {
            self.advance_tokens();
            true
        } else {
            let msg = format!("expected token {:?}, found {:?}", expected, self.peek_token());
            self.emit_err(ParserErrorType::UnexpectedToken, msg);
            false
        }
    }

    fn expect_ident(&mut self) -> Option<String> {
        match self.peek_token().clone() {
            Token::Ident(name) => {
                self.advance_tokens();
                Some(name)
            }
            other => {
                self.emit_err(ParserErrorType::UnexpectedToken, format!("expected identifier, found {:?}", other));
                None
            }
        }
    }

    // ---- expressions ----------------------------------------------------

    fn token_operator(tok: &Token) -> Option<(u8, OpTok)> {
        Some(match tok {
            Token::OrOr => (1, OpTok::Log(LogicalOp::Or)),
            Token::AndAnd => (2, OpTok::Log(LogicalOp::And)),
            Token::Eq => (3, OpTok::Bin(BinOp::Eq)),
            Token::Neq => (3, OpTok::Bin(BinOp::Neq)),
            Token::Lt => (4, OpTok::Bin(BinOp::Lt)),
            Token::Gt => (4, OpTok::Bin(BinOp::Gt)),
            Token::Leq => (4, OpTok::Bin(BinOp::Leq)),
            Token::Geq => (4, OpTok::Bin(BinOp::Geq)),
            Token::Pipe => (5, OpTok::Bin(BinOp::BitOr)),
            Token::Caret => (6, OpTok::Bin(BinOp::BitXor)),
            Token::Amp => (7, OpTok::Bin(BinOp::BitAnd)),
            Token::LShift => (8, OpTok::Bin(BinOp::LShift)),
            Token::RShift => (8, OpTok::Bin(BinOp::RShift)),
            Token::Plus => (9, OpTok::Bin(BinOp::Add)),
            Token::Minus => (9, OpTok::Bin(BinOp::Sub)),
            Token::Asterisk => (10, OpTok::Bin(BinOp::Mul)),
            Token::Slash => (10, OpTok::Bin(BinOp::Div)),
            Token::Percent => (10, OpTok::Bin(BinOp::Mod)),
            _ => return None,
        })
    }

    pub fn parse_expression(&mut self) -> Option<Expression> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Option<Expression> {
        let cond = self.parse_binary(0)?;
        if self.peek_token() == &Token::Question {
            self.advance_tokens();
            let then_branch = self.parse_expression()?;
            if !self.expect(Token::Colon) {
                return None;
            }
            let else_branch = self.parse_expression()?;
            Some(Expression::Ternary {
                condition: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            })
        } else {
            Some(cond)
        }
    }

    fn parse_binary(&mut self, min_prec: u8) -> Option<Expression> {
        let mut left = self.parse_unary()?;
        loop {
            let Some((prec, op)) = Self::token_operator(self.peek_token()) else { break };
            if prec < min_prec {
                break;
            }
            self.advance_tokens();
            let right = self.parse_binary(prec + 1)?;
            left = match op {
                OpTok::Bin(operator) => Expression::Binary { left: Box::new(left), operator, right: Box::new(right) },
                OpTok::Log(operator) => {
                    Expression::Logical { left: Box::new(left), operator, right: Box::new(right) }
                }
            };
        }
        Some(left)
    }

    fn parse_unary(&mut self) -> Option<Expression> {
        match self.peek_token() {
            Token::Minus => {
                self.advance_tokens();
                let operand = self.parse_unary()?;
                Some(Expression::Unary { operator: UnOp::Neg, operand: Box::new(operand) })
            }
            Token::Bang => {
                self.advance_tokens();
                let operand = self.parse_unary()?;
                Some(Expression::Unary { operator: UnOp::Not, operand: Box::new(operand) })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Option<Expression> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_token() {
                Token::LParen => {
                    self.advance_tokens();
                    let mut args = vec![];
                    if self.peek_token() != &Token::RParen {
                        loop {
                            args.push(self.parse_expression()?);
                            if self.peek_token() == &Token::Comma {
                                self.advance_tokens();
                                continue;
                            }
                            break;
                        }
                    }
                    if !self.expect(Token::RParen) {
                        self.emit_err(ParserErrorType::UnclosedBrackets, "expected ')' after call arguments".into());
                        return None;
                    }
                    expr = Expression::Call { callee: Box::new(expr), arguments: args };
                }
                Token::LBracket => {
                    self.advance_tokens();
                    let index = self.parse_expression()?;
                    if !self.expect(Token::RBracket) {
                        self.emit_err(ParserErrorType::UnclosedBrackets, "expected ']' after index".into());
                        return None;
                    }
                    expr = Expression::Index { collection: Box::new(expr), index: Box::new(index) };
                }
                Token::Dot => {
                    self.advance_tokens();
                    let name = self.expect_ident()?;
                    expr = Expression::Index {
                        collection: Box::new(expr),
                        index: Box::new(Expression::Literal(Literal::String(name))),
                    };
                }
                Token::PlusPlus | Token::MinusMinus => {
                    let operator = if self.peek_token() == &Token::PlusPlus { IncDecOp::Inc } else { IncDecOp::Dec };
                    let Some(target) = Self::expr_to_target(&expr) else {
                        self.emit_err(ParserErrorType::InvalidAssignTarget, "invalid target for ++/--".into());
                        return None;
                    };
                    self.advance_tokens();
                    expr = Expression::PostfixIncDec { target, operator };
                }
                _ => break,
            }
        }
        Some(expr)
    }

    fn parse_primary(&mut self) -> Option<Expression> {
        let token = self.peek_token().clone();
        match token {
            Token::Ident(name) => {
                self.advance_tokens();
                Some(Expression::Identifier(name))
            }
            Token::NumLit(n) => {
                self.advance_tokens();
                Some(Expression::Literal(Literal::Number(n)))
            }
            Token::StrLit(s) => {
                self.advance_tokens();
                Some(Expression::Literal(Literal::String(s)))
            }
            Token::KwTrue => {
                self.advance_tokens();
                Some(Expression::Literal(Literal::Boolean(true)))
            }
            Token::KwFalse => {
                self.advance_tokens();
                Some(Expression::Literal(Literal::Boolean(false)))
            }
            Token::KwNull => {
                self.advance_tokens();
                Some(Expression::Literal(Literal::Null))
            }
            Token::LParen => {
                self.advance_tokens();
                let expr = self.parse_expression()?;
                if !self.expect(Token::RParen) {
                    return None;
                }
                Some(expr)
            }
            Token::LBracket => {
                self.advance_tokens();
                let mut items = vec![];
                if self.peek_token() != &Token::RBracket {
                    loop {
                        items.push(self.parse_expression()?);
                        if self.peek_token() == &Token::Comma {
                            self.advance_tokens();
                            continue;
                        }
                        break;
                    }
                }
                if !self.expect(Token::RBracket) {
                    self.emit_err(ParserErrorType::UnclosedBrackets, "expected ']' after array literal".into());
                    return None;
                }
                Some(Expression::Array(items))
            }
            Token::LBrace => self.parse_map_literal(),
            Token::KwFunction => self.parse_function_literal(None),
            other => {
                self.emit_err(ParserErrorType::InvalidExpression, format!("unexpected token {:?} in expression", other));
                None
            }
        }
    }

    fn parse_map_literal(&mut self) -> Option<Expression> {
        self.expect(Token::LBrace);
        let mut pairs = vec![];
        if self.peek_token() != &Token::RBrace {
            loop {
                let key = if let Token::Ident(name) = self.peek_token().clone() {
                    // bare `name:` sugar for a string key, same as `"name":`.
                    self.advance_tokens();
                    Expression::Literal(Literal::String(name))
                } else {
                    self.parse_expression()?
                };
                if !self.expect(Token::Colon) {
                    self.emit_err(ParserErrorType::UnexpectedToken, "expected ':' in map literal".into());
                    return None;
                }
                let value = self.parse_expression()?;
                pairs.push((key, value));
                if self.peek_token() == &Token::Comma {
                    self.advance_tokens();
                    continue;
                }
                break;
            }
        }
        if !self.expect(Token::RBrace) {
            self.emit_err(ParserErrorType::UnclosedBrackets, "expected '}' after map literal".into());
            return None;
        }
        Some(Expression::MapLit(pairs))
    }

    fn parse_function_literal(&mut self, name: Option<String>) -> Option<Expression> {
        self.expect(Token::KwFunction);
        let (params, body) = self.parse_function_tail()?;
        Some(Expression::FunctionLit { name, params, body })
    }

    fn parse_function_tail(&mut self) -> Option<(Vec<String>, Vec<Statement>)> {
        if !self.expect(Token::LParen) {
            return None;
        }
        let mut params = vec![];
        if self.peek_token() != &Token::RParen {
            loop {
                params.push(self.expect_ident()?);
                if self.peek_token() == &Token::Comma {
                    self.advance_tokens();
                    continue;
                }
                break;
            }
        }
        if !self.expect(Token::RParen) {
            return None;
        }
        let body = self.parse_block()?;
        Some((params, body))
    }

    fn expr_to_target(expr: &Expression) -> Option<AssignTarget> {
        match expr {
            Expression::Identifier(name) => Some(AssignTarget::Identifier(name.clone())),
            Expression::Index { collection, index } => {
                Some(AssignTarget::Index { collection: collection.clone(), index: index.clone() })
            }
            _ => None,
        }
    }

    // ---- statements -------------------------------------------------------

    fn parse_block(&mut self) -> Option<Vec<Statement>> {
        if !self.expect(Token::LBrace) {
            return None;
        }
        let mut body = vec![];
        while self.peek_token() != &Token::RBrace && self.peek_token() != &Token::Eof {
            body.push(self.parse_statement()?);
        }
        if !self.expect(Token::RBrace) {
            self.emit_err(ParserErrorType::UnclosedBrackets, "expected '}' to close block".into());
            return None;
        }
        Some(body)
    }

    fn parse_var_decl(&mut self) -> Option<Statement> {
        self.expect(Token::KwVar);
        let mut names = vec![self.expect_ident()?];
        while self.peek_token() == &Token::Comma {
            self.advance_tokens();
            names.push(self.expect_ident()?);
        }
        if !self.expect(Token::Assign) {
            return None;
        }
        let mut values = vec![self.parse_expression()?];
        while self.peek_token() == &Token::Comma {
            self.advance_tokens();
            values.push(self.parse_expression()?);
        }
        Some(Statement::VarDecl { names, values })
    }

    fn parse_assign_or_expr_stmt(&mut self) -> Option<Statement> {
        let expr = self.parse_expression()?;
        if self.peek_token() == &Token::Assign {
            self.advance_tokens();
            let Some(target) = Self::expr_to_target(&expr) else {
                self.emit_err(ParserErrorType::InvalidAssignTarget, "left-hand side is not assignable".into());
                return None;
            };
            let value = self.parse_expression()?;
            Some(Statement::Assign { target, value })
        } else {
            Some(Statement::ExprStatement(expr))
        }
    }

    fn parse_if_statement(&mut self) -> Option<Statement> {
        self.expect(Token::KwIf);
        if !self.expect(Token::LParen) {
            return None;
        }
        let cond = self.parse_expression()?;
        if !self.expect(Token::RParen) {
            return None;
        }
        let then_body = self.parse_block()?;
        let mut arms = vec![(cond, then_body)];

        while self.peek_token() == &Token::KwElif {
            self.advance_tokens();
            if !self.expect(Token::LParen) {
                return None;
            }
            let elif_cond = self.parse_expression()?;
            if !self.expect(Token::RParen) {
                return None;
            }
            let elif_body = self.parse_block()?;
            arms.push((elif_cond, elif_body));
        }

        let else_branch = if self.peek_token() == &Token::KwElse {
            self.advance_tokens();
            Some(self.parse_block()?)
        } else {
            None
        };

        Some(Statement::If { arms, else_branch })
    }

    fn parse_while_statement(&mut self) -> Option<Statement> {
        self.expect(Token::KwWhile);
        if !self.expect(Token::LParen) {
            return None;
        }
        let condition = self.parse_expression()?;
        if !self.expect(Token::RParen) {
            return None;
        }
        let body = self.parse_block()?;
        Some(Statement::While { condition, body })
    }

    fn parse_small_statement(&mut self) -> Option<Statement> {
        if self.peek_token() == &Token::KwVar {
            self.parse_var_decl()
        } else {
            self.parse_assign_or_expr_stmt()
        }
    }

    fn parse_for_statement(&mut self) -> Option<Statement> {
        self.expect(Token::KwFor);
        if !self.expect(Token::LParen) {
            return None;
        }

        // `for (name in source)` is sugar for `foreach`; disambiguate from
        // `for (init; cond; update)` with one extra token of lookahead.
        if matches!(self.peek_token(), Token::Ident(_)) && self.peek2_token() == Token::KwIn {
            let var_name = self.expect_ident()?;
            self.expect(Token::KwIn);
            let source = self.parse_expression()?;
            if !self.expect(Token::RParen) {
                return None;
            }
            let body = self.parse_block()?;
            return Some(Statement::Foreach { var_name, source, body });
        }

        let init = if self.peek_token() == &Token::Semicolon {
            None
        } else {
            Some(Box::new(self.parse_small_statement()?))
        };
        if !self.expect(Token::Semicolon) {
            return None;
        }

        let condition = if self.peek_token() == &Token::Semicolon { None } else { Some(self.parse_expression()?) };
        if !self.expect(Token::Semicolon) {
            return None;
        }

        let update = if self.peek_token() == &Token::RParen { None } else { Some(Box::new(self.parse_small_statement()?)) };
        if !self.expect(Token::RParen) {
            return None;
        }

        let body = self.parse_block()?;
        Some(Statement::For { init, condition, update, body })
    }

    fn parse_foreach_statement(&mut self) -> Option<Statement> {
        self.expect(Token::KwForeach);
        if !self.expect(Token::LParen) {
            return None;
        }
        let var_name = self.expect_ident()?;
        if !self.expect(Token::KwIn) {
            return None;
        }
        let source = self.parse_expression()?;
        if !self.expect(Token::RParen) {
            return None;
        }
        let body = self.parse_block()?;
        Some(Statement::Foreach { var_name, source, body })
    }

    fn parse_recover_statement(&mut self) -> Option<Statement> {
        self.expect(Token::KwRecover);
        if !self.expect(Token::LParen) {
            return None;
        }
        let err_name = self.expect_ident()?;
        if !self.expect(Token::RParen) {
            return None;
        }
        let body = self.parse_block()?;
        Some(Statement::Recover { err_name, body })
    }

    fn parse_include_statement(&mut self) -> Option<Statement> {
        self.expect(Token::KwInclude);
        let path = match self.peek_token().clone() {
            Token::StrLit(s) => {
                self.advance_tokens();
                s
            }
            other => {
                self.emit_err(ParserErrorType::UnexpectedToken, format!("expected a string path, found {:?}", other));
                return None;
            }
        };
        self.expect(Token::Semicolon);
        Some(Statement::Include(path))
    }

    fn parse_return_statement(&mut self) -> Option<Statement> {
        self.expect(Token::KwReturn);
        if self.peek_token() == &Token::Semicolon {
            self.advance_tokens();
            return Some(Statement::Return(None));
        }
        let value = self.parse_expression()?;
        self.expect(Token::Semicolon);
        Some(Statement::Return(Some(value)))
    }

    fn parse_function_decl_statement(&mut self) -> Option<Statement> {
        self.expect(Token::KwFunction);
        let name = self.expect_ident()?;
        let (params, body) = self.parse_function_tail()?;
        Some(Statement::VarDecl {
            names: vec![name.clone()],
            values: vec![Expression::FunctionLit { name: Some(name), params, body }],
        })
    }

    fn parse_statement(&mut self) -> Option<Statement> {
        match self.peek_token() {
            Token::KwVar => {
                let stmt = self.parse_var_decl()?;
                self.expect(Token::Semicolon);
                Some(stmt)
            }
            Token::KwIf => self.parse_if_statement(),
            Token::KwWhile => self.parse_while_statement(),
            Token::KwFor => self.parse_for_statement(),
            Token::KwForeach => self.parse_foreach_statement(),
            Token::KwRecover => self.parse_recover_statement(),
            Token::KwInclude => self.parse_include_statement(),
            Token::KwFunction => self.parse_function_decl_statement(),
            Token::KwBreak => {
                self.advance_tokens();
                self.expect(Token::Semicolon);
                Some(Statement::Break)
            }
            Token::KwContinue => {
                self.advance_tokens();
                self.expect(Token::Semicolon);
                Some(Statement::Continue)
            }
            Token::KwReturn => self.parse_return_statement(),
            Token::LBrace => self.parse_block().map(Statement::Block),
            _ => {
                let stmt = self.parse_assign_or_expr_stmt()?;
                self.expect(Token::Semicolon);
                Some(stmt)
            }
        }
    }

    fn parse_program(&mut self) -> Program {
        let mut body = vec![];
        loop {
            if self.peek_token() == &Token::Eof {
                break;
            }
            match self.parse_statement() {
                Some(stmt) => body.push(stmt),
                None => break,
            }
        }
        Program { body }
    }

    pub fn parse(&mut self) -> Program {
        self.parse_program()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        let mut lexer = Lexer::new(src);
        let mut parser = Parser::new(&mut lexer);
        let program = parser.parse();
        assert!(parser.get_err().is_empty(), "parser errors: {:?}", parser.get_err());
        program
    }

    #[test]
    fn parses_arithmetic_return() {
        let program = parse_ok("return (1 + 2) * 3;");
        assert_eq!(program.body.len(), 1);
        assert!(matches!(program.body[0], Statement::Return(Some(_))));
    }

    #[test]
    fn parses_closure_and_call() {
        let program = parse_ok(
            "var f = function() { var x = 10; return function(){ x = x + 1; return x; }; }; var g = f(); g(); g(); return g();",
        );
        assert_eq!(program.body.len(), 5);
    }

    #[test]
    fn parses_map_overload_literal() {
        let program = parse_ok(r#"var m = {"__operator_add__": function(self, o){ return o + 100; }}; return m + 5;"#);
        assert_eq!(program.body.len(), 2);
    }

    #[test]
    fn parses_foreach_over_string() {
        let program = parse_ok(r#"var s = "abc"; var out = ""; for (c in s) { out = out + c; } return out;"#);
        assert!(matches!(program.body[2], Statement::Foreach { .. }));
    }

    #[test]
    fn parses_foreach_statement() {
        let program = parse_ok(r#"foreach (c in "abc") { }"#);
        assert!(matches!(program.body[0], Statement::Foreach { .. }));
    }

    #[test]
    fn c_style_for_loop_is_distinguished_from_foreach() {
        let program = parse_ok("for (var i = 0; i < 10; i++) { }");
        assert!(matches!(program.body[0], Statement::For { .. }));
    }

    #[test]
    fn parses_recover_block() {
        let program = parse_ok(r#"recover (e) { return e; }"#);
        assert!(matches!(program.body[0], Statement::Recover { .. }));
    }

    #[test]
    fn postfix_increment_parses_as_expression() {
        let program = parse_ok("x++;");
        assert!(matches!(program.body[0], Statement::ExprStatement(Expression::PostfixIncDec { .. })));
    }
}
