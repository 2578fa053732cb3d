//! Recursive-descent parser over the token stream. Statements need no
//! terminators; `;` is accepted and skipped. Assignment targets are the
//! postfix forms (identifier, field, index) re-checked after parsing the
//! left-hand expression.

use std::rc::Rc;

use crate::ScriptError;
use crate::ast::{BinOp, Expr, FuncDef, Stmt, UnOp};
use crate::lex::{Tok, Token, lex};

pub fn parse(file: &str, src: &str) -> Result<Vec<Stmt>, ScriptError> {
    let tokens = lex(file, src)?;
    let mut p = Parser {
        file,
        tokens,
        pos: 0,
    };
    let mut stmts = Vec::new();
    while !p.at_end() {
        stmts.push(p.statement()?);
    }
    Ok(stmts)
}

struct Parser<'a> {
    file: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|t| t.line)
            .unwrap_or(0)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).map(|t| t.tok.clone());
        self.pos += 1;
        t
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), ScriptError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {:?}", self.peek())))
        }
    }

    fn error(&self, message: String) -> ScriptError {
        ScriptError::Parse {
            file: self.file.to_string(),
            line: self.line(),
            message,
        }
    }

    fn ident(&mut self, what: &str) -> Result<String, ScriptError> {
        match self.next() {
            Some(Tok::Ident(name)) => Ok(name),
            other => Err(self.error(format!("expected {what}, found {other:?}"))),
        }
    }

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        while self.eat(&Tok::Semi) {}
        match self.peek() {
            Some(Tok::Let) => {
                self.pos += 1;
                let name = self.ident("binding name")?;
                self.expect(&Tok::Assign, "=")?;
                let value = self.expression()?;
                Ok(Stmt::Let(name, value))
            }
            Some(Tok::Fn) => {
                // `fn name(params) { .. }` declares; `fn(params)` in
                // expression position is handled by `primary`.
                if matches!(
                    self.tokens.get(self.pos + 1).map(|t| &t.tok),
                    Some(Tok::Ident(_))
                ) {
                    self.pos += 1;
                    let name = self.ident("function name")?;
                    let def = self.func_def(Some(name.clone()))?;
                    Ok(Stmt::FnDecl(name, def))
                } else {
                    let expr = self.expression()?;
                    Ok(Stmt::Expr(expr))
                }
            }
            Some(Tok::If) => {
                self.pos += 1;
                let cond = self.expression()?;
                let then = self.block()?;
                let alt = if self.eat(&Tok::Else) {
                    if self.peek() == Some(&Tok::If) {
                        Some(vec![self.statement()?])
                    } else {
                        Some(self.block()?)
                    }
                } else {
                    None
                };
                Ok(Stmt::If(cond, then, alt))
            }
            Some(Tok::While) => {
                self.pos += 1;
                let cond = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::While(cond, body))
            }
            Some(Tok::For) => {
                self.pos += 1;
                let var = self.ident("loop variable")?;
                self.expect(&Tok::In, "in")?;
                let iter = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::For(var, iter, body))
            }
            Some(Tok::Return) => {
                self.pos += 1;
                let value = match self.peek() {
                    None | Some(Tok::RBrace) | Some(Tok::Semi) => None,
                    _ => Some(self.expression()?),
                };
                Ok(Stmt::Return(value))
            }
            _ => {
                let expr = self.expression()?;
                if self.eat(&Tok::Assign) {
                    let value = self.expression()?;
                    return match expr {
                        Expr::Ident(name) => Ok(Stmt::AssignIdent(name, value)),
                        Expr::Field(obj, name) => Ok(Stmt::AssignField(*obj, name, value)),
                        Expr::Index(obj, idx) => Ok(Stmt::AssignIndex(*obj, *idx, value)),
                        _ => Err(self.error("invalid assignment target".into())),
                    };
                }
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect(&Tok::LBrace, "{")?;
        let mut stmts = Vec::new();
        while !self.eat(&Tok::RBrace) {
            if self.at_end() {
                return Err(self.error("unterminated block".into()));
            }
            stmts.push(self.statement()?);
        }
        Ok(stmts)
    }

    fn func_def(&mut self, name: Option<String>) -> Result<Rc<FuncDef>, ScriptError> {
        let line = self.line();
        self.expect(&Tok::LParen, "(")?;
        let mut params = Vec::new();
        if !self.eat(&Tok::RParen) {
            loop {
                params.push(self.ident("parameter")?);
                if self.eat(&Tok::RParen) {
                    break;
                }
                self.expect(&Tok::Comma, ",")?;
                if self.eat(&Tok::RParen) {
                    break;
                }
            }
        }
        let body = self.block()?;
        Ok(Rc::new(FuncDef {
            name,
            params,
            body,
            line,
        }))
    }

    fn expression(&mut self) -> Result<Expr, ScriptError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Tok::OrOr) {
            let rhs = self.and_expr()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.cmp_expr()?;
        while self.eat(&Tok::AndAnd) {
            let rhs = self.cmp_expr()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<Expr, ScriptError> {
        let lhs = self.add_expr()?;
        let op = match self.peek() {
            Some(Tok::Eq) => BinOp::Eq,
            Some(Tok::Ne) => BinOp::Ne,
            Some(Tok::Lt) => BinOp::Lt,
            Some(Tok::Le) => BinOp::Le,
            Some(Tok::Gt) => BinOp::Gt,
            Some(Tok::Ge) => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.add_expr()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn add_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.mul_expr()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn mul_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary_expr()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary_expr(&mut self) -> Result<Expr, ScriptError> {
        match self.peek() {
            Some(Tok::Minus) => {
                self.pos += 1;
                let e = self.unary_expr()?;
                Ok(Expr::Unary(UnOp::Neg, Box::new(e)))
            }
            Some(Tok::Bang) => {
                self.pos += 1;
                let e = self.unary_expr()?;
                Ok(Expr::Unary(UnOp::Not, Box::new(e)))
            }
            _ => self.postfix_expr(),
        }
    }

    fn postfix_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Tok::Dot) {
                let name = self.ident("field name")?;
                expr = Expr::Field(Box::new(expr), name);
            } else if self.eat(&Tok::LBracket) {
                let idx = self.expression()?;
                self.expect(&Tok::RBracket, "]")?;
                expr = Expr::Index(Box::new(expr), Box::new(idx));
            } else if self.eat(&Tok::LParen) {
                let mut args = Vec::new();
                if !self.eat(&Tok::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if self.eat(&Tok::RParen) {
                            break;
                        }
                        self.expect(&Tok::Comma, ",")?;
                        if self.eat(&Tok::RParen) {
                            break;
                        }
                    }
                }
                expr = Expr::Call(Box::new(expr), args);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        match self.next() {
            Some(Tok::Null) => Ok(Expr::Null),
            Some(Tok::True) => Ok(Expr::Bool(true)),
            Some(Tok::False) => Ok(Expr::Bool(false)),
            Some(Tok::Int(n)) => Ok(Expr::Int(n)),
            Some(Tok::Float(f)) => Ok(Expr::Float(f)),
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Tok::Fn) => Ok(Expr::Func(self.func_def(None)?)),
            Some(Tok::LParen) => {
                let e = self.expression()?;
                self.expect(&Tok::RParen, ")")?;
                Ok(e)
            }
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    loop {
                        items.push(self.expression()?);
                        if self.eat(&Tok::RBracket) {
                            break;
                        }
                        self.expect(&Tok::Comma, ",")?;
                        if self.eat(&Tok::RBracket) {
                            break;
                        }
                    }
                }
                Ok(Expr::List(items))
            }
            Some(Tok::LBrace) => {
                let mut fields = Vec::new();
                if !self.eat(&Tok::RBrace) {
                    loop {
                        let key = match self.next() {
                            Some(Tok::Ident(name)) => name,
                            Some(Tok::Str(s)) => s,
                            other => {
                                return Err(
                                    self.error(format!("expected record key, found {other:?}"))
                                );
                            }
                        };
                        self.expect(&Tok::Colon, ":")?;
                        let value = self.expression()?;
                        fields.push((key, value));
                        if self.eat(&Tok::RBrace) {
                            break;
                        }
                        self.expect(&Tok::Comma, ",")?;
                        if self.eat(&Tok::RBrace) {
                            break;
                        }
                    }
                }
                Ok(Expr::Record(fields))
            }
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prototype_declaration() {
        let stmts = parse(
            "t",
            r#"
            prototype("Person", {
                fullName: "",
                greet: fn() { return "hi " + self.fullName },
            })
            "#,
        )
        .unwrap();
        assert_eq!(stmts.len(), 1);
        assert!(matches!(&stmts[0], Stmt::Expr(Expr::Call(_, args)) if args.len() == 2));
    }

    #[test]
    fn parses_assignment_forms() {
        let stmts = parse("t", "x = 1\nx.y = 2\nx[0] = 3").unwrap();
        assert!(matches!(stmts[0], Stmt::AssignIdent(..)));
        assert!(matches!(stmts[1], Stmt::AssignField(..)));
        assert!(matches!(stmts[2], Stmt::AssignIndex(..)));
    }

    #[test]
    fn parses_control_flow() {
        let stmts = parse(
            "t",
            "for x in items { if x > 2 { log(x) } else { log(0) } }\nwhile false { }",
        )
        .unwrap();
        assert!(matches!(stmts[0], Stmt::For(..)));
        assert!(matches!(stmts[1], Stmt::While(..)));
    }

    #[test]
    fn call_is_not_an_assignment_target() {
        assert!(parse("t", "f() = 3").is_err());
    }

    #[test]
    fn fn_statement_vs_expression() {
        let stmts = parse("t", "fn add(a, b) { return a + b }\nlet f = fn(x) { return x }").unwrap();
        assert!(matches!(stmts[0], Stmt::FnDecl(..)));
        assert!(matches!(stmts[1], Stmt::Let(_, Expr::Func(_))));
    }
}
