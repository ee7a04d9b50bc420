//! Statement parsing.
//!
//! `while` is rewritten into the for-shaped node the code generator
//! consumes, and `for .. in` rewrites its right-hand side into an iterator
//! acquisition call during parsing.

use super::{defs, error::ParseError, expr, Parser};
use crate::ast::{CaseKind, Kind, NodeFlags, NodeId, QName, VarKind};
use crate::token::Token;

/// Parse one statement.
pub fn parse_statement(parser: &mut Parser) -> Result<NodeId, ParseError> {
    parser.enter()?;
    let result = parse_statement_inner(parser);
    parser.leave();
    result
}

fn parse_statement_inner(parser: &mut Parser) -> Result<NodeId, ParseError> {
    match parser.current() {
        Token::If => parse_if(parser),
        Token::While => parse_while(parser),
        Token::Do => parse_do(parser),
        Token::For => parse_for(parser),
        Token::Switch => parse_switch(parser),
        Token::Try => parse_try(parser),
        Token::With => parse_with(parser),
        Token::Break | Token::Continue => parse_break_continue(parser),
        Token::Return => parse_return(parser),
        Token::Throw => parse_throw(parser),
        Token::Hash => parse_hash(parser),
        Token::LeftBrace => {
            let block = defs::parse_braced_directives(parser)?;
            parser.ast.node_mut(block).flags |= NodeFlags::LET_SCOPE;
            Ok(block)
        }
        Token::Semicolon => {
            let id = parser.node(Kind::Nop);
            parser.advance();
            Ok(id)
        }
        _ => {
            let e = expr::parse_expression(parser)?;
            parser.eat(&Token::Semicolon);
            Ok(e)
        }
    }
}

fn parse_if(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let id = parser.node(Kind::If);
    parser.expect(Token::If)?;
    parser.expect(Token::LeftParen)?;
    let cond = expr::parse_expression(parser)?;
    parser.expect(Token::RightParen)?;
    parser.ast.append(id, cond);

    let then = parse_statement(parser)?;
    parser.ast.append(id, then);

    if parser.eat(&Token::Else) {
        let otherwise = parse_statement(parser)?;
        parser.ast.append(id, otherwise);
    }
    Ok(id)
}

/// `while (cond) body` parses into a for-shaped node with empty
/// initializer and per-loop sections.
fn parse_while(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let id = parser.node(Kind::For);
    parser.expect(Token::While)?;

    let init = parser.node(Kind::Nop);
    parser.ast.append(id, init);

    parser.expect(Token::LeftParen)?;
    let cond = expr::parse_expression(parser)?;
    parser.expect(Token::RightParen)?;
    parser.ast.append(id, cond);

    let incr = parser.node(Kind::Nop);
    parser.ast.append(id, incr);

    let body = parse_statement(parser)?;
    parser.ast.append(id, body);
    Ok(id)
}

fn parse_do(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let id = parser.node(Kind::Do);
    parser.expect(Token::Do)?;

    let body = parse_statement(parser)?;
    parser.ast.append(id, body);

    parser.expect(Token::While)?;
    parser.expect(Token::LeftParen)?;
    let cond = expr::parse_expression(parser)?;
    parser.expect(Token::RightParen)?;
    parser.ast.append(id, cond);
    parser.eat(&Token::Semicolon);
    Ok(id)
}

fn parse_for(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let loc = parser.here();
    parser.expect(Token::For)?;
    let each = parser.eat(&Token::Each);
    parser.expect(Token::LeftParen)?;

    // Header: `in` is suspended while the initializer is parsed.
    parser.push_scope();
    parser.scope_mut().noin = true;
    let init = if parser.check(&Token::Semicolon) {
        parser.node(Kind::Nop)
    } else {
        match parser.current() {
            Token::Var => defs::parse_var_definition(parser, VarKind::Var, Default::default(), None),
            Token::Let => defs::parse_var_definition(parser, VarKind::Let, Default::default(), None),
            Token::Const => {
                defs::parse_var_definition(parser, VarKind::Const, Default::default(), None)
            }
            _ => expr::parse_expression(parser),
        }
        .map_err(|e| {
            parser.pop_scope();
            e
        })?
    };
    parser.pop_scope();

    if parser.eat(&Token::In) {
        return parse_for_in(parser, loc, each, init);
    }

    let id = parser.node_at(Kind::For, loc);
    parser.ast.append(id, init);

    // A variable-definition initializer consumes its own semicolon.
    if !matches!(parser.ast.kind(init), Kind::VarDefinition(_)) {
        parser.expect(Token::Semicolon)?;
    }
    let cond = if parser.check(&Token::Semicolon) {
        parser.node(Kind::Nop)
    } else {
        expr::parse_expression(parser)?
    };
    parser.ast.append(id, cond);

    parser.expect(Token::Semicolon)?;
    let incr = if parser.check(&Token::RightParen) {
        parser.node(Kind::Nop)
    } else {
        expr::parse_expression(parser)?
    };
    parser.ast.append(id, incr);

    parser.expect(Token::RightParen)?;
    let body = parse_statement(parser)?;
    parser.ast.append(id, body);
    Ok(id)
}

/// `for [each] (x in obj)` — the right-hand side becomes an invocation of
/// `iterator::get` (or `iterator::getValues` for `for each`) on the object;
/// the loop body dispatches `next` on the resulting iterator.
fn parse_for_in(
    parser: &mut Parser,
    loc: crate::ast::Loc,
    each: bool,
    iter_var: NodeId,
) -> Result<NodeId, ParseError> {
    let id = parser.node_at(Kind::ForIn { each }, loc);
    parser.ast.append(id, iter_var);

    let obj = expr::parse_expression(parser)?;
    parser.expect(Token::RightParen)?;

    let get_call = {
        let dot = parser.node(Kind::Dot);
        let getter = parser.node(Kind::QName);
        parser.ast.node_mut(getter).qname = Some(QName::new(
            "iterator",
            if each { "getValues" } else { "get" },
        ));
        parser.ast.append(dot, obj);
        parser.ast.append(dot, getter);

        let call = parser.node(Kind::Call);
        let args = parser.node(Kind::Args);
        parser.ast.append(call, dot);
        parser.ast.append(call, args);
        call
    };
    parser.ast.append(id, get_call);

    let body = parse_statement(parser)?;
    parser.ast.append(id, body);
    Ok(id)
}

fn parse_switch(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let id = parser.node(Kind::Switch);
    parser.expect(Token::Switch)?;
    parser.expect(Token::LeftParen)?;
    let disc = expr::parse_expression(parser)?;
    parser.expect(Token::RightParen)?;
    parser.ast.append(id, disc);

    let cases = parser.node(Kind::CaseElements);
    parser.expect(Token::LeftBrace)?;

    while !parser.check(&Token::RightBrace) && !parser.at_eof() {
        let label = match parser.current() {
            Token::Case => {
                let label = parser.node(Kind::CaseLabel(CaseKind::Case));
                parser.advance();
                let e = expr::parse_expression(parser)?;
                parser.ast.append(label, e);
                label
            }
            Token::Default => {
                let label = parser.node(Kind::CaseLabel(CaseKind::Default));
                parser.advance();
                label
            }
            found => {
                return Err(ParseError::expected(
                    "'case' or 'default'",
                    found.clone(),
                    parser.here(),
                ))
            }
        };
        parser.expect(Token::Colon)?;

        let body = parser.node(Kind::Directives);
        while !matches!(
            parser.current(),
            Token::Case | Token::Default | Token::RightBrace | Token::Eof
        ) {
            match parser.parse_directive() {
                Ok(Some(d)) => parser.ast.append(body, d),
                Ok(None) => {}
                Err(err) => {
                    if err.fatal {
                        return Err(err);
                    }
                    parser.record_error(err);
                    super::recovery::sync_to_statement_boundary(parser);
                }
            }
        }
        parser.ast.append(label, body);
        parser.ast.append(cases, label);
    }
    parser.expect(Token::RightBrace)?;
    parser.ast.append(id, cases);
    Ok(id)
}

fn parse_try(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let id = parser.node(Kind::Try);
    parser.expect(Token::Try)?;

    let body = defs::parse_braced_directives(parser)?;
    parser.ast.append(id, body);

    let clauses = parser.node(Kind::CatchClauses);
    while parser.check(&Token::Catch) {
        let catch = parser.node(Kind::Catch);
        parser.advance();

        let arg = if parser.eat(&Token::LeftParen) {
            let loc = parser.here();
            let name = defs::expect_identifier(parser, "catch variable")?;
            let arg = parser.node_at(Kind::CatchArg, loc);
            parser.ast.node_mut(arg).qname = Some(QName::unqualified(name));
            let ty = if parser.eat(&Token::Colon) {
                defs::parse_type(parser)?
            } else {
                parser.node(Kind::Nop)
            };
            parser.ast.append(arg, ty);
            parser.expect(Token::RightParen)?;
            arg
        } else {
            parser.node(Kind::Nop)
        };
        parser.ast.append(catch, arg);

        let cbody = defs::parse_braced_directives(parser)?;
        parser.ast.append(catch, cbody);
        parser.ast.append(clauses, catch);
    }
    parser.ast.append(id, clauses);

    let finally = if parser.eat(&Token::Finally) {
        defs::parse_braced_directives(parser)?
    } else {
        parser.node(Kind::Nop)
    };
    parser.ast.append(id, finally);

    if parser.ast.children(clauses).is_empty() && matches!(parser.ast.kind(finally), Kind::Nop) {
        return Err(ParseError::message(
            "try requires at least one catch or finally",
            parser.here(),
        ));
    }
    Ok(id)
}

fn parse_with(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let id = parser.node(Kind::With);
    parser.expect(Token::With)?;
    parser.expect(Token::LeftParen)?;
    let obj = expr::parse_expression(parser)?;
    parser.expect(Token::RightParen)?;
    parser.ast.append(id, obj);

    let body = parse_statement(parser)?;
    parser.ast.append(id, body);
    Ok(id)
}

/// `break`/`continue`, with an optional label that must sit on the same
/// source line as the keyword.
fn parse_break_continue(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let keyword_line = parser.line_at(0);
    let is_break = parser.check(&Token::Break);
    let loc = parser.here();
    parser.advance();

    let label = match parser.current() {
        Token::Identifier(name) if parser.line_at(0) == keyword_line => {
            let name = name.clone();
            parser.advance();
            Some(name)
        }
        _ => None,
    };

    let kind = if is_break {
        Kind::Break { label }
    } else {
        Kind::Continue { label }
    };
    let id = parser.node_at(kind, loc);
    parser.eat(&Token::Semicolon);
    Ok(id)
}

fn parse_return(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let keyword_line = parser.line_at(0);
    let id = parser.node(Kind::Return);
    parser.expect(Token::Return)?;

    if !parser.scope().in_function {
        parser.record_error(ParseError::message(
            "return outside of a function",
            parser.ast.node(id).loc.clone(),
        ));
    }

    let has_value = !matches!(
        parser.current(),
        Token::Semicolon | Token::RightBrace | Token::Eof
    ) && parser.line_at(0) == keyword_line;
    if has_value {
        let e = expr::parse_expression(parser)?;
        parser.ast.append(id, e);
    }
    parser.eat(&Token::Semicolon);
    Ok(id)
}

fn parse_throw(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let id = parser.node(Kind::Throw);
    parser.expect(Token::Throw)?;
    let e = expr::parse_expression(parser)?;
    parser.ast.append(id, e);
    parser.eat(&Token::Semicolon);
    Ok(id)
}

/// `# expr { directives }` — conditional compilation. The expression is
/// evaluated during the Conditional phase; a false value disables the body.
fn parse_hash(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let id = parser.node(Kind::Hash);
    parser.expect(Token::Hash)?;

    let cond = expr::parse_expression(parser)?;
    parser.ast.append(id, cond);

    let body = if parser.check(&Token::LeftBrace) {
        defs::parse_braced_directives(parser)?
    } else {
        let single = parse_statement(parser)?;
        let block = parser.node(Kind::Directives);
        parser.ast.append(block, single);
        block
    };
    parser.ast.append(id, body);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SourceTree;

    fn parse(src: &str) -> SourceTree {
        Parser::new("test.ejs", src).unwrap().parse()
    }

    fn first(tree: &SourceTree) -> NodeId {
        let dirs = tree.ast.child(tree.root, 0).unwrap();
        tree.ast.children(dirs)[0]
    }

    #[test]
    fn test_if_else_shape() {
        let tree = parse("if (x) y = 1; else y = 2;");
        assert!(!tree.has_errors());
        let stmt = first(&tree);
        assert!(matches!(tree.ast.kind(stmt), Kind::If));
        assert_eq!(tree.ast.children(stmt).len(), 3);
    }

    #[test]
    fn test_while_rewrites_to_for() {
        let tree = parse("while (x) f();");
        assert!(!tree.has_errors());
        let stmt = first(&tree);
        assert!(matches!(tree.ast.kind(stmt), Kind::For));
        assert_eq!(tree.ast.children(stmt).len(), 4);
        assert!(matches!(
            tree.ast.kind(tree.ast.child(stmt, 0).unwrap()),
            Kind::Nop
        ));
    }

    #[test]
    fn test_do_shape() {
        let tree = parse("do f(); while (x);");
        assert!(!tree.has_errors());
        let stmt = first(&tree);
        assert!(matches!(tree.ast.kind(stmt), Kind::Do));
        assert_eq!(tree.ast.children(stmt).len(), 2);
    }

    #[test]
    fn test_for_parts() {
        let tree = parse("for (i = 0; i < 3; i++) f();");
        assert!(!tree.has_errors());
        let stmt = first(&tree);
        assert!(matches!(tree.ast.kind(stmt), Kind::For));
        assert_eq!(tree.ast.children(stmt).len(), 4);
    }

    #[test]
    fn test_for_in_rewrite() {
        let tree = parse("for (x in obj) f(x);");
        assert!(!tree.has_errors());
        let stmt = first(&tree);
        match tree.ast.kind(stmt) {
            Kind::ForIn { each } => assert!(!each),
            other => panic!("expected for-in, got {:?}", other),
        }
        // Children: [iter-var, iterator get call, body].
        let call = tree.ast.child(stmt, 1).unwrap();
        assert!(matches!(tree.ast.kind(call), Kind::Call));
        let dot = tree.ast.child(call, 0).unwrap();
        let getter = tree.ast.child(dot, 1).unwrap();
        let qname = tree.ast.node(getter).qname.as_ref().unwrap();
        assert_eq!(qname.space, "iterator");
        assert_eq!(qname.name, "get");
    }

    #[test]
    fn test_for_each_uses_get_values() {
        let tree = parse("for each (v in obj) f(v);");
        let stmt = first(&tree);
        let call = tree.ast.child(stmt, 1).unwrap();
        let dot = tree.ast.child(call, 0).unwrap();
        let getter = tree.ast.child(dot, 1).unwrap();
        assert_eq!(tree.ast.node(getter).qname.as_ref().unwrap().name, "getValues");
    }

    #[test]
    fn test_switch_cases() {
        let tree = parse("switch (x) { case 1: f(); case 2: g(); break; default: h(); }");
        assert!(!tree.has_errors());
        let stmt = first(&tree);
        let cases = tree.ast.child(stmt, 1).unwrap();
        assert_eq!(tree.ast.children(cases).len(), 3);
        assert!(matches!(
            tree.ast.kind(tree.ast.children(cases)[2]),
            Kind::CaseLabel(CaseKind::Default)
        ));
    }

    #[test]
    fn test_try_catch_finally() {
        let tree = parse("try { f(); } catch (e: Error) { g(); } finally { h(); }");
        assert!(!tree.has_errors());
        let stmt = first(&tree);
        assert!(matches!(tree.ast.kind(stmt), Kind::Try));
        let clauses = tree.ast.child(stmt, 1).unwrap();
        assert_eq!(tree.ast.children(clauses).len(), 1);
        let finally = tree.ast.child(stmt, 2).unwrap();
        assert!(matches!(tree.ast.kind(finally), Kind::Block));
    }

    #[test]
    fn test_try_requires_catch_or_finally() {
        let tree = parse("try { f(); }");
        assert!(tree.has_errors());
    }

    #[test]
    fn test_break_label_same_line_only() {
        let tree = parse("while (x) { break\nouter; }");
        // The label is on the next line, so `break` takes none and `outer;`
        // parses as an expression statement.
        assert!(!tree.has_errors());
        let body = {
            let stmt = first(&tree);
            tree.ast.child(stmt, 3).unwrap()
        };
        let brk = tree.ast.children(body)[0];
        match tree.ast.kind(brk) {
            Kind::Break { label } => assert!(label.is_none()),
            other => panic!("expected break, got {:?}", other),
        }
    }

    #[test]
    fn test_hash_directive() {
        let tree = parse("# FEATURE { var x = 1; }");
        assert!(!tree.has_errors());
        let stmt = first(&tree);
        assert!(matches!(tree.ast.kind(stmt), Kind::Hash));
        assert_eq!(tree.ast.children(stmt).len(), 2);
    }
}
