//! Expression parsing: the full precedence chain from comma sequences down
//! to primary expressions, object/array literals, and qualified names.
//!
//! Compound assignment `a OP= b` is rewritten to `a = a OP b`; the
//! left-hand-side subtree is shared through a `Ref` node rather than
//! duplicated, and the code generator relies on that sharing.

use super::{defs, error::ParseError, Parser};
use crate::ast::{
    BinOp, FieldInfo, Kind, LitValue, NodeFlags, NodeId, PostOp, QName, UnOp,
};
use crate::token::Token;

/// Parse a full expression, including comma sequences.
pub fn parse_expression(parser: &mut Parser) -> Result<NodeId, ParseError> {
    parser.enter()?;
    let result = parse_expression_inner(parser);
    parser.leave();
    result
}

fn parse_expression_inner(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let first = parse_assignment(parser)?;
    if !parser.check(&Token::Comma) {
        return Ok(first);
    }
    let seq = parser.node(Kind::Expressions);
    parser.ast.append(seq, first);
    while parser.eat(&Token::Comma) {
        let next = parse_assignment(parser)?;
        parser.ast.append(seq, next);
    }
    Ok(seq)
}

/// Parse an assignment expression (right associative).
pub fn parse_assignment(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let left = parse_conditional(parser)?;

    let op = match parser.current() {
        Token::Equal => None,
        Token::PlusEqual => Some(BinOp::Add),
        Token::MinusEqual => Some(BinOp::Sub),
        Token::StarEqual => Some(BinOp::Mul),
        Token::SlashEqual => Some(BinOp::Div),
        Token::PercentEqual => Some(BinOp::Rem),
        Token::LessLessEqual => Some(BinOp::Shl),
        Token::GreaterGreaterEqual => Some(BinOp::Shr),
        Token::GreaterGreaterGreaterEqual => Some(BinOp::Ushr),
        Token::AmpEqual => Some(BinOp::BitAnd),
        Token::PipeEqual => Some(BinOp::BitOr),
        Token::CaretEqual => Some(BinOp::BitXor),
        Token::AmpAmpEqual => Some(BinOp::And),
        Token::PipePipeEqual => Some(BinOp::Or),
        _ => return Ok(left),
    };

    if !is_assignable(parser, left) {
        parser.record_error(ParseError::message(
            "invalid assignment target",
            parser.here(),
        ));
    }

    let loc = parser.here();
    parser.advance();
    let right = parse_assignment(parser)?;

    let assign = parser.node_at(Kind::AssignOp(op), loc.clone());
    parser.ast.append(assign, left);

    match op {
        None => {
            parser.ast.append(assign, right);
        }
        Some(op) => {
            // a OP= b  =>  a = a OP b  with a shared LHS subtree.
            let binary = parser.node_at(Kind::BinaryOp(op), loc.clone());
            let shared = parser.node_at(Kind::Ref, loc);
            parser.ast.append_shared(shared, left);
            parser.ast.append(binary, shared);
            parser.ast.append(binary, right);
            parser.ast.append(assign, binary);
            parser.ast.node_mut(assign).flags |= NodeFlags::COMPOUND_ASSIGN;
        }
    }
    Ok(assign)
}

fn is_assignable(parser: &Parser, id: NodeId) -> bool {
    matches!(parser.ast.kind(id), Kind::QName | Kind::Dot)
}

fn parse_conditional(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let cond = parse_binary(parser, 1)?;
    if !parser.check(&Token::Question) {
        return Ok(cond);
    }
    let id = parser.node(Kind::Conditional);
    parser.advance();
    parser.ast.append(id, cond);
    let then = parse_assignment(parser)?;
    parser.ast.append(id, then);
    parser.expect(Token::Colon)?;
    let otherwise = parse_assignment(parser)?;
    parser.ast.append(id, otherwise);
    Ok(id)
}

/// Binding power of a binary operator token; `in` is suspended while a
/// `for` header initializer is being parsed.
fn binop_for(tok: &Token, noin: bool) -> Option<(BinOp, u8)> {
    let entry = match tok {
        Token::PipePipe => (BinOp::Or, 1),
        Token::AmpAmp => (BinOp::And, 2),
        Token::Pipe => (BinOp::BitOr, 3),
        Token::Caret => (BinOp::BitXor, 4),
        Token::Amp => (BinOp::BitAnd, 5),
        Token::EqualEqual => (BinOp::Eq, 6),
        Token::BangEqual => (BinOp::Ne, 6),
        Token::EqualEqualEqual => (BinOp::StrictEq, 6),
        Token::BangEqualEqual => (BinOp::StrictNe, 6),
        Token::Less => (BinOp::Lt, 7),
        Token::LessEqual => (BinOp::Le, 7),
        Token::Greater => (BinOp::Gt, 7),
        Token::GreaterEqual => (BinOp::Ge, 7),
        Token::Instanceof => (BinOp::InstanceOf, 7),
        Token::Is => (BinOp::Is, 7),
        Token::Cast => (BinOp::Cast, 7),
        Token::Like => (BinOp::Like, 7),
        Token::In if !noin => (BinOp::In, 7),
        Token::LessLess => (BinOp::Shl, 8),
        Token::GreaterGreater => (BinOp::Shr, 8),
        Token::GreaterGreaterGreater => (BinOp::Ushr, 8),
        Token::Plus => (BinOp::Add, 9),
        Token::Minus => (BinOp::Sub, 9),
        Token::Star => (BinOp::Mul, 10),
        Token::Slash => (BinOp::Div, 10),
        Token::Percent => (BinOp::Rem, 10),
        _ => return None,
    };
    Some(entry)
}

fn parse_binary(parser: &mut Parser, min_prec: u8) -> Result<NodeId, ParseError> {
    let mut left = parse_unary(parser)?;
    loop {
        let noin = parser.scope().noin;
        let Some((op, prec)) = binop_for(parser.current(), noin) else {
            break;
        };
        if prec < min_prec {
            break;
        }
        let loc = parser.here();
        parser.advance();
        let right = parse_binary(parser, prec + 1)?;

        let id = parser.node_at(Kind::BinaryOp(op), loc);
        parser.ast.append(id, left);
        parser.ast.append(id, right);
        left = id;
    }
    Ok(left)
}

fn parse_unary(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let op = match parser.current() {
        Token::Minus => Some(UnOp::Neg),
        Token::Plus => Some(UnOp::Plus),
        Token::Bang => Some(UnOp::Not),
        Token::Tilde => Some(UnOp::BitNot),
        Token::Typeof => Some(UnOp::TypeOf),
        Token::Delete => Some(UnOp::Delete),
        Token::Void => Some(UnOp::Void),
        Token::PlusPlus => Some(UnOp::PreInc),
        Token::MinusMinus => Some(UnOp::PreDec),
        _ => None,
    };
    match op {
        Some(op) => {
            let id = parser.node(Kind::UnaryOp(op));
            parser.advance();
            let operand = parse_unary(parser)?;
            parser.ast.append(id, operand);
            Ok(id)
        }
        None => parse_postfix(parser),
    }
}

fn parse_postfix(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let mut left = parse_left_hand_side(parser)?;
    loop {
        let op = match parser.current() {
            Token::PlusPlus => PostOp::Inc,
            Token::MinusMinus => PostOp::Dec,
            _ => break,
        };
        let id = parser.node(Kind::PostfixOp(op));
        parser.advance();
        parser.ast.append(id, left);
        left = id;
    }
    Ok(left)
}

fn parse_left_hand_side(parser: &mut Parser) -> Result<NodeId, ParseError> {
    if parser.check(&Token::New) {
        let new = parse_new(parser)?;
        return parse_call_tail(parser, new);
    }
    let primary = parse_primary(parser)?;
    parse_call_tail(parser, primary)
}

/// `new MemberExpr [Arguments]` — `new` binds tighter than call tails, so
/// `new C().m()` news first.
fn parse_new(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let id = parser.node(Kind::New);
    parser.expect(Token::New)?;

    let callee = if parser.check(&Token::New) {
        parse_new(parser)?
    } else {
        let primary = parse_primary(parser)?;
        parse_member_tail(parser, primary)?
    };
    parser.ast.append(id, callee);

    let args = if parser.check(&Token::LeftParen) {
        parse_arguments(parser)?
    } else {
        parser.node(Kind::Args)
    };
    parser.ast.append(id, args);
    Ok(id)
}

/// Member accesses only (no calls), for `new` callees.
fn parse_member_tail(parser: &mut Parser, mut left: NodeId) -> Result<NodeId, ParseError> {
    loop {
        match parser.current() {
            Token::Dot => {
                let id = parser.node(Kind::Dot);
                parser.advance();
                let name = parse_property_name(parser)?;
                parser.ast.append(id, left);
                parser.ast.append(id, name);
                left = id;
            }
            Token::LeftBracket => {
                let id = parser.node(Kind::Dot);
                parser.advance();
                let index = parse_expression(parser)?;
                parser.expect(Token::RightBracket)?;
                parser.ast.append(id, left);
                parser.ast.append(id, index);
                left = id;
            }
            _ => return Ok(left),
        }
    }
}

/// Member accesses and calls.
fn parse_call_tail(parser: &mut Parser, mut left: NodeId) -> Result<NodeId, ParseError> {
    loop {
        match parser.current() {
            Token::Dot | Token::LeftBracket => {
                left = parse_member_tail(parser, left)?;
            }
            Token::LeftParen => {
                let id = parser.node(Kind::Call);
                let args = parse_arguments(parser)?;
                parser.ast.append(id, left);
                parser.ast.append(id, args);
                left = id;
            }
            _ => return Ok(left),
        }
    }
}

fn parse_arguments(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let args = parser.node(Kind::Args);
    parser.expect(Token::LeftParen)?;
    while !parser.check(&Token::RightParen) && !parser.at_eof() {
        let e = parse_assignment(parser)?;
        parser.ast.append(args, e);
        if !parser.eat(&Token::Comma) {
            break;
        }
    }
    parser.expect(Token::RightParen)?;
    Ok(args)
}

/// The name to the right of a `.`: a plain or qualified property name.
fn parse_property_name(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let loc = parser.here();
    let first = defs::expect_identifier(parser, "a property name")?;
    let id = parser.node_at(Kind::QName, loc);
    if parser.eat(&Token::ColonColon) {
        let name = defs::expect_identifier(parser, "a name after '::'")?;
        parser.ast.node_mut(id).qname = Some(QName::new(first, name));
    } else {
        parser.ast.node_mut(id).qname = Some(QName::unqualified(first));
    }
    Ok(id)
}

fn parse_primary(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let loc = parser.here();
    match parser.current().clone() {
        Token::IntLiteral(n) => {
            parser.advance();
            Ok(parser.node_at(Kind::Literal(LitValue::Int(n)), loc))
        }
        Token::FloatLiteral(n) => {
            parser.advance();
            Ok(parser.node_at(Kind::Literal(LitValue::Double(n)), loc))
        }
        Token::StringLiteral(s) => {
            parser.advance();
            // A string followed by `::` is a literal namespace qualifier.
            if parser.check(&Token::ColonColon) {
                parser.advance();
                let name = defs::expect_identifier(parser, "a name after '::'")?;
                let id = parser.node_at(Kind::QName, loc);
                parser.ast.node_mut(id).qname = Some(QName::new(s, name));
                parser.ast.node_mut(id).flags |= NodeFlags::LITERAL_NAMESPACE;
                return Ok(id);
            }
            Ok(parser.node_at(Kind::Literal(LitValue::Str(s)), loc))
        }
        Token::RegexLiteral(s) => {
            parser.advance();
            Ok(parser.node_at(Kind::Literal(LitValue::Regex(s)), loc))
        }
        Token::XmlLiteral(s) => {
            parser.advance();
            Ok(parser.node_at(Kind::Literal(LitValue::Xml(s)), loc))
        }
        Token::True => {
            parser.advance();
            Ok(parser.node_at(Kind::Literal(LitValue::True), loc))
        }
        Token::False => {
            parser.advance();
            Ok(parser.node_at(Kind::Literal(LitValue::False), loc))
        }
        Token::Null => {
            parser.advance();
            Ok(parser.node_at(Kind::Literal(LitValue::Null), loc))
        }
        Token::Undefined => {
            parser.advance();
            Ok(parser.node_at(Kind::Literal(LitValue::Undefined), loc))
        }
        Token::This => {
            parser.advance();
            Ok(parser.node_at(Kind::This, loc))
        }
        Token::Super => {
            parser.advance();
            let id = parser.node_at(Kind::Super, loc);
            if parser.check(&Token::LeftParen) {
                let args = parse_arguments(parser)?;
                parser.ast.append(id, args);
            }
            Ok(id)
        }
        Token::LeftParen => {
            parser.advance();
            let e = parse_expression(parser)?;
            parser.expect(Token::RightParen)?;
            Ok(e)
        }
        Token::LeftBracket => parse_array_literal(parser),
        Token::LeftBrace => parse_object_literal(parser),
        Token::Function => {
            defs::parse_function(parser, Default::default(), None, true)
        }
        Token::Identifier(first) => {
            parser.advance();
            let id = parser.node_at(Kind::QName, loc);
            if parser.check(&Token::ColonColon) {
                parser.advance();
                let name = defs::expect_identifier(parser, "a name after '::'")?;
                parser.ast.node_mut(id).qname = Some(QName::new(first, name));
            } else {
                parser.ast.node_mut(id).qname = Some(QName::unqualified(first));
            }
            Ok(id)
        }
        tok if tok.is_reserved_namespace() => {
            parser.advance();
            let space = tok.as_name().unwrap_or_default().to_string();
            parser.expect(Token::ColonColon)?;
            let name = defs::expect_identifier(parser, "a name after '::'")?;
            let id = parser.node_at(Kind::QName, loc);
            parser.ast.node_mut(id).qname = Some(QName::new(space, name));
            Ok(id)
        }
        found => Err(ParseError::expected("an expression", found, parser.here())),
    }
}

fn parse_array_literal(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let id = parser.node(Kind::ArrayLiteral);
    parser.expect(Token::LeftBracket)?;
    while !parser.check(&Token::RightBracket) && !parser.at_eof() {
        let e = parse_assignment(parser)?;
        parser.ast.append(id, e);
        if !parser.eat(&Token::Comma) {
            break;
        }
    }
    parser.expect(Token::RightBracket)?;
    Ok(id)
}

fn parse_object_literal(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let id = parser.node(Kind::ObjectLiteral);
    parser.expect(Token::LeftBrace)?;
    while !parser.check(&Token::RightBrace) && !parser.at_eof() {
        let loc = parser.here();
        let name = match parser.current().clone() {
            Token::StringLiteral(s) => {
                parser.advance();
                s
            }
            Token::IntLiteral(n) => {
                parser.advance();
                n.to_string()
            }
            _ => defs::expect_identifier(parser, "a field name")?,
        };

        let field = parser.node_at(
            Kind::Field(FieldInfo {
                space: String::new(),
                name,
            }),
            loc,
        );
        parser.expect(Token::Colon)?;
        let value = parse_assignment(parser)?;
        parser.ast.append(field, value);
        parser.ast.append(id, field);

        if !parser.eat(&Token::Comma) {
            break;
        }
    }
    parser.expect(Token::RightBrace)?;
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
    fn test_precedence() {
        let tree = parse("x = 1 + 2 * 3;");
        assert!(!tree.has_errors());
        let assign = first(&tree);
        let add = tree.ast.right(assign).unwrap();
        assert!(matches!(tree.ast.kind(add), Kind::BinaryOp(BinOp::Add)));
        let mul = tree.ast.right(add).unwrap();
        assert!(matches!(tree.ast.kind(mul), Kind::BinaryOp(BinOp::Mul)));
    }

    #[test]
    fn test_compound_assign_shares_lhs() {
        let tree = parse("a += b;");
        assert!(!tree.has_errors());
        let assign = first(&tree);
        assert!(matches!(tree.ast.kind(assign), Kind::AssignOp(Some(BinOp::Add))));
        assert!(tree
            .ast
            .node(assign)
            .flags
            .contains(NodeFlags::COMPOUND_ASSIGN));

        let lhs = tree.ast.left(assign).unwrap();
        let binary = tree.ast.right(assign).unwrap();
        let shared = tree.ast.left(binary).unwrap();
        assert!(matches!(tree.ast.kind(shared), Kind::Ref));
        // The Ref points at the very same node as the assignment target.
        assert_eq!(tree.ast.child(shared, 0), Some(lhs));
        assert!(tree.ast.check_well_formed(assign).is_ok());
    }

    #[test]
    fn test_conditional() {
        let tree = parse("x = a ? 1 : 2;");
        assert!(!tree.has_errors());
        let assign = first(&tree);
        let cond = tree.ast.right(assign).unwrap();
        assert!(matches!(tree.ast.kind(cond), Kind::Conditional));
        assert_eq!(tree.ast.children(cond).len(), 3);
    }

    #[test]
    fn test_call_with_args() {
        let tree = parse("add(2, 3);");
        assert!(!tree.has_errors());
        let call = first(&tree);
        assert!(matches!(tree.ast.kind(call), Kind::Call));
        let args = tree.ast.right(call).unwrap();
        assert_eq!(tree.ast.children(args).len(), 2);
    }

    #[test]
    fn test_member_chain() {
        let tree = parse("a.b.c();");
        let call = first(&tree);
        assert!(matches!(tree.ast.kind(call), Kind::Call));
        let dot = tree.ast.left(call).unwrap();
        assert!(matches!(tree.ast.kind(dot), Kind::Dot));
    }

    #[test]
    fn test_index_is_dot_shaped() {
        let tree = parse("a[i + 1];");
        let dot = first(&tree);
        assert!(matches!(tree.ast.kind(dot), Kind::Dot));
        let idx = tree.ast.right(dot).unwrap();
        assert!(matches!(tree.ast.kind(idx), Kind::BinaryOp(BinOp::Add)));
    }

    #[test]
    fn test_new_with_args() {
        let tree = parse("new Point(1, 2);");
        let new = first(&tree);
        assert!(matches!(tree.ast.kind(new), Kind::New));
        let args = tree.ast.right(new).unwrap();
        assert_eq!(tree.ast.children(args).len(), 2);
    }

    #[test]
    fn test_super_call() {
        let tree = parse("class A { function A() { super(1); } }");
        assert!(!tree.has_errors());
        let sup = tree
            .ast
            .preorder(tree.root)
            .into_iter()
            .find(|&id| matches!(tree.ast.kind(id), Kind::Super))
            .unwrap();
        assert_eq!(tree.ast.children(sup).len(), 1);
    }

    #[test]
    fn test_qualified_name() {
        let tree = parse("blue::x = 1;");
        let assign = first(&tree);
        let lhs = tree.ast.left(assign).unwrap();
        let qname = tree.ast.node(lhs).qname.as_ref().unwrap();
        assert_eq!(qname.space, "blue");
        assert_eq!(qname.name, "x");
    }

    #[test]
    fn test_literal_namespace_qualifier() {
        let tree = parse(r#""http://x"::y;"#);
        let q = first(&tree);
        assert!(tree
            .ast
            .node(q)
            .flags
            .contains(NodeFlags::LITERAL_NAMESPACE));
    }

    #[test]
    fn test_object_and_array_literals() {
        let tree = parse("x = { a: 1, \"b\": 2 }; y = [1, 2, 3];");
        assert!(!tree.has_errors());
        let dirs = tree.ast.child(tree.root, 0).unwrap();
        let obj = tree.ast.right(tree.ast.children(dirs)[0]).unwrap();
        assert!(matches!(tree.ast.kind(obj), Kind::ObjectLiteral));
        assert_eq!(tree.ast.children(obj).len(), 2);
        let arr = tree.ast.right(tree.ast.children(dirs)[1]).unwrap();
        assert!(matches!(tree.ast.kind(arr), Kind::ArrayLiteral));
        assert_eq!(tree.ast.children(arr).len(), 3);
    }

    #[test]
    fn test_function_expression() {
        let tree = parse("x = function (a) { return a; };");
        assert!(!tree.has_errors());
        let assign = first(&tree);
        let f = tree.ast.right(assign).unwrap();
        assert!(matches!(tree.ast.kind(f), Kind::Function(_)));
    }

    #[test]
    fn test_postfix_and_prefix() {
        let tree = parse("i++; --j;");
        let dirs = tree.ast.child(tree.root, 0).unwrap();
        let post = tree.ast.children(dirs)[0];
        assert!(matches!(tree.ast.kind(post), Kind::PostfixOp(PostOp::Inc)));
        let pre = tree.ast.children(dirs)[1];
        assert!(matches!(tree.ast.kind(pre), Kind::UnaryOp(UnOp::PreDec)));
    }

    #[test]
    fn test_is_cast_operators() {
        let tree = parse("x = a is Number; y = b cast String;");
        assert!(!tree.has_errors());
        let dirs = tree.ast.child(tree.root, 0).unwrap();
        let is = tree.ast.right(tree.ast.children(dirs)[0]).unwrap();
        assert!(matches!(tree.ast.kind(is), Kind::BinaryOp(BinOp::Is)));
    }

    #[test]
    fn test_regex_literal_expression() {
        let tree = parse("r = /ab+/g;");
        assert!(!tree.has_errors());
        let assign = first(&tree);
        let rhs = tree.ast.right(assign).unwrap();
        assert!(matches!(
            tree.ast.kind(rhs),
            Kind::Literal(LitValue::Regex(_))
        ));
    }
}
