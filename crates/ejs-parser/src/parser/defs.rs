//! Definition parsing: attributes, classes, interfaces, functions,
//! variables, namespaces, modules, and pragmas.

use super::{error::ParseError, Parser};
use crate::ast::{
    pack_version, Attributes, ClassInfo, FunInfo, Kind, LangLevel, LitValue, Mode, NodeFlags,
    NodeId, PragmaKind, QName, VarKind,
};
use crate::token::Token;

/// Parse an attribute run followed by the annotatable directive it
/// qualifies. `attrs`/`ns` carry attributes merged in from an enclosing
/// recursion, if any.
pub fn parse_annotatable(
    parser: &mut Parser,
    attrs: Attributes,
    ns: Option<String>,
) -> Result<NodeId, ParseError> {
    parser.enter()?;
    parser.push_scope();
    let result = parse_annotatable_inner(parser, attrs, ns);
    parser.pop_scope();
    parser.leave();
    result
}

fn parse_annotatable_inner(
    parser: &mut Parser,
    outer_attrs: Attributes,
    outer_ns: Option<String>,
) -> Result<NodeId, ParseError> {
    let doc = parser.take_doc();
    let (mut attrs, ns) = parse_attributes(parser, outer_ns)?;
    attrs |= outer_attrs;

    let id = match parser.current().clone() {
        Token::Class => parse_class(parser, attrs, ns, false)?,
        Token::Interface => parse_class(parser, attrs, ns, true)?,
        Token::Function => parse_function(parser, attrs, ns, false)?,
        Token::Var => parse_var_definition(parser, VarKind::Var, attrs, ns)?,
        Token::Let => parse_var_definition(parser, VarKind::Let, attrs, ns)?,
        Token::Const => parse_var_definition(parser, VarKind::Const, attrs, ns)?,
        Token::Namespace => parse_namespace_definition(parser, attrs, ns)?,
        Token::Type => {
            return Err(ParseError::message(
                "type definitions are not supported",
                parser.here(),
            ))
        }
        found => {
            return Err(ParseError::expected(
                "a declaration after attributes",
                found,
                parser.here(),
            ))
        }
    };

    if doc.is_some() && parser.ast.node(id).doc.is_none() {
        parser.ast.node_mut(id).doc = doc;
    }
    Ok(id)
}

/// Collect attribute keywords and at most one namespace qualifier. Two
/// namespace qualifiers on one directive are a fatal error.
pub fn parse_attributes(
    parser: &mut Parser,
    mut ns: Option<String>,
) -> Result<(Attributes, Option<String>), ParseError> {
    let mut attrs = Attributes::empty();

    loop {
        let tok = parser.current().clone();
        let flag = match tok {
            Token::Public => Attributes::PUBLIC,
            Token::Private => Attributes::PRIVATE,
            Token::Protected => Attributes::PROTECTED,
            Token::Internal => Attributes::INTERNAL,
            Token::Intrinsic => Attributes::INTRINSIC,
            Token::Static => Attributes::STATIC,
            Token::Final => Attributes::FINAL,
            Token::Native => Attributes::NATIVE,
            Token::Override => Attributes::OVERRIDE,
            Token::Enumerable => Attributes::ENUMERABLE,
            Token::Dynamic => Attributes::DYNAMIC,
            Token::Readonly => Attributes::READONLY,
            Token::Synchronized => Attributes::SYNCHRONIZED,
            Token::Volatile => Attributes::VOLATILE,
            Token::Identifier(name) => {
                if !parser.attribute_run_ends_in_annotatable() {
                    break;
                }
                if ns.is_some() {
                    return Err(ParseError::fatal(
                        "namespace qualifiers from two attribute sources in one directive",
                        parser.here(),
                    ));
                }
                parser.advance();
                ns = Some(name);
                continue;
            }
            _ => break,
        };
        parser.advance();
        attrs |= flag;
    }
    Ok((attrs, ns))
}

/// The namespace a declaration lands in: an explicit qualifier wins, then
/// the block's default namespace.
fn declared_space(parser: &Parser, ns: &Option<String>) -> String {
    ns.clone().unwrap_or_else(|| parser.declaration_space())
}

// ============================================================================
// Classes and interfaces
// ============================================================================

/// Parse `class Name [extends Base] [implements I1, I2] { ... }` or the
/// interface form. `extends`/`implements` are contextual names, not
/// reserved words.
pub fn parse_class(
    parser: &mut Parser,
    attrs: Attributes,
    ns: Option<String>,
    is_interface: bool,
) -> Result<NodeId, ParseError> {
    let loc = parser.here();
    parser.advance(); // class | interface

    let name = expect_identifier(parser, "class name")?;
    let mut info = ClassInfo {
        is_interface,
        ..Default::default()
    };

    if matches!(parser.current(), Token::Identifier(s) if s == "extends") {
        parser.advance();
        info.base = Some(parse_qualified_name(parser)?);
    }
    if matches!(parser.current(), Token::Identifier(s) if s == "implements") {
        parser.advance();
        loop {
            info.implements.push(parse_qualified_name(parser)?);
            if !parser.eat(&Token::Comma) {
                break;
            }
        }
    }

    let id = parser.node_at(Kind::Class(info), loc);
    parser.ast.node_mut(id).qname = Some(QName::new(declared_space(parser, &ns), name.clone()));
    parser.ast.node_mut(id).attributes = attrs;

    parser.push_scope();
    parser.scope_mut().in_class = true;
    parser.scope_mut().in_interface = is_interface;
    parser.scope_mut().class_name = Some(name);

    let body = parse_braced_directives(parser);
    parser.pop_scope();

    let body = body?;
    parser.ast.append(id, body);
    Ok(id)
}

// ============================================================================
// Functions
// ============================================================================

/// Parse a function definition or function expression. Children are laid
/// out as `[Args, result-type, Block]`; a missing result annotation is a
/// `Nop` placeholder, a bodyless declaration gets an empty block.
pub fn parse_function(
    parser: &mut Parser,
    attrs: Attributes,
    ns: Option<String>,
    as_expression: bool,
) -> Result<NodeId, ParseError> {
    let loc = parser.here();
    let doc = parser.take_doc();
    parser.expect(Token::Function)?;

    let mut info = FunInfo::default();
    let mut attrs = attrs;

    // get/set only when followed by the accessor's own name.
    if matches!(parser.current(), Token::Get) && matches!(parser.peek(), Token::Identifier(_)) {
        parser.advance();
        info.getter = true;
        attrs |= Attributes::GETTER;
    } else if matches!(parser.current(), Token::Set)
        && matches!(parser.peek(), Token::Identifier(_))
    {
        parser.advance();
        info.setter = true;
        attrs |= Attributes::SETTER;
    }

    let name = match parser.current().clone() {
        Token::Identifier(s) => {
            parser.advance();
            Some(s)
        }
        // Overloaded operator names.
        tok @ (Token::Plus
        | Token::Minus
        | Token::Star
        | Token::Slash
        | Token::Percent
        | Token::EqualEqual
        | Token::Less
        | Token::Greater
        | Token::LessEqual
        | Token::GreaterEqual) => {
            parser.advance();
            Some(tok.describe().trim_matches('\'').to_string())
        }
        _ if as_expression => None,
        found => {
            return Err(ParseError::expected("function name", found, parser.here()));
        }
    };

    if let (Some(n), Some(cls)) = (&name, &parser.scope().class_name) {
        if !as_expression && parser.scope().in_class && n == cls {
            info.constructor = true;
            attrs |= Attributes::CONSTRUCTOR;
        }
    }

    let id = parser.node_at(Kind::Function(FunInfo::default()), loc);
    parser.ast.node_mut(id).attributes = attrs;
    parser.ast.node_mut(id).doc = doc;
    if let Some(n) = &name {
        parser.ast.node_mut(id).qname = Some(QName::new(declared_space(parser, &ns), n.clone()));
    }

    let args = parse_parameters(parser, &mut info)?;
    parser.ast.append(id, args);

    let result_type = if parser.eat(&Token::Colon) {
        parse_type(parser)?
    } else {
        parser.node(Kind::Nop)
    };
    parser.ast.append(id, result_type);

    parser.push_scope();
    parser.scope_mut().in_function = true;
    let body = if parser.check(&Token::LeftBrace) {
        info.has_body = true;
        let block = parse_function_body(parser);
        parser.pop_scope();
        block?
    } else {
        parser.pop_scope();
        parser.eat(&Token::Semicolon);
        parser.node(Kind::Block)
    };
    parser.ast.append(id, body);

    parser.ast.node_mut(id).kind = Kind::Function(info);
    Ok(id)
}

fn parse_parameters(parser: &mut Parser, info: &mut FunInfo) -> Result<NodeId, ParseError> {
    let args = parser.node(Kind::Args);
    parser.expect(Token::LeftParen)?;

    while !parser.check(&Token::RightParen) && !parser.at_eof() {
        let rest = parser.eat(&Token::Ellipsis);
        let loc = parser.here();
        let name = expect_identifier(parser, "parameter name")?;

        let param = parser.node_at(Kind::QName, loc);
        parser.ast.node_mut(param).qname = Some(QName::unqualified(name));
        if rest {
            parser.ast.node_mut(param).flags |= NodeFlags::IS_REST;
            info.has_rest = true;
        }

        let ty = if parser.eat(&Token::Colon) {
            parse_type(parser)?
        } else {
            parser.node(Kind::Nop)
        };
        parser.ast.append(param, ty);

        let default = if parser.eat(&Token::Equal) {
            let e = super::expr::parse_assignment(parser)?;
            info.num_defaults += 1;
            e
        } else {
            parser.node(Kind::Nop)
        };
        parser.ast.append(param, default);

        parser.ast.append(args, param);
        info.num_args += 1;

        if !parser.eat(&Token::Comma) {
            break;
        }
    }
    parser.expect(Token::RightParen)?;
    Ok(args)
}

/// Function body block; an `EndFunction` marker is appended so the code
/// generator can synthesize the final return.
fn parse_function_body(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let block = parse_braced_directives(parser)?;
    let end = parser.node(Kind::EndFunction);
    parser.ast.append(block, end);
    Ok(block)
}

// ============================================================================
// Variables and namespaces
// ============================================================================

/// Parse `var|let|const name [: type] [= init], ...;`. Each declared name
/// becomes a `QName` child with `[type, init]` children (`Nop`
/// placeholders when absent).
pub fn parse_var_definition(
    parser: &mut Parser,
    kind: VarKind,
    attrs: Attributes,
    ns: Option<String>,
) -> Result<NodeId, ParseError> {
    let loc = parser.here();
    let doc = parser.take_doc();
    parser.advance(); // var | let | const

    let mut attrs = attrs;
    if kind == VarKind::Const {
        attrs |= Attributes::READONLY | Attributes::CONST;
    }

    let def = parser.node_at(Kind::VarDefinition(kind), loc);
    parser.ast.node_mut(def).attributes = attrs;
    parser.ast.node_mut(def).doc = doc;
    if kind == VarKind::Let {
        parser.ast.node_mut(def).flags |= NodeFlags::LET_SCOPE;
    }

    loop {
        let loc = parser.here();
        let name = expect_identifier(parser, "variable name")?;

        let item = parser.node_at(Kind::QName, loc);
        parser.ast.node_mut(item).qname = Some(QName::new(declared_space(parser, &ns), name));
        parser.ast.node_mut(item).attributes = attrs;

        let ty = if parser.eat(&Token::Colon) {
            parse_type(parser)?
        } else {
            parser.node(Kind::Nop)
        };
        parser.ast.append(item, ty);

        let init = if parser.eat(&Token::Equal) {
            super::expr::parse_assignment(parser)?
        } else {
            if kind == VarKind::Const {
                parser.record_error(ParseError::message(
                    "const declaration requires an initializer",
                    parser.here(),
                ));
            }
            parser.node(Kind::Nop)
        };
        parser.ast.append(item, init);

        parser.ast.append(def, item);
        if !parser.eat(&Token::Comma) {
            break;
        }
    }

    parser.eat(&Token::Semicolon);
    Ok(def)
}

/// Parse `namespace Name [= "uri"]`. Namespaces are constant definitions
/// whose value is a namespace literal; the default URI is the name itself.
pub fn parse_namespace_definition(
    parser: &mut Parser,
    attrs: Attributes,
    ns: Option<String>,
) -> Result<NodeId, ParseError> {
    let loc = parser.here();
    parser.expect(Token::Namespace)?;
    let name = expect_identifier(parser, "namespace name")?;

    let (uri, literal) = if parser.eat(&Token::Equal) {
        match parser.current().clone() {
            Token::StringLiteral(s) => {
                parser.advance();
                (s, true)
            }
            Token::Identifier(s) => {
                parser.advance();
                (s, false)
            }
            found => {
                return Err(ParseError::expected(
                    "a namespace URI or name",
                    found,
                    parser.here(),
                ))
            }
        }
    } else {
        (name.clone(), false)
    };

    let def = parser.node_at(Kind::VarDefinition(VarKind::Const), loc.clone());
    parser.ast.node_mut(def).attributes = attrs | Attributes::READONLY | Attributes::CONST;

    let item = parser.node_at(Kind::QName, loc.clone());
    parser.ast.node_mut(item).qname = Some(QName::new(declared_space(parser, &ns), name));
    parser.ast.node_mut(item).flags |= NodeFlags::IS_NAMESPACE;
    if literal {
        parser.ast.node_mut(item).flags |= NodeFlags::LITERAL_NAMESPACE;
    }

    let ty = parser.node_at(Kind::Nop, loc.clone());
    parser.ast.append(item, ty);
    let init = parser.node_at(Kind::Literal(LitValue::Namespace(uri)), loc);
    parser.ast.append(item, init);
    parser.ast.append(def, item);

    parser.eat(&Token::Semicolon);
    Ok(def)
}

// ============================================================================
// Modules and pragmas
// ============================================================================

/// Parse `module a.b.c [version] { directives }`. Inside the body the
/// default namespace is the module name.
pub fn parse_module(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let loc = parser.here();
    parser.expect(Token::Module)?;

    let mut name = expect_identifier(parser, "module name")?;
    while parser.eat(&Token::Dot) {
        name.push('.');
        name.push_str(&expect_identifier(parser, "module path segment")?);
    }

    let version = parse_optional_version(parser)?;

    let id = parser.node_at(
        Kind::Module {
            name: name.clone(),
            version,
        },
        loc,
    );
    parser.ast.node_mut(id).qname = Some(QName::unqualified(name.clone()));

    parser.push_scope();
    parser.scope_mut().default_namespace = Some(name);
    let body = parse_braced_directives(parser);
    parser.pop_scope();

    parser.ast.append(id, body?);
    Ok(id)
}

/// Parse `use ...` and `require ...` directives; results are grouped under
/// a `Pragmas` node.
pub fn parse_pragma(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let pragmas = parser.node(Kind::Pragmas);

    if parser.eat(&Token::Require) {
        let name = expect_identifier(parser, "module name")?;
        let (min, max) = parse_version_range(parser)?;
        let id = parser.node(Kind::UseModule {
            min_version: min,
            max_version: max,
        });
        parser.ast.node_mut(id).qname = Some(QName::unqualified(name));
        parser.ast.append(pragmas, id);
        parser.eat(&Token::Semicolon);
        return Ok(pragmas);
    }

    parser.expect(Token::Use)?;
    loop {
        let id = parse_one_pragma(parser)?;
        parser.ast.append(pragmas, id);
        if !parser.eat(&Token::Comma) {
            break;
        }
    }
    parser.eat(&Token::Semicolon);
    Ok(pragmas)
}

fn parse_one_pragma(parser: &mut Parser) -> Result<NodeId, ParseError> {
    match parser.current().clone() {
        Token::Strict => {
            parser.advance();
            Ok(parser.node(Kind::Pragma(PragmaKind::Mode(Mode::Strict))))
        }
        Token::Standard => {
            parser.advance();
            Ok(parser.node(Kind::Pragma(PragmaKind::Mode(Mode::Standard))))
        }
        Token::Lang => {
            parser.advance();
            let level = match parser.current() {
                Token::Identifier(s) if s == "ecma" => LangLevel::Ecma,
                Token::Identifier(s) if s == "plus" => LangLevel::Plus,
                Token::Identifier(s) if s == "fixed" => LangLevel::Fixed,
                found => {
                    return Err(ParseError::expected(
                        "'ecma', 'plus' or 'fixed'",
                        found.clone(),
                        parser.here(),
                    ))
                }
            };
            parser.advance();
            Ok(parser.node(Kind::Pragma(PragmaKind::Lang(level))))
        }
        Token::Default => {
            parser.advance();
            parser.expect(Token::Namespace)?;
            let (name, literal) = parse_namespace_name(parser)?;
            parser.set_default_namespace(name.clone());
            let id = parser.node(Kind::UseNamespace {
                default: true,
                literal,
            });
            parser.ast.node_mut(id).qname = Some(QName::unqualified(name));
            Ok(id)
        }
        Token::Namespace => {
            parser.advance();
            let (name, literal) = parse_namespace_name(parser)?;
            let id = parser.node(Kind::UseNamespace {
                default: false,
                literal,
            });
            parser.ast.node_mut(id).qname = Some(QName::unqualified(name));
            Ok(id)
        }
        Token::Module => {
            parser.advance();
            let name = expect_identifier(parser, "module name")?;
            let (min, max) = parse_version_range(parser)?;
            let id = parser.node(Kind::UseModule {
                min_version: min,
                max_version: max,
            });
            parser.ast.node_mut(id).qname = Some(QName::unqualified(name));
            Ok(id)
        }
        found => Err(ParseError::expected(
            "a pragma after 'use'",
            found,
            parser.here(),
        )),
    }
}

fn parse_namespace_name(parser: &mut Parser) -> Result<(String, bool), ParseError> {
    match parser.current().clone() {
        Token::StringLiteral(s) => {
            parser.advance();
            Ok((s, true))
        }
        Token::Identifier(s) => {
            parser.advance();
            Ok((s, false))
        }
        tok if tok.is_reserved_namespace() => {
            parser.advance();
            Ok((tok.as_name().unwrap_or_default().to_string(), false))
        }
        found => Err(ParseError::expected(
            "a namespace name",
            found,
            parser.here(),
        )),
    }
}

/// Optional `"maj.min.patch"` (or integer) version literal.
fn parse_optional_version(parser: &mut Parser) -> Result<u64, ParseError> {
    match parser.current().clone() {
        Token::StringLiteral(s) => {
            parser.advance();
            Ok(parse_version_string(&s))
        }
        Token::IntLiteral(n) => {
            parser.advance();
            Ok(pack_version(n.max(0) as u64, 0, 0))
        }
        _ => Ok(0),
    }
}

fn parse_version_range(parser: &mut Parser) -> Result<(u64, u64), ParseError> {
    let min = parse_optional_version(parser)?;
    let max = if parser.eat(&Token::Comma) {
        parse_optional_version(parser)?
    } else if min != 0 {
        min
    } else {
        0
    };
    Ok((min, max))
}

pub(crate) fn parse_version_string(s: &str) -> u64 {
    let mut parts = s.split('.').map(|p| p.parse::<u64>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    pack_version(major, minor, patch)
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Parse `{ directives }` into a `Block` node.
pub fn parse_braced_directives(parser: &mut Parser) -> Result<NodeId, ParseError> {
    let block = parser.node(Kind::Block);
    parser.expect(Token::LeftBrace)?;

    while !parser.check(&Token::RightBrace) && !parser.at_eof() {
        let before = parser.pos();
        match parser.parse_directive() {
            Ok(Some(id)) => parser.ast.append(block, id),
            Ok(None) => {}
            Err(err) => {
                if err.fatal {
                    return Err(err);
                }
                parser.record_error(err);
                super::recovery::sync_to_statement_boundary(parser);
            }
        }
        if parser.pos() == before && !parser.at_eof() && !parser.check(&Token::RightBrace) {
            parser.advance();
        }
    }
    parser.expect(Token::RightBrace)?;
    Ok(block)
}

/// Parse a possibly qualified `ns::name` reference as a plain QName.
pub fn parse_qualified_name(parser: &mut Parser) -> Result<QName, ParseError> {
    let first = expect_identifier(parser, "a name")?;
    if parser.eat(&Token::ColonColon) {
        let name = expect_identifier(parser, "a name after '::'")?;
        Ok(QName::new(first, name))
    } else {
        Ok(QName::unqualified(first))
    }
}

/// Parse a type annotation: `Void`, `*`, or a (possibly qualified) type
/// name marked with the `IS_TYPE` flag.
pub fn parse_type(parser: &mut Parser) -> Result<NodeId, ParseError> {
    match parser.current().clone() {
        Token::Void => {
            parser.advance();
            Ok(parser.node(Kind::Void))
        }
        Token::Star => {
            parser.advance();
            Ok(parser.node(Kind::Nop))
        }
        Token::Identifier(_) => {
            let loc = parser.here();
            let qname = parse_qualified_name(parser)?;
            let id = parser.node_at(Kind::QName, loc);
            parser.ast.node_mut(id).qname = Some(qname);
            parser.ast.node_mut(id).flags |= NodeFlags::IS_TYPE;
            Ok(id)
        }
        found => Err(ParseError::expected("a type name", found, parser.here())),
    }
}

pub fn expect_identifier(parser: &mut Parser, what: &str) -> Result<String, ParseError> {
    match parser.current().clone() {
        Token::Identifier(s) => {
            parser.advance();
            Ok(s)
        }
        tok => match tok.as_name() {
            Some(name) => {
                parser.advance();
                Ok(name.to_string())
            }
            None => Err(ParseError::expected(what, tok, parser.here())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Ast;

    fn parse(src: &str) -> crate::parser::SourceTree {
        Parser::new("test.ejs", src).unwrap().parse()
    }

    fn directives(tree: &crate::parser::SourceTree) -> Vec<NodeId> {
        let dirs = tree.ast.child(tree.root, 0).unwrap();
        tree.ast.children(dirs).to_vec()
    }

    fn find_kind<'a>(ast: &'a Ast, root: NodeId, pred: impl Fn(&Kind) -> bool) -> Option<NodeId> {
        ast.preorder(root).into_iter().find(|&id| pred(ast.kind(id)))
    }

    #[test]
    fn test_parse_class_with_base() {
        let tree = parse("class Shape extends Base implements Drawable, Sized {}");
        assert!(!tree.has_errors());
        let cls = directives(&tree)[0];
        match tree.ast.kind(cls) {
            Kind::Class(info) => {
                assert!(!info.is_interface);
                assert_eq!(info.base.as_ref().unwrap().name, "Base");
                assert_eq!(info.implements.len(), 2);
            }
            other => panic!("expected class, got {:?}", other),
        }
        assert_eq!(tree.ast.node(cls).qname.as_ref().unwrap().name, "Shape");
    }

    #[test]
    fn test_parse_interface() {
        let tree = parse("interface Drawable { function draw(): Void; }");
        assert!(!tree.has_errors());
        let cls = directives(&tree)[0];
        match tree.ast.kind(cls) {
            Kind::Class(info) => assert!(info.is_interface),
            other => panic!("expected interface, got {:?}", other),
        }
        let f = find_kind(&tree.ast, cls, |k| matches!(k, Kind::Function(_))).unwrap();
        match tree.ast.kind(f) {
            Kind::Function(info) => assert!(!info.has_body),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_parse_function_with_defaults_and_rest() {
        let tree = parse("function f(a, b = 2, ...rest) {}");
        assert!(!tree.has_errors());
        let f = directives(&tree)[0];
        match tree.ast.kind(f) {
            Kind::Function(info) => {
                assert_eq!(info.num_args, 3);
                assert_eq!(info.num_defaults, 1);
                assert!(info.has_rest);
                assert!(info.has_body);
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_getter_setter() {
        let tree = parse("class C { function get width(): Number { return 1; } }");
        assert!(!tree.has_errors());
        let f = find_kind(&tree.ast, tree.root, |k| matches!(k, Kind::Function(_))).unwrap();
        match tree.ast.kind(f) {
            Kind::Function(info) => assert!(info.getter),
            _ => unreachable!(),
        }
        assert!(tree
            .ast
            .node(f)
            .attributes
            .contains(Attributes::GETTER));
    }

    #[test]
    fn test_constructor_detection() {
        let tree = parse("class Point { function Point(x) {} }");
        let f = find_kind(&tree.ast, tree.root, |k| matches!(k, Kind::Function(_))).unwrap();
        match tree.ast.kind(f) {
            Kind::Function(info) => assert!(info.constructor),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_var_items_have_type_and_init_slots() {
        let tree = parse("var a: Number = 1, b;");
        assert!(!tree.has_errors());
        let def = directives(&tree)[0];
        let items = tree.ast.children(def);
        assert_eq!(items.len(), 2);
        // [type, init] for each item.
        assert_eq!(tree.ast.children(items[0]).len(), 2);
        assert!(matches!(
            tree.ast.kind(tree.ast.child(items[1], 1).unwrap()),
            Kind::Nop
        ));
    }

    #[test]
    fn test_namespace_definition() {
        let tree = parse(r#"namespace blue = "http://example.com/blue";"#);
        assert!(!tree.has_errors());
        let def = directives(&tree)[0];
        let item = tree.ast.child(def, 0).unwrap();
        assert!(tree.ast.node(item).flags.contains(NodeFlags::IS_NAMESPACE));
        assert!(tree
            .ast
            .node(item)
            .flags
            .contains(NodeFlags::LITERAL_NAMESPACE));
    }

    #[test]
    fn test_attributes_applied() {
        let tree = parse("public static var count = 0;");
        assert!(!tree.has_errors());
        let def = directives(&tree)[0];
        let attrs = tree.ast.node(def).attributes;
        assert!(attrs.contains(Attributes::PUBLIC));
        assert!(attrs.contains(Attributes::STATIC));
    }

    #[test]
    fn test_namespace_qualified_declaration() {
        let tree = parse("blue var x = 1;");
        assert!(!tree.has_errors());
        let def = directives(&tree)[0];
        let item = tree.ast.child(def, 0).unwrap();
        assert_eq!(tree.ast.node(item).qname.as_ref().unwrap().space, "blue");
    }

    #[test]
    fn test_module_sets_default_namespace() {
        let tree = parse("module acme.gfx { var x = 1; }");
        assert!(!tree.has_errors());
        let module = directives(&tree)[0];
        match tree.ast.kind(module) {
            Kind::Module { name, .. } => assert_eq!(name, "acme.gfx"),
            other => panic!("expected module, got {:?}", other),
        }
        let item = find_kind(&tree.ast, module, |k| matches!(k, Kind::QName)).unwrap();
        assert_eq!(
            tree.ast.node(item).qname.as_ref().unwrap().space,
            "acme.gfx"
        );
    }

    #[test]
    fn test_use_pragmas() {
        let tree = parse("use strict; use namespace blue; use module acme \"1.2.3\";");
        assert!(!tree.has_errors());
        let dirs = directives(&tree);
        assert_eq!(dirs.len(), 3);
        let um = find_kind(&tree.ast, dirs[2], |k| matches!(k, Kind::UseModule { .. })).unwrap();
        match tree.ast.kind(um) {
            Kind::UseModule { min_version, .. } => {
                assert_eq!(*min_version, pack_version(1, 2, 3));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_doc_comment_attached() {
        let tree = parse("/** The origin. */ var origin = 0;");
        let def = directives(&tree)[0];
        assert_eq!(tree.ast.node(def).doc.as_deref(), Some("The origin."));
    }

    #[test]
    fn test_two_namespace_qualifiers_fatal() {
        let mut parser = Parser::new("t.ejs", "red blue var x;").unwrap();
        let err = parse_annotatable(&mut parser, Attributes::empty(), None).unwrap_err();
        assert!(err.fatal);
    }
}
