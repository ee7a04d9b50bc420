//! End-to-end compilation scenarios: source text in, module image out.

use ejs_bytecode::disasm;
use ejs_bytecode::{Opcode, EX_CATCH, EX_FINALLY};
use ejs_compiler::{reader, Compiler, CompilerOptions};
use ejs_parser::ast::Mode;

fn compile_sources(sources: &[(&str, &str)]) -> (Compiler, Result<Vec<u8>, ejs_compiler::CompileError>) {
    compile_with(sources, CompilerOptions::default())
}

fn compile_with(
    sources: &[(&str, &str)],
    options: CompilerOptions,
) -> (Compiler, Result<Vec<u8>, ejs_compiler::CompileError>) {
    let mut compiler = Compiler::new(options);
    for (path, text) in sources {
        compiler.add_source(path, text).expect("unique input");
    }
    let result = compiler.compile();
    (compiler, result)
}

fn initializer_code(compiler: &Compiler) -> Vec<u8> {
    let module = &compiler.modules[0];
    let fid = module.initializer.expect("module initializer");
    compiler
        .graph
        .fun(fid)
        .code
        .as_ref()
        .expect("initializer code")
        .bytes
        .clone()
}

fn function_code(compiler: &Compiler, name: &str) -> Vec<u8> {
    compiler
        .graph
        .funcs
        .iter()
        .find(|f| f.qname.name == name)
        .and_then(|f| f.code.as_ref())
        .map(|c| c.bytes.clone())
        .unwrap_or_else(|| panic!("no code for function '{}'", name))
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn s1_minimum_program() {
    let (compiler, result) = compile_sources(&[("empty.ejs", "")]);
    let bytes = result.expect("empty program compiles");

    assert_eq!(compiler.modules.len(), 1);
    assert_eq!(compiler.modules[0].name, "default");
    assert!(compiler.modules[0].initializer.is_none());

    // Round-trip: magic, version, and checksum all verify.
    let modules = reader::read_file(&bytes).expect("well-formed image");
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].name, "default");
    assert!(modules[0].initializer.is_none());

    // Header + module tag + name + version + checksum + pool + end.
    assert!(bytes.len() < 64, "minimum image is small, got {}", bytes.len());
}

#[test]
fn s2_single_statement() {
    let (compiler, result) = compile_sources(&[("one.ejs", "var x = 1;")]);
    result.expect("compiles");

    let code = initializer_code(&compiler);
    let ops = disasm::opcodes(&code).unwrap();
    assert_eq!(ops, vec![Opcode::Load1, Opcode::PutGlobalSlot, Opcode::Return]);
}

#[test]
fn s3_function_and_call() {
    let source = "function add(a, b) { return a + b; } add(2, 3);";
    let (compiler, result) = compile_sources(&[("add.ejs", source)]);
    result.expect("compiles");

    let body = function_code(&compiler, "add");
    let ops = disasm::opcodes(&body).unwrap();
    assert_eq!(
        ops,
        vec![
            Opcode::GetLocalSlot0,
            Opcode::GetLocalSlot1,
            Opcode::Add,
            Opcode::ReturnValue,
        ]
    );

    let init = initializer_code(&compiler);
    let ops = disasm::opcodes(&init).unwrap();
    assert_eq!(
        ops,
        vec![
            Opcode::Load2,
            Opcode::Load3,
            Opcode::CallGlobalSlot,
            Opcode::PushResult,
            Opcode::Pop,
            Opcode::Return,
        ]
    );
}

#[test]
fn s4_if_else_short_jumps() {
    let (compiler, result) = compile_sources(&[("cond.ejs", "if (x) y = 1; else y = 2;")]);
    result.expect("compiles");

    let code = initializer_code(&compiler);
    assert!(code.len() < 30, "initializer is compact, got {}", code.len());

    let ops = disasm::opcodes(&code).unwrap();
    assert!(ops.contains(&Opcode::BranchFalse8));
    assert!(ops.contains(&Opcode::Goto8));
    assert!(!ops.contains(&Opcode::BranchFalse));
    assert!(!ops.contains(&Opcode::Goto));
}

#[test]
fn s5_try_catch_finally_with_break() {
    let source = r#"
for (i = 0; i < 3; i++) {
  try { if (i == 1) break; } catch (e) { } finally { f(); }
}
"#;
    let (compiler, result) = compile_sources(&[("loop.ejs", source)]);
    result.expect("compiles");

    let module = &compiler.modules[0];
    let fid = module.initializer.unwrap();
    let code = compiler.graph.fun(fid).code.as_ref().unwrap();

    // One record for the catch, one for the finally.
    assert_eq!(code.exceptions.len(), 2);
    assert!(code.exceptions[0].flags & EX_CATCH != 0);
    assert!(code.exceptions[1].flags & EX_FINALLY != 0);
    for e in &code.exceptions {
        assert!(e.is_ordered());
        assert!((e.handler_end as usize) <= code.bytes.len());
    }

    // Finally runs on the try exit, the catch exit, and the break path.
    let ops = disasm::opcodes(&code.bytes).unwrap();
    let finallies = ops.iter().filter(|&&op| op == Opcode::Finally).count();
    assert_eq!(finallies, 3);
}

#[test]
fn s6_conditional_compilation_enabled() {
    let sources = [
        ("features.ejs", "var FEATURE = true;"),
        ("main.ejs", "# FEATURE { var x = 1; }"),
    ];
    let (compiler, result) = compile_sources(&sources);
    result.expect("compiles");

    // The body was compiled: x exists and is assigned in the initializer.
    let global = compiler.graph.global;
    assert!(compiler
        .graph
        .block(global)
        .live()
        .any(|(_, p)| p.qname.name == "x"));

    let code = initializer_code(&compiler);
    let ops = disasm::opcodes(&code).unwrap();
    // Both assignments go to bound global slots; no trace of the hash.
    assert_eq!(ops.iter().filter(|&&op| op == Opcode::PutGlobalSlot).count(), 2);
}

#[test]
fn s6_conditional_compilation_disabled() {
    let sources = [
        ("features.ejs", "var FEATURE = false;"),
        ("main.ejs", "# FEATURE { var x = 1; }"),
    ];
    let (compiler, result) = compile_sources(&sources);
    result.expect("compiles");

    // The body's declarations are gone.
    let global = compiler.graph.global;
    assert!(!compiler
        .graph
        .block(global)
        .live()
        .any(|(_, p)| p.qname.name == "x"));

    // Only the FEATURE assignment remains.
    let code = initializer_code(&compiler);
    let ops = disasm::opcodes(&code).unwrap();
    assert_eq!(ops.iter().filter(|&&op| op == Opcode::PutGlobalSlot).count(), 1);
}

#[test]
fn switch_tests_duplicate_the_discriminant() {
    let source = r#"
switch (x) { case 1: a = 1; case 2: b = 2; break; default: c = 3; }
"#;
    let (compiler, result) = compile_sources(&[("sw.ejs", source)]);
    result.expect("compiles");

    let code = initializer_code(&compiler);
    let ops = disasm::opcodes(&code).unwrap();
    // One Dup + strict compare per case test.
    assert_eq!(ops.iter().filter(|&&op| op == Opcode::Dup).count(), 2);
    assert_eq!(
        ops.iter()
            .filter(|&&op| op == Opcode::CompareStrictlyEq)
            .count(),
        2
    );
    // The discriminant is popped at least twice: the break path and the
    // fall-out path.
    assert!(ops.iter().filter(|&&op| op == Opcode::Pop).count() >= 2);
}

#[test]
fn do_while_branches_backwards() {
    let (compiler, result) = compile_sources(&[("dw.ejs", "do f(); while (x);")]);
    result.expect("compiles");
    let ops = disasm::opcodes(&initializer_code(&compiler)).unwrap();
    assert!(ops.contains(&Opcode::BranchTrue));
    assert!(ops.contains(&Opcode::CallScopedName));
}

#[test]
fn for_in_dispatches_iterator() {
    let (compiler, result) = compile_sources(&[("fi.ejs", "for (k in obj) { g(k); }")]);
    result.expect("compiles");
    let ops = disasm::opcodes(&initializer_code(&compiler)).unwrap();
    // Iterator acquisition, duplicated dispatch, and the final pop.
    assert!(ops.contains(&Opcode::CallObjName));
    assert!(ops.contains(&Opcode::Dup));
    assert!(ops.contains(&Opcode::CallObjSlot));

    let module = &compiler.modules[0];
    let fid = module.initializer.unwrap();
    let code = compiler.graph.fun(fid).code.as_ref().unwrap();
    let iter = code
        .exceptions
        .iter()
        .find(|e| e.flags & ejs_bytecode::EX_ITERATION != 0)
        .expect("iteration record");
    // The record covers only the dispatch instruction.
    assert!(iter.try_end - iter.try_start < 8);
    assert!(iter.is_ordered());
}

// ============================================================================
// Laws
// ============================================================================

#[test]
fn law_compound_assign_matches_expanded_form() {
    let (c1, r1) = compile_sources(&[("a.ejs", "var a = 1; a += 2;")]);
    let (c2, r2) = compile_sources(&[("a.ejs", "var a = 1; a = a + 2;")]);
    r1.expect("compiles");
    r2.expect("compiles");
    assert_eq!(initializer_code(&c1), initializer_code(&c2));
}

#[test]
fn law_noout_produces_identical_ast() {
    let source = "function f(a) { return a * 2; } var y = 3;";
    let (c1, _) = compile_sources(&[("p.ejs", source)]);
    let (c2, _) = compile_with(
        &[("p.ejs", source)],
        CompilerOptions {
            noout: true,
            ..Default::default()
        },
    );
    let t1 = &c1.trees()[0];
    let t2 = &c2.trees()[0];
    let k1: Vec<_> = t1.ast.preorder(t1.root).iter().map(|&n| format!("{:?}", t1.ast.kind(n))).collect();
    let k2: Vec<_> = t2.ast.preorder(t2.root).iter().map(|&n| format!("{:?}", t2.ast.kind(n))).collect();
    assert_eq!(k1, k2);
}

// ============================================================================
// Boundaries
// ============================================================================

#[test]
fn boundary_slot_256_forces_unbound_access() {
    let mut source = String::new();
    for i in 0..300 {
        source.push_str(&format!("var g{} = 0;\n", i));
    }
    source.push_str("g5;\ng299;\n");

    let (compiler, result) = compile_sources(&[("many.ejs", &source)]);
    result.expect("compiles");

    let code = initializer_code(&compiler);
    let ops = disasm::opcodes(&code).unwrap();
    // Early slots bind, late slots fall back to by-name access.
    assert!(ops.contains(&Opcode::GetGlobalSlot));
    assert!(ops.contains(&Opcode::GetScopedName));
    assert!(ops.contains(&Opcode::PutScopedName));
}

#[test]
fn boundary_jump_distance_selects_form() {
    // Small then-arm: 8-bit branch.
    let (c, r) = compile_sources(&[("small.ejs", "if (x) y = 1;")]);
    r.expect("compiles");
    let ops = disasm::opcodes(&initializer_code(&c)).unwrap();
    assert!(ops.contains(&Opcode::BranchFalse8));

    // Large then-arm: 32-bit branch.
    let mut body = String::new();
    for i in 0..40 {
        body.push_str(&format!("y{} = 1; ", i));
    }
    let source = format!("if (x) {{ {} }}", body);
    let (c, r) = compile_sources(&[("large.ejs", &source)]);
    r.expect("compiles");
    let ops = disasm::opcodes(&initializer_code(&c)).unwrap();
    assert!(ops.contains(&Opcode::BranchFalse));
    assert!(!ops.contains(&Opcode::BranchFalse8));
}

#[test]
fn boundary_optimize_zero_uses_wide_branches() {
    let (c, r) = compile_with(
        &[("cond.ejs", "if (x) y = 1;")],
        CompilerOptions {
            optimize: 0,
            ..Default::default()
        },
    );
    r.expect("compiles");
    let ops = disasm::opcodes(&initializer_code(&c)).unwrap();
    assert!(ops.contains(&Opcode::BranchFalse));
    assert!(!ops.contains(&Opcode::BranchFalse8));
}

#[test]
fn boundary_default_parameters() {
    let source = "function f(a, b = 2) { return b; } function g(a) { return a; }";
    let (compiler, result) = compile_sources(&[("defaults.ejs", source)]);
    result.expect("compiles");

    let f = function_code(&compiler, "f");
    let f_ops = disasm::opcodes(&f).unwrap();
    assert_eq!(f_ops[0], Opcode::InitDefaultArgs8);

    let g = function_code(&compiler, "g");
    let g_ops = disasm::opcodes(&g).unwrap();
    assert!(!g_ops.contains(&Opcode::InitDefaultArgs8));
    assert!(!g_ops.contains(&Opcode::InitDefaultArgs));
}

// ============================================================================
// Invariants
// ============================================================================

#[test]
fn invariant_tree_stays_well_formed_through_pipeline() {
    let source = r#"
class Shape { var area = 0; function Shape() { this.area = 1; } }
function consume(s) { return s; }
for (k in obj) { consume(k); }
while (x) { let t = 1; t += 1; }
"#;
    let (compiler, result) = compile_sources(&[("shapes.ejs", source)]);
    result.expect("compiles");

    let tree = &compiler.trees()[0];
    tree.ast.check_well_formed(tree.root).expect("well-formed");
}

#[test]
fn invariant_module_round_trip() {
    let source = r#"
namespace blue = "http://example.com/blue";
class Point { var x = 0; var y = 0; function Point(x, y) { this.x = x; } }
function dist(p) { return p; }
var origin = 0;
"#;
    let (_, result) = compile_sources(&[("geo.ejs", source)]);
    let bytes = result.expect("compiles");

    // The reader recomputes the checksum; success means it matched.
    let modules = reader::read_file(&bytes).expect("round-trips");
    assert_eq!(modules.len(), 1);
    let module = &modules[0];

    assert!(module.classes.iter().any(|c| c.name == "Point"));
    assert!(module.functions.iter().any(|f| f.name == "dist"));
    assert!(module
        .properties
        .iter()
        .any(|p| p.name == "blue" && p.value.as_deref() == Some("http://example.com/blue")));
}

#[test]
fn invariant_corrupted_image_rejected() {
    let (_, result) = compile_sources(&[("v.ejs", "var x = 1;")]);
    let mut bytes = result.expect("compiles");
    let last = bytes.len() - 2;
    bytes[last] ^= 0xFF;
    assert!(reader::read_file(&bytes).is_err());
}

#[test]
fn invariant_stack_depth_recorded() {
    let (compiler, result) =
        compile_sources(&[("s.ejs", "function h(a, b) { return a + b * 2; } h(1, 2);")]);
    result.expect("compiles");

    let f = compiler
        .graph
        .funcs
        .iter()
        .find(|f| f.qname.name == "h")
        .unwrap();
    let code = f.code.as_ref().unwrap();
    assert!(code.max_stack >= 2);
    assert!(code.max_stack < 16);
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn error_strict_mode_rejects_unresolved_names() {
    let (compiler, result) = compile_sources(&[("strict.ejs", "use strict; y = x;")]);
    assert!(result.is_err());
    assert!(compiler.status.errors > 0);
    assert!(compiler
        .diagnostics
        .iter()
        .any(|d| d.message.contains("can not resolve")));
}

#[test]
fn error_standard_mode_allows_unresolved_names() {
    let (_, result) = compile_sources(&[("loose.ejs", "y = x;")]);
    result.expect("standard mode compiles unbound accesses");
}

#[test]
fn error_duplicate_definition() {
    let (compiler, result) = compile_sources(&[("dup.ejs", "var x = 1; var x = 2;")]);
    assert!(result.is_err());
    assert!(compiler
        .diagnostics
        .iter()
        .any(|d| d.message.contains("already defined")));
}

#[test]
fn error_missing_base_class() {
    let (compiler, result) = compile_sources(&[("base.ejs", "class A extends Missing {}")]);
    assert!(result.is_err());
    assert!(compiler
        .diagnostics
        .iter()
        .any(|d| d.message.contains("base type")));
}

#[test]
fn error_interface_method_missing() {
    let source = r#"
interface Drawable { function draw(); }
class Circle implements Drawable { }
"#;
    let (compiler, result) = compile_sources(&[("iface.ejs", source)]);
    assert!(result.is_err());
    assert!(compiler
        .diagnostics
        .iter()
        .any(|d| d.message.contains("does not implement")));
}

#[test]
fn error_void_function_returning_value() {
    let source = "function f(): Void { return 1; }";
    let (compiler, result) = compile_sources(&[("void.ejs", source)]);
    assert!(result.is_err());
    assert!(compiler
        .diagnostics
        .iter()
        .any(|d| d.message.contains("void function")));
}

#[test]
fn error_break_outside_loop() {
    let (_, result) = compile_sources(&[("b.ejs", "break;")]);
    assert!(result.is_err());
}

#[test]
fn errors_do_not_abort_collection() {
    let source = "var = 1; var ok = 2; var = 3;";
    let (compiler, result) = compile_sources(&[("multi.ejs", source)]);
    assert!(result.is_err());
    assert!(compiler.status.errors >= 2);
    // The valid declaration in between still parsed.
    let tree = &compiler.trees()[0];
    assert!(tree
        .ast
        .preorder(tree.root)
        .iter()
        .any(|&n| matches!(tree.ast.kind(n), ejs_parser::ast::Kind::VarDefinition(_))));
}

// ============================================================================
// Classes
// ============================================================================

#[test]
fn class_layout_inherits_base_slots() {
    let source = r#"
class Base { var a = 1; var b = 2; }
class Derived extends Base { var c = 3; }
"#;
    let (compiler, result) = compile_sources(&[("layout.ejs", source)]);
    result.expect("compiles");

    let base = compiler
        .graph
        .types
        .iter()
        .position(|t| t.qname.name == "Base")
        .unwrap() as u32;
    let derived = compiler
        .graph
        .types
        .iter()
        .position(|t| t.qname.name == "Derived")
        .unwrap() as u32;

    let base_count = compiler.graph.instance_slot_count(base);
    assert_eq!(
        compiler.graph.type_def(derived).instance_slot_offset,
        base_count
    );
    assert!(compiler.graph.instance_slot_count(derived) > base_count);
}

#[test]
fn class_override_takes_base_slot() {
    let source = r#"
class Base { function size() { return 1; } }
class Derived extends Base { override function size() { return 2; } }
"#;
    let (compiler, result) = compile_sources(&[("ovr.ejs", source)]);
    result.expect("compiles");

    let base = compiler
        .graph
        .types
        .iter()
        .find(|t| t.qname.name == "Base")
        .unwrap();
    let derived = compiler
        .graph
        .types
        .iter()
        .find(|t| t.qname.name == "Derived")
        .unwrap();

    let base_slot = compiler
        .graph
        .block(base.instance)
        .live()
        .find(|(_, p)| p.qname.name == "size")
        .map(|(_, p)| p.slot)
        .unwrap();
    let derived_prop = compiler
        .graph
        .block(derived.instance)
        .live()
        .find(|(_, p)| p.qname.name == "size")
        .map(|(_, p)| p.clone())
        .unwrap();

    assert_eq!(derived_prop.override_slot, Some(base_slot));
}

#[test]
fn class_default_constructor_calls_base() {
    let source = r#"
class Base { function Base() { } }
class Derived extends Base { }
"#;
    let (compiler, result) = compile_sources(&[("ctor.ejs", source)]);
    result.expect("compiles");

    let derived = compiler
        .graph
        .types
        .iter()
        .find(|t| t.qname.name == "Derived")
        .unwrap();
    let ctor = derived.constructor.expect("synthesized constructor");
    let code = compiler.graph.fun(ctor).code.as_ref().unwrap();
    let ops = disasm::opcodes(&code.bytes).unwrap();
    assert_eq!(ops, vec![Opcode::CallNextConstructor, Opcode::Return]);
}

#[test]
fn class_instance_initializers_run_in_constructor() {
    let source = r#"
class Point { var x = 7; function Point() { } }
"#;
    let (compiler, result) = compile_sources(&[("pt.ejs", source)]);
    result.expect("compiles");

    let point = compiler
        .graph
        .types
        .iter()
        .find(|t| t.qname.name == "Point")
        .unwrap();
    let ctor = point.constructor.expect("constructor");
    let code = compiler.graph.fun(ctor).code.as_ref().unwrap();
    let ops = disasm::opcodes(&code.bytes).unwrap();
    // The initializer (Load7 + store) is prepended to the user body.
    assert_eq!(ops[0], Opcode::Load7);
    assert!(matches!(ops[1], Opcode::PutThisSlot0 | Opcode::PutThisSlot1));
}

// ============================================================================
// Strict/standard parity
// ============================================================================

#[test]
fn strict_mode_option_applies_without_pragma() {
    let (_, result) = compile_with(
        &[("s.ejs", "y = x;")],
        CompilerOptions {
            mode: Mode::Strict,
            ..Default::default()
        },
    );
    assert!(result.is_err());
}
