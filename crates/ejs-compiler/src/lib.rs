//! Ejscript compiler core.
//!
//! The pipeline: parse each source into an arena AST, run the five
//! semantic phases (Define, Conditional, Fixup, Bind, Erase) across all
//! files, generate bytecode into per-function code buffers, and serialize
//! the binary module image. Compilation is single-threaded and re-entrant
//! exactly once, for conditional-compilation expressions.

pub mod codegen;
pub mod diagnostics;
pub mod error;
pub mod eval;
pub mod graph;
pub mod phases;
pub mod reader;
pub mod state;
pub mod writer;

use codegen::buffer::CodeBuf;
pub use diagnostics::{Diagnostic, Severity, Status};
pub use error::{CompileError, CompileResult};
use ejs_bytecode::ConstantPool;
use ejs_parser::ast::{LangLevel, Loc, Mode};
use ejs_parser::parser::SourceTree;
use ejs_parser::Parser;
use graph::{FunId, ObjGraph};
use phases::bind::BindFnFrame;
use phases::ScopeEntry;
use state::StateStack;

/// Compiler options, mirroring the driver's command-line surface.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Optimization level; level 1 enables short-jump selection.
    pub optimize: u8,
    pub warn_level: u8,
    /// Enable global slot binding.
    pub bind: bool,
    /// Emit Debug instructions with file/line information.
    pub debug: bool,
    /// Building the core (empty-interpreter) module.
    pub empty: bool,
    /// Execute the module initializer after compiling.
    pub run: bool,
    /// Aggregate dependencies into the output.
    pub merge: bool,
    /// Suppress output file emission.
    pub noout: bool,
    pub out: Option<std::path::PathBuf>,
    pub tab_width: u8,
    pub mode: Mode,
    pub lang: LangLevel,
    pub use_modules: Vec<String>,
    /// Name of the default module.
    pub module_name: String,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            optimize: 1,
            warn_level: 0,
            bind: true,
            debug: false,
            empty: false,
            run: false,
            merge: false,
            noout: false,
            out: None,
            tab_width: 4,
            mode: Mode::Standard,
            lang: LangLevel::Plus,
            use_modules: Vec::new(),
            module_name: "default".to_string(),
        }
    }
}

/// A module dependency from `use module` / `require`.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub name: String,
    pub min_version: u64,
    pub max_version: u64,
    pub checksum: u32,
}

/// One module being built: its constant pool, dependencies, and (after
/// code generation) its initializer.
#[derive(Debug)]
pub struct ModuleUnit {
    pub name: String,
    pub version: u64,
    pub pool: ConstantPool,
    pub dependencies: Vec<Dependency>,
    pub initializer: Option<FunId>,
    pub checksum: u32,
}

impl ModuleUnit {
    pub fn new(name: &str, version: u64) -> Self {
        Self {
            name: name.to_string(),
            version,
            pool: ConstantPool::new(),
            dependencies: Vec::new(),
            initializer: None,
            checksum: 0,
        }
    }
}

/// The compiler: owns the options, diagnostics, the VM object graph being
/// populated, and the modules under construction.
pub struct Compiler {
    pub options: CompilerOptions,
    pub status: Status,
    pub diagnostics: Vec<Diagnostic>,
    pub graph: ObjGraph,
    pub modules: Vec<ModuleUnit>,
    trees: Vec<SourceTree>,
    input_paths: Vec<String>,
    pub(crate) states: StateStack,
    pub(crate) scopes: Vec<ScopeEntry>,
    pub(crate) bind_fns: Vec<BindFnFrame>,
    pub(crate) hoist_counter: u32,
    pub(crate) literal_counter: u32,
    pub(crate) hash_pool: Option<ConstantPool>,
    in_compiler: bool,
}

impl Compiler {
    pub fn new(options: CompilerOptions) -> Self {
        let mut graph = ObjGraph::new();
        graph.seed_core_types();
        Self {
            options,
            status: Status::default(),
            diagnostics: Vec::new(),
            graph,
            modules: Vec::new(),
            trees: Vec::new(),
            input_paths: Vec::new(),
            states: StateStack::new(),
            scopes: Vec::new(),
            bind_fns: Vec::new(),
            hoist_counter: 0,
            literal_counter: 0,
            hash_pool: None,
            in_compiler: false,
        }
    }

    /// Parse one source file and queue it for compilation. Parse errors
    /// are accumulated; the file is still queued so later phases see a
    /// consistent tree count.
    pub fn add_source(&mut self, path: &str, source: &str) -> CompileResult<()> {
        if self.input_paths.iter().any(|p| p == path) {
            return Err(CompileError::DuplicateInput {
                path: path.to_string(),
            });
        }
        self.input_paths.push(path.to_string());

        let parser = match Parser::new(path, source) {
            Ok(parser) => parser,
            Err(lex_errors) => {
                for err in lex_errors {
                    let span = err.span();
                    let loc = Loc {
                        file: std::rc::Rc::from(path),
                        line: span.line,
                        column: span.column,
                        text: std::rc::Rc::from(""),
                    };
                    self.error(&loc, err.to_string());
                }
                return Ok(());
            }
        };

        let tree = parser.parse();
        for warning in &tree.warnings {
            let loc = Loc {
                file: std::rc::Rc::from(path),
                line: warning.span.line,
                column: warning.span.column,
                text: std::rc::Rc::from(""),
            };
            self.warn(&loc, warning.message.clone());
        }
        for err in &tree.errors {
            if err.fatal {
                self.status.fatal = true;
            }
            self.error(&err.loc, err.message.clone());
        }
        self.status.errors += tree.error_count.saturating_sub(tree.errors.len() as u32);

        self.trees.push(tree);
        Ok(())
    }

    /// Run the full pipeline over all queued sources and serialize the
    /// module image. On any error nothing is written and the error count
    /// is reported.
    pub fn compile(&mut self) -> CompileResult<Vec<u8>> {
        debug_assert!(!self.in_compiler, "compile is not re-entrant at this level");
        self.in_compiler = true;
        let result = self.compile_inner();
        self.in_compiler = false;
        result
    }

    fn compile_inner(&mut self) -> CompileResult<Vec<u8>> {
        let mut trees = std::mem::take(&mut self.trees);

        for tree in &mut trees {
            self.phase_define(tree);
        }
        for tree in &mut trees {
            if self.status.fatal {
                break;
            }
            self.phase_conditional(tree);
        }
        if !self.status.fatal {
            self.phase_fixup();
        }
        for tree in &mut trees {
            if self.status.fatal {
                break;
            }
            self.phase_bind(tree);
        }
        if !self.status.fatal {
            self.phase_erase();
        }

        if !self.status.has_errors() {
            self.phase_codegen(&trees);
        }

        self.trees = trees;

        if self.status.has_errors() {
            return Err(CompileError::Failed {
                errors: self.status.errors.max(1),
            });
        }

        self.write_modules()
    }

    /// Best-effort execution of every module initializer with the
    /// embedded constant evaluator (`--run`).
    pub fn run_initializers(&mut self) -> CompileResult<()> {
        for index in 0..self.modules.len() {
            let Some(fid) = self.modules[index].initializer else {
                continue;
            };
            let Some(code) = self.graph.fun(fid).code.clone() else {
                continue;
            };
            // The evaluator only covers the constant subset; anything
            // else is reported, not executed.
            if let Err(err) = eval::execute(&code.bytes, &self.modules[index].pool, &self.graph) {
                return Err(CompileError::fatal(format!(
                    "can not run module '{}': {}",
                    self.modules[index].name, err
                )));
            }
        }
        Ok(())
    }

    /// Render all accumulated diagnostics in emission order.
    pub fn render_diagnostics(&self, app: &str) -> String {
        let mut out = String::new();
        for d in &self.diagnostics {
            out.push_str(&d.render(app));
            out.push('\n');
        }
        out
    }

    /// Borrow the parsed trees (post-compile inspection and tests).
    pub fn trees(&self) -> &[SourceTree] {
        &self.trees
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub(crate) fn error(&mut self, loc: &Loc, message: impl Into<String>) {
        self.status.errors += 1;
        if self.diagnostics.len() < diagnostics::MAX_DIAGNOSTICS {
            self.diagnostics
                .push(Diagnostic::new(Severity::Error, message, loc));
        }
    }

    pub(crate) fn warn(&mut self, loc: &Loc, message: impl Into<String>) {
        self.status.warnings += 1;
        if self.diagnostics.len() < diagnostics::MAX_DIAGNOSTICS {
            self.diagnostics
                .push(Diagnostic::new(Severity::Warning, message, loc));
        }
    }

    pub(crate) fn internal_error(&mut self, message: impl Into<String>) {
        self.internal_error_at(&Loc::default(), message);
    }

    pub(crate) fn internal_error_at(&mut self, loc: &Loc, message: impl Into<String>) {
        self.status.errors += 1;
        if self.diagnostics.len() < diagnostics::MAX_DIAGNOSTICS {
            let message = format!("internal: {}", message.into());
            self.diagnostics
                .push(Diagnostic::new(Severity::Error, message, loc));
        }
    }

    /// Finalize a standalone code buffer into a fresh function (used by
    /// tests and synthesized functions).
    pub fn finalize_buffer(&mut self, name: &str, buf: CodeBuf) -> FunId {
        let fid = self
            .graph
            .alloc_function(ejs_parser::ast::QName::new("", name), Default::default());
        self.finalize_function(fid, buf);
        fid
    }
}
