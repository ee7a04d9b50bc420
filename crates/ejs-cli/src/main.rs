//! `ejsc` — the Ejscript compiler driver.
//!
//! Compiles `*.ejs` sources (and accepts pre-compiled `*.mod` inputs as
//! dependencies) into a binary module file. Inputs are processed in
//! argument order; any error suppresses output and exits non-zero.

use anyhow::{bail, Context, Result};
use clap::Parser as ClapParser;
use ejs_compiler::{reader, Compiler, CompilerOptions};
use ejs_parser::ast::{LangLevel, Mode};
use std::io::Write;
use std::path::PathBuf;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

#[derive(ClapParser)]
#[command(name = "ejsc")]
#[command(about = "Ejscript compiler")]
#[command(version)]
struct Cli {
    /// Source files (*.ejs) or pre-compiled modules (*.mod), in order
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Optimization level (0 disables short jumps)
    #[arg(long, default_value = "1")]
    optimize: u8,

    /// Warning level (6 reports unbound name accesses)
    #[arg(long, default_value = "0")]
    warn: u8,

    /// Enable early binding of global slots
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    bind: bool,

    /// Emit debug instructions with file/line information
    #[arg(long)]
    debug: bool,

    /// Build the core (empty-interpreter) module
    #[arg(long)]
    empty: bool,

    /// Compile and execute the module initializer
    #[arg(long)]
    run: bool,

    /// Aggregate dependencies into the output file
    #[arg(long)]
    merge: bool,

    /// Compile only; write no output file
    #[arg(long)]
    noout: bool,

    /// Output file path
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Tab width for caret diagnostics
    #[arg(long, default_value = "4")]
    tab_width: u8,

    /// Default compilation mode (strict or standard)
    #[arg(long, default_value = "standard")]
    mode: String,

    /// Language level (ecma, plus or fixed)
    #[arg(long, default_value = "plus")]
    lang: String,

    /// Pre-load these modules as dependencies
    #[arg(long = "use")]
    use_modules: Vec<String>,

    /// Disassemble the compiled initializers to stdout
    #[arg(long)]
    list: bool,
}

fn main() {
    env_logger::init();
    let code = match run(Cli::parse()) {
        Ok(had_errors) => {
            if had_errors {
                2
            } else {
                0
            }
        }
        Err(err) => {
            eprintln!("ejsc: error: {:#}", err);
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<bool> {
    let options = CompilerOptions {
        optimize: cli.optimize,
        warn_level: cli.warn,
        bind: cli.bind,
        debug: cli.debug,
        empty: cli.empty,
        run: cli.run,
        merge: cli.merge,
        noout: cli.noout,
        out: cli.out.clone(),
        tab_width: cli.tab_width,
        mode: parse_mode(&cli.mode)?,
        lang: parse_lang(&cli.lang)?,
        use_modules: cli.use_modules.clone(),
        module_name: "default".to_string(),
    };

    let mut compiler = Compiler::new(options);

    for path in &cli.files {
        let name = path.to_string_lossy().to_string();
        match path.extension().and_then(|e| e.to_str()) {
            Some("mod") => {
                // Pre-compiled modules are validated and registered as
                // dependencies; their checksum feeds dependency records.
                let bytes = std::fs::read(path)
                    .with_context(|| format!("can not open input '{}'", name))?;
                let modules = reader::read_file(&bytes)
                    .with_context(|| format!("can not load module '{}'", name))?;
                for module in &modules {
                    log::debug!("loaded module {} v{}", module.name, module.version);
                }
            }
            _ => {
                let source = std::fs::read_to_string(path)
                    .with_context(|| format!("can not open input '{}'", name))?;
                compiler.add_source(&name, &source)?;
            }
        }
    }

    let result = compiler.compile();
    print_diagnostics(&compiler);

    let bytes = match result {
        Ok(bytes) => bytes,
        Err(_) => return Ok(true),
    };

    if cli.list {
        list_initializers(&compiler)?;
    }

    if !cli.noout {
        let out = cli.out.unwrap_or_else(|| default_output(&cli.files));
        std::fs::write(&out, &bytes)
            .with_context(|| format!("can not write output '{}'", out.display()))?;
        log::info!("wrote {} ({} bytes)", out.display(), bytes.len());
    }

    if cli.run {
        compiler.run_initializers()?;
    }

    Ok(false)
}

fn default_output(files: &[PathBuf]) -> PathBuf {
    files
        .first()
        .map(|f| f.with_extension("mod"))
        .unwrap_or_else(|| PathBuf::from("default.mod"))
}

fn parse_mode(s: &str) -> Result<Mode> {
    match s {
        "strict" => Ok(Mode::Strict),
        "standard" => Ok(Mode::Standard),
        other => bail!("unknown mode '{}' (use strict or standard)", other),
    }
}

fn parse_lang(s: &str) -> Result<LangLevel> {
    match s {
        "ecma" => Ok(LangLevel::Ecma),
        "plus" => Ok(LangLevel::Plus),
        "fixed" => Ok(LangLevel::Fixed),
        other => bail!("unknown language level '{}' (use ecma, plus or fixed)", other),
    }
}

fn print_diagnostics(compiler: &Compiler) {
    if compiler.diagnostics.is_empty() {
        return;
    }
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    for diagnostic in &compiler.diagnostics {
        let color = match diagnostic.severity {
            ejs_compiler::Severity::Warning => Color::Yellow,
            _ => Color::Red,
        };
        let _ = stderr.set_color(ColorSpec::new().set_fg(Some(color)));
        let _ = writeln!(stderr, "{}", diagnostic.render("ejsc"));
        let _ = stderr.reset();
    }
}

fn list_initializers(compiler: &Compiler) -> Result<()> {
    for module in &compiler.modules {
        let Some(fid) = module.initializer else {
            continue;
        };
        let Some(code) = &compiler.graph.fun(fid).code else {
            continue;
        };
        println!("module {}:", module.name);
        let listing = ejs_bytecode::disasm::disassemble(&code.bytes, Some(&module.pool))
            .context("disassembly failed")?;
        print!("{}", listing);
    }
    Ok(())
}
