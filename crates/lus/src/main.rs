//! The lus tooling CLI: source formatting, parse/compile checking with
//! pedantic lints, AST dumps, and standalone-bundle assembly. Running
//! scripts is the interactive driver's job and lives with the VM.

mod logging;

use anyhow::Context;
use clap::Parser;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "lus",
    version,
    about = "Tooling for the Lus runtime: format, check, AST dumps, standalone bundles"
)]
struct Lus {
    #[clap(flatten)]
    log_args: logging::LogArgs,

    /// Grant a permission (`name[:sub][=value]`); may repeat. When any
    /// are given, the registry is sealed before the command runs and file
    /// access is checked against it.
    #[arg(short = 'P', long = "pledge", global = true, value_name = "PERM")]
    pledge: Vec<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, clap::Subcommand)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Rewrite a source file in canonical form
    Format(FormatArgs),
    /// Parse and compile a source file, reporting diagnostics
    Check(CheckArgs),
    /// Dump a source file's AST as Graphviz or JSON
    Ast(AstArgs),
    /// Build or inspect standalone executables
    #[command(subcommand)]
    Bundle(BundleCmd),
}

#[derive(Debug, clap::Args)]
struct FormatArgs {
    /// Source file, or '-' for stdin
    file: PathBuf,
    /// Spaces per indent level
    #[arg(long, default_value_t = 2)]
    indent: usize,
    /// Preferred maximum line width
    #[arg(long, default_value_t = 100)]
    width: usize,
    /// Rewrite the file in place instead of printing to stdout
    #[arg(long)]
    write: bool,
}

#[derive(Debug, clap::Args)]
struct CheckArgs {
    /// Source file, or '-' for stdin
    file: PathBuf,
    /// Also run the pedantic style rules
    #[arg(long)]
    pedantic: bool,
}

#[derive(Debug, clap::Args)]
struct AstArgs {
    /// Source file, or '-' for stdin
    file: PathBuf,
    /// Write a Graphviz DOT rendering here ('-' for stdout)
    #[arg(long = "ast-graph", value_name = "FILE")]
    graph: Option<PathBuf>,
    /// Write a JSON rendering here ('-' for stdout)
    #[arg(long = "ast-json", value_name = "FILE")]
    json: Option<PathBuf>,
    /// Keep going on syntax errors and dump the partial tree
    #[arg(long)]
    recover: bool,
}

#[derive(Debug, clap::Subcommand)]
enum BundleCmd {
    /// Compile modules and append them to a host executable
    Create(BundleCreateArgs),
    /// Show the index of a bundled executable
    Info {
        /// The bundled executable
        path: PathBuf,
    },
}

#[derive(Debug, clap::Args)]
struct BundleCreateArgs {
    /// The entrypoint source file; its stem names the entry module
    entry: PathBuf,
    /// Output executable path
    #[arg(short, long)]
    output: PathBuf,
    /// Host executable to copy (defaults to this binary)
    #[arg(long)]
    host: Option<PathBuf>,
    /// Additional module as name=path; may repeat
    #[arg(long = "include", value_name = "NAME=PATH")]
    include: Vec<String>,
    /// CLI argument preserved and replayed at startup; may repeat
    #[arg(long = "arg", value_name = "ARG")]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Lus::parse();
    logging::init_logging(&cli.log_args);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "command failed");
            eprintln!("lus: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Lus) -> anyhow::Result<()> {
    let registry = build_registry(&cli.pledge)?;
    match cli.cmd {
        Command::Format(args) => run_format(&registry, args),
        Command::Check(args) => run_check(&registry, args),
        Command::Ast(args) => run_ast(&registry, args),
        Command::Bundle(BundleCmd::Create(args)) => run_bundle_create(&registry, args),
        Command::Bundle(BundleCmd::Info { path }) => run_bundle_info(path),
    }
}

/// With no -P flags, access is unrestricted. With any, the granted set is
/// sealed up front and every file touch goes through it.
fn build_registry(grants: &[String]) -> anyhow::Result<Option<pledge::Registry>> {
    if grants.is_empty() {
        return Ok(None);
    }
    let mut registry = pledge::Registry::new();
    for grant in grants {
        let (spec, value) = match grant.split_once('=') {
            Some((spec, value)) => (spec, Some(value)),
            None => (grant.as_str(), None),
        };
        registry
            .pledge(spec, value)
            .with_context(|| format!("pledging '{grant}'"))?;
    }
    registry.seal();
    Ok(Some(registry))
}

fn check_fs(
    registry: &Option<pledge::Registry>,
    sub: &str,
    path: &Path,
) -> anyhow::Result<()> {
    if let Some(registry) = registry {
        registry
            .check("fs", Some(sub), Some(&path.to_string_lossy()))
            .with_context(|| format!("accessing {}", path.display()))?;
    }
    Ok(())
}

fn read_source(
    registry: &Option<pledge::Registry>,
    path: &Path,
) -> anyhow::Result<(String, String)> {
    if path == Path::new("-") {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("reading stdin")?;
        return Ok((source, "stdin".to_owned()));
    }
    check_fs(registry, "read", path)?;
    let source =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok((source, path.display().to_string()))
}

fn run_format(registry: &Option<pledge::Registry>, args: FormatArgs) -> anyhow::Result<()> {
    let (source, name) = read_source(registry, &args.file)?;
    let options = format::Options {
        indent_width: args.indent,
        max_line_width: args.width,
    };
    let formatted = format::format(&source, &name, &options)?;
    if args.write {
        anyhow::ensure!(
            args.file != Path::new("-"),
            "cannot rewrite stdin in place"
        );
        check_fs(registry, "write", &args.file)?;
        std::fs::write(&args.file, formatted)
            .with_context(|| format!("writing {}", args.file.display()))?;
    } else {
        print!("{formatted}");
    }
    Ok(())
}

fn run_check(registry: &Option<pledge::Registry>, args: CheckArgs) -> anyhow::Result<()> {
    let (source, name) = read_source(registry, &args.file)?;
    let arena = arena::Arena::new();
    let parsed = parser::parse(&source, &name, &arena, &parser::Options::default())?;
    let ast = parsed.ast.expect("check captures the AST");
    tracing::info!(
        chunk = %name,
        ops = parsed.chunk.ops.len(),
        consts = parsed.chunk.consts.len(),
        nodes = ast.node_count,
        "compiled"
    );

    if args.pedantic {
        let warnings = lint::check(&ast);
        for warning in &warnings {
            tracing::warn!(rule = warning.rule.id(), line = warning.line, "{}", warning.message);
            eprintln!("{name}:{warning}");
        }
    }
    Ok(())
}

fn run_ast(registry: &Option<pledge::Registry>, args: AstArgs) -> anyhow::Result<()> {
    anyhow::ensure!(
        args.graph.is_some() || args.json.is_some(),
        "pass --ast-graph and/or --ast-json to choose an output"
    );
    let (source, name) = read_source(registry, &args.file)?;
    let arena = arena::Arena::new();
    let parsed = parser::parse(
        &source,
        &name,
        &arena,
        &parser::Options {
            recover: args.recover,
            ..parser::Options::default()
        },
    )?;
    let ast = parsed.ast.expect("dump captures the AST");
    for error in &ast.errors {
        eprintln!("{name}:{error}");
    }

    if let Some(out) = &args.graph {
        write_output(registry, out, &ast::to_dot(&ast))?;
    }
    if let Some(out) = &args.json {
        let json = serde_json::to_string_pretty(&ast::to_json(&ast)).expect("AST json renders");
        write_output(registry, out, &format!("{json}\n"))?;
    }
    Ok(())
}

fn write_output(
    registry: &Option<pledge::Registry>,
    path: &Path,
    contents: &str,
) -> anyhow::Result<()> {
    if path == Path::new("-") {
        print!("{contents}");
        return Ok(());
    }
    check_fs(registry, "write", path)?;
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn run_bundle_create(
    registry: &Option<pledge::Registry>,
    args: BundleCreateArgs,
) -> anyhow::Result<()> {
    let entry_name = args
        .entry
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .context("entry path has no file name")?;
    let mut writer = bundle::Writer::new(&entry_name);
    for arg in &args.args {
        writer.preserve_arg(arg);
    }

    writer.add_file(&entry_name, compile_module(registry, &args.entry)?);
    for include in &args.include {
        let (name, path) = include
            .split_once('=')
            .with_context(|| format!("--include '{include}' is not NAME=PATH"))?;
        writer.add_file(name, compile_module(registry, Path::new(path))?);
    }

    let host = match &args.host {
        Some(host) => host.clone(),
        None => std::env::current_exe().context("locating the host executable")?,
    };
    check_fs(registry, "read", &host)?;
    check_fs(registry, "write", &args.output)?;
    writer.write(&host, &args.output)?;
    println!("wrote {}", args.output.display());
    Ok(())
}

/// Compile one module to the serialized chunk bytes a bundle carries.
fn compile_module(
    registry: &Option<pledge::Registry>,
    path: &Path,
) -> anyhow::Result<Vec<u8>> {
    let (source, name) = read_source(registry, path)?;
    let arena = arena::Arena::new();
    let parsed = parser::parse(
        &source,
        &name,
        &arena,
        &parser::Options {
            capture_ast: false,
            include_comments: false,
            recover: false,
        },
    )?;
    serde_json::to_vec(&parsed.chunk).context("encoding chunk")
}

fn run_bundle_info(path: PathBuf) -> anyhow::Result<()> {
    let Some(found) = bundle::detect(&path)? else {
        anyhow::bail!("{} carries no bundle", path.display());
    };
    println!("entrypoint: {}", found.entrypoint);
    if !found.args.is_empty() {
        println!("preserved args: {}", found.args.join(" "));
    }
    for name in found.file_names() {
        let size = found.get_file(name)?.len();
        println!("  {name} ({size} bytes)");
    }
    Ok(())
}
