//! Cinder Compiler CLI
//!
//! Command-line interface for compiling C sources to executables or
//! assembly, running front-end checks, and generating shell completions.

use clap::{CommandFactory, Parser as ClapParser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use cinderc::{CompileError, CompilerConfig, Target};

#[derive(ClapParser)]
#[command(name = "cinderc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Cinder compiler - compile a C subset to x86-64 assembly", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum TargetArg {
    Linux,
    Darwin,
}

impl From<TargetArg> for Target {
    fn from(value: TargetArg) -> Target {
        match value {
            TargetArg::Linux => Target::Linux,
            TargetArg::Darwin => Target::Darwin,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a .c file to an executable (or assembly with -S)
    Build {
        /// Input .c source file
        input: PathBuf,

        /// Output path (defaults to the input filename without .c, or
        /// with .s under -S)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after emitting assembly
        #[arg(short = 'S', long)]
        emit_asm: bool,

        /// Keep the intermediate .s file when linking
        #[arg(long)]
        keep_asm: bool,

        /// Additional include directories for #include resolution
        #[arg(short = 'I', value_name = "DIR")]
        include: Vec<PathBuf>,

        /// Target platform (defaults to the host)
        #[arg(long, value_enum)]
        target: Option<TargetArg>,

        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run the front end only and report errors
    Check {
        /// Input .c source files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Additional include directories for #include resolution
        #[arg(short = 'I', value_name = "DIR")]
        include: Vec<PathBuf>,

        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build {
            input,
            output,
            emit_asm,
            keep_asm,
            include,
            target,
            config,
        } => {
            let mut config = load_config(config.as_deref());
            config.include_dirs.extend(include);
            if let Some(target) = target {
                config.target = target.into();
            }
            config.keep_asm |= keep_asm;
            run_build(&input, output, emit_asm, &config);
        }
        Commands::Check {
            inputs,
            include,
            config,
        } => {
            let mut config = load_config(config.as_deref());
            config.include_dirs.extend(include);
            run_check(&inputs, &config);
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "cinderc", &mut io::stdout());
        }
    }
}

fn load_config(path: Option<&Path>) -> CompilerConfig {
    match path {
        Some(path) => match CompilerConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => fail(e),
        },
        None => CompilerConfig::new(),
    }
}

fn run_build(input: &Path, output: Option<PathBuf>, emit_asm: bool, config: &CompilerConfig) {
    let output = output.unwrap_or_else(|| {
        let stem = input.file_stem().unwrap_or_default();
        let mut path = PathBuf::from(stem);
        if emit_asm {
            path.set_extension("s");
        }
        path
    });
    let result = if emit_asm {
        cinderc::compile_file(input, &output, config)
    } else {
        cinderc::build_executable(input, &output, config)
    };
    if let Err(e) = result {
        fail(e);
    }
}

fn run_check(inputs: &[PathBuf], config: &CompilerConfig) {
    let mut failed = None;
    for input in inputs {
        if let Err(e) = cinderc::check_file(input, config) {
            eprintln!("{}: {}", input.display(), e);
            failed.get_or_insert(e.exit_code());
        }
    }
    if let Some(code) = failed {
        process::exit(code);
    }
}

fn fail(e: CompileError) -> ! {
    eprintln!("error: {}", e);
    process::exit(e.exit_code());
}
