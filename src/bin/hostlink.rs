//! hostlink command-line tool.
//!
//! ```text
//! hostlink <COMMAND>
//!
//! Commands:
//!   profile   Print the detected platform profile and search paths
//!   symbols   List the builtin symbols registered into every backend
//!   classify  Classify backend diagnostic lines
//!   run       Compile C sources with libtcc and run or write the result
//! ```
//!
//! Set `RUST_LOG=debug` to trace session configuration.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};

use hostlink::core::{BackendSession, OutputMode, PltConfig, SessionConfig};
use hostlink::diagnostics::classify;
use hostlink::platform::{self, Arch, OsKind, PathKind, PlatformProfile};
use hostlink::registry::BuiltinRegistry;
use hostlink::tcc::TccLibrary;

#[derive(Parser)]
#[command(name = "hostlink")]
#[command(version)]
#[command(about = "Run-time C compilation linked against the host process", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the detected platform profile and search paths
    Profile,

    /// List the builtin symbols registered into every backend
    Symbols(SymbolsArgs),

    /// Classify backend diagnostic lines
    Classify {
        /// Raw diagnostic text, one message per argument
        #[arg(required = true)]
        messages: Vec<String>,
    },

    /// Compile C sources with libtcc and run or write the result
    Run(RunArgs),
}

#[derive(Args)]
struct SymbolsArgs {
    /// Filter for this operating system instead of the detected one
    #[arg(long, value_enum)]
    os: Option<OsChoice>,

    /// Also list builtins unavailable on the selected platform
    #[arg(long)]
    unavailable: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OsChoice {
    Linux,
    Darwin,
    Windows,
    Unix,
}

impl From<OsChoice> for OsKind {
    fn from(choice: OsChoice) -> Self {
        match choice {
            OsChoice::Linux => OsKind::Linux,
            OsChoice::Darwin => OsKind::Darwin,
            OsChoice::Windows => OsKind::Windows,
            OsChoice::Unix => OsKind::Unix,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ModeChoice {
    Memory,
    Object,
    Executable,
    Preprocess,
}

impl From<ModeChoice> for OutputMode {
    fn from(choice: ModeChoice) -> Self {
        match choice {
            ModeChoice::Memory => OutputMode::Memory,
            ModeChoice::Object => OutputMode::Object,
            ModeChoice::Executable => OutputMode::Executable,
            ModeChoice::Preprocess => OutputMode::Preprocess,
        }
    }
}

#[derive(Args)]
struct RunArgs {
    /// C source files
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Compile this source text as well
    #[arg(short = 'e', long = "eval", value_name = "SOURCE")]
    eval: Vec<String>,

    /// Path to libtcc (defaults to HOSTLINK_LIBTCC, then the usual library names)
    #[arg(long, value_name = "PATH")]
    libtcc: Option<PathBuf>,

    /// Output mode
    #[arg(long, value_enum, default_value_t = ModeChoice::Memory)]
    mode: ModeChoice,

    /// Output file for object and executable modes
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Add an include directory
    #[arg(short = 'I', value_name = "DIR")]
    include: Vec<PathBuf>,

    /// Add a library directory
    #[arg(short = 'L', value_name = "DIR")]
    library: Vec<PathBuf>,

    /// Pass an option to the backend
    #[arg(long = "option", value_name = "OPT")]
    options: Vec<String>,

    /// Resolve lazily bound symbols on first call
    #[arg(long, conflicts_with = "eager")]
    lazy: bool,

    /// Resolve lazily bound symbols at relocation
    #[arg(long)]
    eager: bool,

    /// Bind these symbols through the lazy symbol table
    #[arg(long = "bind", value_name = "SYMBOL")]
    bind: Vec<String>,

    /// Print session and symbol table statistics after running
    #[arg(long)]
    stats: bool,

    /// Arguments passed to the program's main
    #[arg(last = true)]
    args: Vec<String>,
}

impl RunArgs {
    fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::from_env().with_output_mode(self.mode.into());
        config.extra_options.extend(self.options.iter().cloned());
        config.include_paths.extend(self.include.iter().cloned());
        config.library_paths.extend(self.library.iter().cloned());
        if self.lazy {
            config.plt = Some(PltConfig::lazy());
        } else if self.eager {
            config.plt = Some(PltConfig::eager());
        } else if !self.bind.is_empty() && config.plt.is_none() {
            config.plt = Some(PltConfig::default());
        }
        config
    }
}

fn print_profile() {
    let profile = PlatformProfile::current();
    println!("os:       {}", profile.os);
    println!("arch:     {}", profile.arch);
    println!("options:  {}", profile.option_string());
    for (label, kind) in [("include", PathKind::Include), ("library", PathKind::Library)] {
        for path in platform::search_paths(kind) {
            println!("{label}:  {}", path.display());
        }
    }
}

fn print_symbols(args: &SymbolsArgs) {
    let profile = match args.os {
        Some(os) => PlatformProfile::new(os.into(), Arch::host()),
        None => PlatformProfile::current().clone(),
    };
    let registry = BuiltinRegistry::for_profile(&profile);
    for symbol in registry.globals().iter().chain(registry.symbols()) {
        println!("{:<24} {}", symbol.name, symbol.address);
    }
    if args.unavailable {
        for name in registry.unavailable() {
            println!("{name:<24} unavailable");
        }
    }
    eprintln!("{} builtins for {}", registry.len(), profile);
}

fn run(args: RunArgs) -> Result<i32, Box<dyn std::error::Error>> {
    if args.files.is_empty() && args.eval.is_empty() {
        return Err("nothing to compile".into());
    }

    let library = match &args.libtcc {
        Some(path) => TccLibrary::open(path)?,
        None => TccLibrary::open_default()?,
    };
    let config = args.session_config();
    let mode = config.output_mode;
    let mut session = BackendSession::create_with(|| library.instance(), config)?;

    for name in &args.bind {
        session.add_lazy_symbol(name)?;
    }
    if !args.bind.is_empty() {
        session.bind_lazy_stubs()?;
    }

    for file in &args.files {
        session.compile_file(file)?;
    }
    for source in &args.eval {
        session.compile_source(source)?;
    }

    let status = if mode.is_in_process() {
        session.relocate()?;
        let mut argv = vec![args
            .files
            .first()
            .map_or_else(|| "hostlink".to_string(), |f| f.display().to_string())];
        argv.extend(args.args.iter().cloned());
        unsafe { session.run_main(&argv)? }
    } else {
        let output = args
            .output
            .clone()
            .ok_or("--output is required outside memory mode")?;
        session.output_file(&output)?;
        0
    };

    if args.stats {
        eprint!("{}", session.stats());
    }
    Ok(status)
}

/// Truncate a `main` return value the way the C runtime does.
fn exit_status_byte(status: i32) -> u8 {
    (status & 0xff) as u8
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Profile => print_profile(),
        Commands::Symbols(args) => print_symbols(&args),
        Commands::Classify { messages } => {
            for message in messages {
                println!("{}\t{}", classify(&message), message);
            }
        }
        Commands::Run(args) => {
            return match run(args) {
                Ok(status) => ExitCode::from(exit_status_byte(status)),
                Err(e) => {
                    eprintln!("hostlink: error: {e}");
                    ExitCode::FAILURE
                }
            };
        }
    }
    ExitCode::SUCCESS
}
