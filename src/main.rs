/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tmasm::ast::CasePolicy;
use tmasm::file_reader::{AsmFileReader, FileReader};
use tmasm::{AssemblerOptions, assemble};

const SYSTEM_INCLUDE_DIR: &str = "/opt/parachute/include/tmasm";

#[derive(Parser)]
#[clap(name = "tmasm", version, about = "Transputer macro assembler")]
struct Opts {
    /// Root assembly source file
    source: PathBuf,

    /// Reserved: ELF object output
    #[clap(short = 'o', long = "output", value_name = "ELF")]
    output: Option<PathBuf>,

    /// Flat binary output file
    #[clap(short = 'b', long = "binary", value_name = "FILE")]
    binary: Option<PathBuf>,

    /// Listing output file
    #[clap(short = 'l', long = "listing", value_name = "FILE")]
    listing: Option<PathBuf>,

    /// Add a directory to the include search path (repeatable)
    #[clap(short = 'I', long = "includepath", value_name = "DIR")]
    include_paths: Vec<PathBuf>,

    /// Treat symbol and macro names as case sensitive
    #[clap(short = 'x', long = "caseSensitive")]
    case_sensitive: bool,

    /// Print the include search path before assembling
    #[clap(short = 's', long = "showIncludePaths")]
    show_include_paths: bool,

    /// Trace the statement parser
    #[clap(short = 'p')]
    trace_parser: bool,

    /// Trace macro expansion and include handling
    #[clap(short = 'e')]
    trace_expansion: bool,

    /// Dump parsed statements
    #[clap(short = 'P')]
    trace_ast: bool,

    /// Trace code generation and convergence
    #[clap(short = 'c')]
    trace_codegen: bool,

    /// Enable debug logging everywhere
    #[clap(long)]
    debug: bool,

    /// Restrict logging to warnings and errors
    #[clap(long)]
    warn: bool,

    /// Explicit log level: error, warn, info, debug or trace
    #[clap(long, value_name = "LEVEL")]
    level: Option<String>,

    /// Show the logging module in each record
    #[clap(long)]
    classes: bool,

    /// Show the thread name in each record
    #[clap(long)]
    threads: bool,

    /// Show timestamps in each record
    #[clap(long)]
    times: bool,
}

fn main() {
    let opts = Opts::parse();
    init_logging(&opts);
    if let Err(e) = run(&opts) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn run(opts: &Opts) -> Result<()> {
    let reader = AsmFileReader;

    let mut include_paths = opts.include_paths.clone();
    let system = PathBuf::from(SYSTEM_INCLUDE_DIR);
    if reader.is_dir(&system) {
        include_paths.push(system);
    }

    if opts.show_include_paths {
        println!("include search path:");
        println!("  .");
        for dir in &include_paths {
            println!("  {}", dir.display());
        }
    }

    if opts.output.is_some() {
        warn!("ELF object output is reserved and not yet written");
    }

    let options = AssemblerOptions {
        case_policy: if opts.case_sensitive {
            CasePolicy::Sensitive
        } else {
            CasePolicy::Insensitive
        },
        include_paths,
    };

    let assembly = assemble(&opts.source, &options, &reader)?;

    if let Some(path) = &opts.binary {
        let image = assembly.binary()?;
        fs::write(path, &image)
            .with_context(|| format!("Failed to write binary file {}", path.display()))?;
        info!("wrote {} byte(s) to {}", image.len(), path.display());
    }

    if let Some(path) = &opts.listing {
        let text = assembly.listing()?;
        fs::write(path, &text)
            .with_context(|| format!("Failed to write listing file {}", path.display()))?;
        info!("wrote listing to {}", path.display());
    }

    println!("Successfully assembled {}", opts.source.display());
    Ok(())
}

fn init_logging(opts: &Opts) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if opts.warn {
        builder.filter_level(log::LevelFilter::Warn);
    }
    if opts.debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    if let Some(level) = &opts.level {
        match level.parse::<log::LevelFilter>() {
            Ok(parsed) => {
                builder.filter_level(parsed);
            }
            Err(_) => eprintln!("unknown log level '{}', keeping the default", level),
        }
    }
    if opts.trace_parser || opts.trace_ast {
        builder.filter_module("tmasm::parser", log::LevelFilter::Trace);
    }
    if opts.trace_expansion {
        builder.filter_module("tmasm::macro_manager", log::LevelFilter::Debug);
        builder.filter_module("tmasm::source_stream", log::LevelFilter::Debug);
    }
    if opts.trace_codegen {
        builder.filter_module("tmasm::assembler", log::LevelFilter::Debug);
    }

    let times = opts.times;
    let classes = opts.classes;
    let threads = opts.threads;
    builder.format(move |buf, record| {
        let mut prefix = String::new();
        if times {
            prefix.push_str(&format!("{} ", buf.timestamp()));
        }
        if threads {
            let current = std::thread::current();
            prefix.push_str(&format!("[{}] ", current.name().unwrap_or("?")));
        }
        if classes {
            prefix.push_str(&format!("{}: ", record.target()));
        }
        writeln!(buf, "{}{} {}", prefix, record.level(), record.args())
    });
    builder.init();
}
