use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use asmlink::cache::{self, FileCacheStore, MachineId, ScriptSource};
use asmlink::config::LinkConfig;
use asmlink::module::tables::Coercion;
use asmlink::module::{HeapBuffer, Module, Value};
use asmlink::resolver::HostResolver;
use asmlink::{Arch, sample};

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum SampleArg {
    /// Identity, a global read and a pooled constant
    #[default]
    Identity,
    /// Adds an import, a heap load, Math.sin and a function table (x86-64)
    Full,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum FormatArg {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "asmlink")]
#[command(about = "Link, run and cache compiled asm.js modules", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./asmlink.toml when present)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log every link, patch and cache decision
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print this machine's cache identity
    MachineId {
        #[arg(long, value_enum, default_value = "human")]
        format: FormatArg,
    },
    /// Build a sample module, link it and call its exports
    Demo {
        /// Which sample to build
        #[arg(long, value_enum, default_value = "identity")]
        sample: SampleArg,

        /// Argument passed to every export
        #[arg(long, default_value = "5", allow_hyphen_values = true)]
        arg: i32,

        /// Look the module up in the cache first and store it on a miss
        #[arg(long)]
        cache: bool,

        /// Run with profiling prologues enabled
        #[arg(long)]
        profile: bool,
    },
    /// Decode a cache entry and print its tables
    Inspect {
        /// The entry file
        file: PathBuf,

        #[arg(long, value_enum, default_value = "human")]
        format: FormatArg,
    },
    /// Print the effective configuration
    Config,
}

fn load_config(path: Option<&Path>) -> Result<LinkConfig, String> {
    match path {
        Some(path) => LinkConfig::load(path),
        None => {
            let default = Path::new("asmlink.toml");
            if default.exists() {
                LinkConfig::load(default)
            } else {
                Ok(LinkConfig::default())
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.trace { "trace" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::MachineId { format } => machine_id(format),
        Commands::Demo {
            sample,
            arg,
            cache,
            profile,
        } => demo(&config, sample, arg, cache || config.cache.enabled, profile || config.profiling.enabled),
        Commands::Inspect { file, format } => inspect(&file, format),
        Commands::Config => config.to_toml_string().map(|s| print!("{}", s)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn machine_id(format: FormatArg) -> Result<(), String> {
    let machine = MachineId::host().ok_or("host architecture is not supported")?;
    match format {
        FormatArg::Human => {
            println!("arch:     {:?}", machine.arch().ok_or("unknown arch tag")?);
            println!("cpu id:   {:#010x}", machine.cpu_id());
            println!("features: {:#x}", machine.features());
            println!("build id: {}", String::from_utf8_lossy(machine.build_id()));
        }
        FormatArg::Json => {
            let json = serde_json::to_string_pretty(&machine).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
    }
    Ok(())
}

fn build_sample(which: SampleArg, arch: Arch, config: &LinkConfig) -> Result<Module, String> {
    let module = match which {
        SampleArg::Identity => sample::identity_module(arch, &config.heap),
        SampleArg::Full => sample::full_module(arch, &config.heap),
    };
    module.map_err(|e| e.to_string())
}

fn demo(config: &LinkConfig, which: SampleArg, arg: i32, use_cache: bool, profile: bool) -> Result<(), String> {
    let arch = Arch::host().ok_or("host architecture is not supported")?;
    let machine = MachineId::host().ok_or("host architecture is not supported")?;
    let (filename, text) = match which {
        SampleArg::Identity => (sample::IDENTITY_FILENAME, sample::IDENTITY_SOURCE),
        SampleArg::Full => (sample::FULL_FILENAME, sample::FULL_SOURCE),
    };
    let source = ScriptSource::new(filename, text.as_bytes());
    let store = FileCacheStore::new(config.cache.dir());

    let started = Instant::now();
    let cached = if use_cache {
        cache::lookup_module_in_cache(&store, &source, 0, &machine, &HostResolver)
    } else {
        None
    };
    let mut module = match cached {
        Some(module) => module,
        None => {
            let mut module = build_sample(which, arch, config)?;
            if use_cache {
                cache::store_module_in_cache(&store, &source, 0, text.len() as u32, &module, &machine);
            }
            module.static_link(&HostResolver).map_err(|e| e.to_string())?;
            module
        }
    };
    log::info!("{}: ready in {}us", filename, started.elapsed().as_micros());

    if module.header().has_array_view {
        let length = config.heap.min_length;
        let heap = if module.header().uses_signal_handlers {
            HeapBuffer::with_guard_pages(length)
        } else {
            HeapBuffer::new(length)
        }
        .map_err(|e| e.to_string())?;
        heap.write_i32(0, 0x5eed);
        heap.write_i32(4, arg);
        module.init_heap(Arc::new(heap)).map_err(|e| e.to_string())?;
    }
    for (index, exit) in module.exits().to_vec().iter().enumerate() {
        log::debug!("binding exit {} (import {})", index, exit.ffi_index);
        let callee = Arc::new(|args: &[Value]| -> Result<Value, String> {
            let x = args.first().map(Value::to_int32).unwrap_or(0);
            Ok(Value::Int32(x.wrapping_add(1000)))
        });
        module.bind_exit(index as u32, callee).map_err(|e| e.to_string())?;
    }
    if profile {
        module.set_profiling_enabled(true).map_err(|e| e.to_string())?;
    }

    for export in module.exports().to_vec() {
        let name = export.name.to_string();
        let value = match export.arg_coercions.first() {
            Some(Coercion::Double) => Value::Double(arg as f64 / 10.0),
            _ => Value::Int32(arg),
        };
        match module.call(&name, &[value]) {
            Ok(result) => println!("{}({:?}) = {:?}", name, value, result),
            Err(e) => println!("{}({:?}) failed: {}", name, value, e),
        }
    }
    Ok(())
}

fn inspect(path: &Path, format: FormatArg) -> Result<(), String> {
    let entry = std::fs::read(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let summary = cache::inspect_entry(&entry).map_err(|e| e.to_string())?;
    match format {
        FormatArg::Json => {
            let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
        FormatArg::Human => {
            let h = &summary.header;
            println!("entry:      {} bytes", summary.entry_bytes);
            println!("machine:    {:?} (cpu {:#x})", summary.machine.arch(), summary.machine.cpu_id());
            println!("source:     {} bytes", summary.source_bytes);
            println!("arch:       {:?}", h.arch);
            println!(
                "code:       {} bytes ({} in functions), {} global data",
                h.code_bytes, h.function_bytes, h.global_data_bytes
            );
            println!("heap:       {}..={}", h.min_heap_length, h.max_heap_length);
            println!("tables:     {:?}", summary.tables);
            println!("exports:    {}", summary.exports.join(", "));
        }
    }
    Ok(())
}
