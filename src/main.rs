use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bpf_table::{MapProvider, MemoryMaps, Module, ModuleConfig, Table, TypeDescriptor};
use clap::{Args, CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bpftable")]
#[command(about = "Inspect and edit BPF hash maps as text", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct GlobalArgs {
    /// Module configuration (JSON) describing the tables
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Back the module with in-process maps instead of the kernel
    #[arg(long, global = true)]
    memory: bool,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List the module's tables
    Tables,
    /// Print a table's properties as JSON
    Config { table: String },
    /// Look up one key
    Get { table: String, key: String },
    /// Create or overwrite one key
    Set {
        table: String,
        key: String,
        leaf: String,
    },
    /// Remove one key
    Delete { table: String, key: String },
    /// Print every entry of a table
    Dump { table: String },
    /// Walk through a small in-memory table
    Demo,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.global.log_level);
    if let Err(err) = run(cli).await {
        eprintln!("bpftable error: {err:?}");
        exit(1);
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let Some(command) = cli.command else {
        Cli::command().print_help().ok();
        println!();
        return Ok(());
    };
    if let Commands::Demo = command {
        return demo().await;
    }

    let module = load_module(&cli.global)?;
    match command {
        Commands::Tables => {
            for table in module.tables() {
                let config = table.config();
                println!(
                    "{}\tfd={}\tkey={}\tleaf={}",
                    config.name, config.fd, config.key_desc, config.leaf_desc
                );
            }
        }
        Commands::Config { table } => {
            let config = find(&module, &table)?.config();
            println!("{}", serde_json::to_string_pretty(&config.to_map())?);
        }
        Commands::Get { table, key } => {
            match find(&module, &table)?.try_get(&key)? {
                Some(entry) => println!("{}", entry.value),
                None => return Err(anyhow!("{key} not found in {table}")),
            }
        }
        Commands::Set { table, key, leaf } => find(&module, &table)?.set(&key, &leaf)?,
        Commands::Delete { table, key } => find(&module, &table)?.delete(&key)?,
        Commands::Dump { table } => {
            let mut iter = find(&module, &table)?.iter();
            while let Some(entry) = iter.next().await {
                println!("{}", entry?);
            }
        }
        Commands::Demo => unreachable!("handled above"),
    }
    Ok(())
}

fn load_module(args: &GlobalArgs) -> Result<Module> {
    let path = args
        .config
        .as_ref()
        .context("--config is required for this command")?;
    let config = ModuleConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let maps = backend(args.memory)?;
    Module::load(&config, maps).context("failed to load module")
}

#[cfg(target_os = "linux")]
fn backend(memory: bool) -> Result<Arc<dyn MapProvider>> {
    if memory {
        return Ok(Arc::new(MemoryMaps::new()));
    }
    Ok(Arc::new(bpf_table::KernelMaps::new()))
}

#[cfg(not(target_os = "linux"))]
fn backend(memory: bool) -> Result<Arc<dyn MapProvider>> {
    anyhow::ensure!(memory, "kernel maps are only available on Linux, pass --memory");
    Ok(Arc::new(MemoryMaps::new()))
}

fn find(module: &Module, name: &str) -> Result<Table> {
    module
        .table(name)
        .with_context(|| format!("no table named {name}"))
}

async fn demo() -> Result<()> {
    println!("▶ Creating in-memory table counts (unsigned int -> unsigned long long)");
    let module = Module::in_memory();
    let table = module.create_table(
        "counts",
        TypeDescriptor::parse("unsigned int")?,
        TypeDescriptor::parse("unsigned long long")?,
        1024,
    )?;
    println!("  {}\n", serde_json::to_string(&table.config().to_map())?);

    println!("▶ SET");
    for (key, leaf) in [("1", "100"), ("2", "200"), ("0", "0x2a")] {
        table.set(key, leaf)?;
        println!("  ✓ {key} = {leaf}");
    }

    println!("\n▶ GET");
    for key in ["1", "0", "3", "bogus"] {
        match table.get(key) {
            Some(entry) => println!("  ✓ {entry}"),
            None => println!("  ✓ {key} => <not found>"),
        }
    }

    println!("\n▶ SCAN");
    let mut entries = table.iter();
    while let Some(entry) = entries.next().await {
        println!("  - {}", entry?);
    }

    println!("\n▶ DELETE 1");
    table.delete("1")?;
    let remaining: Vec<_> = table.iter().collect().await;
    println!("  ✓ {} entries left", remaining.len());
    if let Err(err) = table.delete("1") {
        println!("  ✓ second delete: {err}");
    }
    Ok(())
}
