use clap::{ArgAction, Parser, Subcommand};
use mixlib::archive::output_name;
use mixlib::{Backing, Container, Generation, Integrity, Mode, OpenOptions, Protection};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mixtool", about = "Inspect and edit Westwood MIX archives in place")]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug).  RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Descend into this entry before running the command (repeatable).
    #[arg(short = 'n', long = "nested", value_name = "NAME", global = true)]
    nested: Vec<String>,
    /// Generation to assume when the file alone is ambiguous: td, ra or ts.
    #[arg(short, long, global = true)]
    generation: Option<Generation>,
    /// Edit even if the stored checksum does not match.
    #[arg(long, global = true)]
    force: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty archive
    Create {
        archive: PathBuf,
        /// td, ra or ts
        #[arg(short = 'G', long = "as", default_value = "ra")]
        target: Generation,
        #[arg(long)]
        checksum: bool,
        #[arg(long)]
        encrypt: bool,
    },
    /// List archive contents
    List {
        archive: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show archive metadata
    Info {
        archive: PathBuf,
    },
    /// Extract entries (all of them when no names are given)
    Extract {
        archive: PathBuf,
        names: Vec<String>,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Add files under their file names
    Insert {
        archive: PathBuf,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Delete entries
    Remove {
        archive: PathBuf,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Swap an entry's content for a file's
    Replace {
        archive: PathBuf,
        name: String,
        file: PathBuf,
    },
    /// Move an entry to the ID of a new name
    Rename {
        archive: PathBuf,
        from: String,
        to: String,
    },
    /// Rebuild the archive for another generation
    Convert {
        archive: PathBuf,
        /// td, ra or ts
        #[arg(long = "to")]
        target: Generation,
    },
    /// Set checksum and encryption flags
    Protect {
        archive: PathBuf,
        #[arg(long)]
        checksum: bool,
        #[arg(long)]
        encrypt: bool,
    },
    /// Check stored digests
    Verify {
        #[arg(required = true)]
        archives: Vec<PathBuf>,
    },
    /// Pack entries together and drop free space
    Compact {
        archive: PathBuf,
    },
    /// Embed a name table listing every known entry name
    Names {
        archive: PathBuf,
    },
}

impl Commands {
    /// Archive the command runs against and whether it writes to it.
    fn target(&self) -> Option<(&Path, bool)> {
        match self {
            Commands::List { archive, .. }
            | Commands::Info { archive }
            | Commands::Extract { archive, .. } => Some((archive.as_path(), false)),
            Commands::Insert { archive, .. }
            | Commands::Remove { archive, .. }
            | Commands::Replace { archive, .. }
            | Commands::Rename { archive, .. }
            | Commands::Convert { archive, .. }
            | Commands::Protect { archive, .. }
            | Commands::Compact { archive }
            | Commands::Names { archive } => Some((archive.as_path(), true)),
            Commands::Create { .. } | Commands::Verify { .. } => None,
        }
    }
}

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

fn main() -> CliResult {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        // ── Create ───────────────────────────────────────────────────────────
        Commands::Create { archive, target, checksum, encrypt } => {
            if !cli.nested.is_empty() {
                return Err("create works on top-level archives; insert the result to nest it".into());
            }
            let file = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(archive)?;
            let protection = Protection::from_parts(*checksum, *encrypt);
            Container::create(file, *target, protection)?.close()?;
            println!("Created: {} ({target}, {protection:?})", archive.display());
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { archives } => {
            let results = verify_all(archives, &cli);
            let mut failed = 0;
            for (path, result) in &results {
                match result {
                    Ok(Integrity::Verified)  => println!("OK        {}", path.display()),
                    Ok(Integrity::Unchecked) => println!("NO DIGEST {}", path.display()),
                    Ok(Integrity::Mismatch)  => {
                        failed += 1;
                        println!("MISMATCH  {}", path.display());
                    }
                    Err(e) => {
                        failed += 1;
                        println!("ERROR     {}: {e}", path.display());
                    }
                }
            }
            if failed > 0 {
                return Err(format!("{failed} of {} archive(s) failed verification", results.len()).into());
            }
        }

        // ── Everything else ──────────────────────────────────────────────────
        command => {
            let Some((path, writes)) = command.target() else {
                return Ok(());
            };
            let file = fs::OpenOptions::new().read(true).write(writes).open(path)?;
            let mut container = Container::open(file, open_options(&cli, writes))?;
            run_in(&mut container, &cli.nested, command)?;
            if writes {
                container.close()?;
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_options(cli: &Cli, writes: bool) -> OpenOptions {
    let mut options = if writes { OpenOptions::read_write() } else { OpenOptions::read_only() };
    if let Some(g) = cli.generation {
        options = options.generation(g);
    }
    options.acknowledge_damage(cli.force)
}

/// Walk down `nested` and run `command` in the innermost container.
/// Each level is flushed on the way out so the change reaches the file.
fn run_in<S: Backing>(container: &mut Container<S>, nested: &[String], command: &Commands) -> CliResult {
    match nested.split_first() {
        Some((name, rest)) => {
            let id = container.resolve(name)?;
            let mut child = container.open_nested(id)?;
            run_in(&mut child, rest, command)?;
            if child.mode() == Mode::ReadWrite {
                child.flush()?;
            }
            Ok(())
        }
        None => run_command(container, command),
    }
}

fn run_command<S: Backing>(c: &mut Container<S>, command: &Commands) -> CliResult {
    match command {
        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { json: true, .. } => {
            println!("{}", serde_json::to_string_pretty(&c.list())?);
        }
        Commands::List { .. } => {
            println!("{:<10} {:>10} {:>10}  Name", "ID", "Offset", "Length");
            for info in c.list() {
                println!(
                    "{:#010x} {:>10} {:>10}  {}",
                    info.id,
                    info.offset,
                    info.length,
                    info.name.as_deref().unwrap_or("—")
                );
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { .. } => {
            println!("── MIX Archive ──────────────────────────────────────────");
            println!("  Generation     {}", c.generation());
            println!("  Protection     {:?}", c.protection());
            println!("  Integrity      {:?}", c.integrity());
            println!("  Entries        {}", c.len());
            println!("  Body size      {} B", c.body_size());
            println!("  Free space     {} B", c.free_space());
            println!("  Overhead       {} B", c.overhead());
            println!("  Nesting depth  {}", c.depth());
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { names, output_dir, .. } => {
            fs::create_dir_all(output_dir)?;
            let ids: Vec<u32> = if names.is_empty() {
                c.list().into_iter().map(|e| e.id).collect()
            } else {
                names.iter().map(|n| c.learn_name(n)).collect::<Result<Vec<_>, _>>()?
            };
            for id in ids {
                let info = c.stat(id)?;
                let target = output_dir.join(output_name(&info));
                fs::write(&target, c.extract(id)?)?;
                println!("  extracted  {}", target.display());
            }
        }

        // ── Edits ────────────────────────────────────────────────────────────
        Commands::Insert { files, .. } => {
            for path in files {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| format!("{} has no usable file name", path.display()))?;
                let id = c.insert(name, &fs::read(path)?)?;
                println!("  inserted  {name} as {id:#010x}");
            }
        }
        Commands::Remove { names, .. } => {
            for name in names {
                let id = c.resolve(name)?;
                c.remove(id)?;
                println!("  removed  {name}");
            }
        }
        Commands::Replace { name, file, .. } => {
            let id = c.learn_name(name)?;
            c.replace(id, &fs::read(file)?)?;
            println!("  replaced  {name}");
        }
        Commands::Rename { from, to, .. } => {
            let id = c.resolve(from)?;
            let new_id = c.rename(id, to)?;
            println!("  renamed  {from} → {to} ({new_id:#010x})");
        }
        Commands::Convert { target, .. } => {
            let from = c.generation();
            for warning in c.convert(*target)? {
                eprintln!("warning: {warning}");
            }
            println!("Converted {from} → {target}");
        }
        Commands::Protect { checksum, encrypt, .. } => {
            let protection = Protection::from_parts(*checksum, *encrypt);
            c.set_protection(protection)?;
            println!("Protection set to {protection:?}");
        }
        Commands::Compact { .. } => {
            let before = c.body_size();
            c.compact()?;
            println!("Compacted body: {before} B → {} B", c.body_size());
        }
        Commands::Names { .. } => {
            c.write_name_table()?;
            println!("Name table written");
        }

        Commands::Create { .. } | Commands::Verify { .. } => {}
    }
    Ok(())
}

fn verify_one(path: &Path, hint: Option<Generation>) -> mixlib::Result<Integrity> {
    let mut options = OpenOptions::read_only();
    if let Some(g) = hint {
        options = options.generation(g);
    }
    let container = Container::open(fs::File::open(path)?, options)?;
    Ok(container.integrity())
}

#[cfg(feature = "parallel")]
fn verify_all<'a>(archives: &'a [PathBuf], cli: &Cli) -> Vec<(&'a PathBuf, mixlib::Result<Integrity>)> {
    use rayon::prelude::*;
    let hint = cli.generation;
    archives.par_iter().map(|p| (p, verify_one(p, hint))).collect()
}

#[cfg(not(feature = "parallel"))]
fn verify_all<'a>(archives: &'a [PathBuf], cli: &Cli) -> Vec<(&'a PathBuf, mixlib::Result<Integrity>)> {
    archives.iter().map(|p| (p, verify_one(p, cli.generation))).collect()
}
