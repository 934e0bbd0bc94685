use std::{
    error::Error,
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use indicatif::HumanBytes;
use log::{info, warn};

use crate::{
    cbt::{CbtDocument, ParseMode},
    changemap::ChangeMap,
    copy::ShortTransferPolicy,
    disklib::{LibraryVersion, TransportMode},
    dump::{DumpConfig, DumpMode, DumpOrchestrator, DumpReport, LocalDisk},
    flat::FlatDiskLib,
    library::LibraryRegistry,
};

mod cbt;
mod changemap;
mod copy;
mod descriptor;
mod disklib;
mod dump;
mod error;
#[cfg(test)]
mod fake;
/// Raw wrapper for FIEMAP ioctl.
///
/// Definitions taken from `/usr/include/linux`.
mod fiemap;
mod flat;
mod interrupt;
mod library;
mod lifecycle;
mod metadata;
mod progress;
mod scan;
mod session;

pub(crate) type ResultType<T> = std::result::Result<T, Box<dyn Error>>;

/// Incremental changed-block backup, clone and restore of virtual machine disks.
///
/// Every command except `restore` takes a parameter document naming the
/// remote endpoint and disk.  `blocks` and `backup` print that document
/// again, with the discovered change map filled in, which is what a later
/// `restore` expects on stdin.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Directory that datastore paths (`[ds] dir/disk.vmdk`) and relative
    /// local paths resolve against.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[arg(long, global = true, default_value_t = 7)]
    lib_major: u32,

    #[arg(long, global = true, default_value_t = 0)]
    lib_minor: u32,

    /// Where to load the disk library from.
    #[arg(long, global = true)]
    lib_path: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = TransportMode::Nbd)]
    transport: TransportMode,

    /// Delay between prepare / end access attempts.
    #[arg(long, global = true, default_value_t = 2000)]
    retry_delay_ms: u64,

    #[arg(long, global = true, value_enum, default_value_t = ShortTransferPolicy::Retry)]
    short_transfer: ShortTransferPolicy,

    /// Accept malformed parameter documents on a best-effort basis.
    #[arg(long, global = true)]
    lenient: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CopyArgs {
    /// Parameter document for the remote disk.
    #[arg(long)]
    params: PathBuf,

    /// The local disk to copy into.
    #[arg(long)]
    local: String,

    /// Create the local disk, sized like the remote one.
    #[arg(long)]
    create: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Discovers allocated blocks of the remote disk without copying.
    ///
    /// The parameter document, with the change map filled in, is sent to
    /// stdout.
    Blocks {
        #[arg(long)]
        params: PathBuf,
    },
    /// Copies the allocated blocks of the remote disk to a local disk.
    ///
    /// The parameter document, with the change map filled in, is sent to
    /// stdout.  Keep it: `restore` needs it.
    Backup(CopyArgs),
    /// Like `backup`, without printing the document.
    Clone(CopyArgs),
    /// Writes a previous backup back to the remote disk.
    ///
    /// The document printed by that backup is expected on stdin.  This
    /// overwrites the remote disk's changed areas.
    Restore {
        /// The local disk holding the backup.
        #[arg(long)]
        local: String,
    },
    /// Lists the metadata of the remote disk.
    Keys {
        #[arg(long)]
        params: PathBuf,
    },
}

impl Cli {
    fn parse_mode(&self) -> ParseMode {
        if self.lenient {
            ParseMode::Lenient
        } else {
            ParseMode::Strict
        }
    }

    fn read_params(&self, path: &Path) -> ResultType<CbtDocument> {
        let f = File::open(path)?;
        Ok(CbtDocument::parse(BufReader::new(f), self.parse_mode())?)
    }

    fn config(&self, mode: DumpMode, doc: &CbtDocument, local: Option<LocalDisk>) -> DumpConfig {
        let delay = Duration::from_millis(self.retry_delay_ms);
        let mut c = DumpConfig::new(mode, doc.conn.clone(), doc.disk.clone());
        c.version = LibraryVersion {
            major: self.lib_major,
            minor: self.lib_minor,
            lib_path: self.lib_path.clone(),
        };
        c.local = local;
        c.transport = self.transport;
        c.prepare_retry = c.prepare_retry.with_delay(delay);
        c.end_access_retry = c.end_access_retry.with_delay(delay);
        c.short_transfer = self.short_transfer;
        c
    }

    fn dump(
        &self,
        mode: DumpMode,
        doc: &CbtDocument,
        local: Option<LocalDisk>,
        supplied: Option<ChangeMap>,
    ) -> ResultType<DumpReport> {
        let lib = Arc::new(FlatDiskLib::new(&self.root));
        let mut dump =
            DumpOrchestrator::new(lib, LibraryRegistry::global(), self.config(mode, doc, local));
        interrupt::install(dump.cancel_token());
        let progress = dump.progress();

        let result = dump.run(supplied);
        info!(
            "{:?} ended {:?}: scanned {} of {}, copied {} of {}",
            dump.mode(),
            dump.state(),
            HumanBytes(progress.processed()),
            HumanBytes(progress.capacity()),
            HumanBytes(progress.finished()),
            HumanBytes(progress.estimate())
        );
        if result.as_ref().is_err_and(|e| e.is_transient()) {
            warn!("The VM may still be held by another session; try again later");
        }
        let report = result?;
        info!(
            "{:?}: {} changed areas, {} metadata entries",
            report.mode,
            report.change_map.changed_areas.len(),
            report.metadata_entries
        );
        Ok(report)
    }
}

fn write_document(doc: &CbtDocument, report: DumpReport) -> ResultType<()> {
    let out = CbtDocument {
        change: report.change_map,
        ..doc.clone()
    };
    let mut w = BufWriter::new(io::stdout());
    out.write(&mut w)?;
    w.flush()?;
    Ok(())
}

fn local_disk(args: &CopyArgs) -> Option<LocalDisk> {
    Some(LocalDisk {
        path: args.local.clone(),
        create: args.create,
    })
}

fn main() -> ResultType<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Blocks { params } => {
            let doc = cli.read_params(params)?;
            let report = cli.dump(DumpMode::BlocksOnly, &doc, None, None)?;
            write_document(&doc, report)?
        }
        Commands::Backup(args) => {
            let doc = cli.read_params(&args.params)?;
            let report = cli.dump(DumpMode::Backup, &doc, local_disk(args), None)?;
            write_document(&doc, report)?
        }
        Commands::Clone(args) => {
            let doc = cli.read_params(&args.params)?;
            cli.dump(DumpMode::Clone, &doc, local_disk(args), None)?;
        }
        Commands::Restore { local } => {
            let doc = CbtDocument::parse(BufReader::new(io::stdin()), cli.parse_mode())?;
            let local = LocalDisk {
                path: local.clone(),
                create: false,
            };
            let change = doc.change.clone();
            cli.dump(DumpMode::Restore, &doc, Some(local), Some(change))?;
        }
        Commands::Keys { params } => {
            let doc = cli.read_params(params)?;
            let lib = Arc::new(FlatDiskLib::new(&cli.root));
            let mut dump = DumpOrchestrator::new(
                lib,
                LibraryRegistry::global(),
                cli.config(DumpMode::BlocksOnly, &doc, None),
            );
            dump.prepare_for_access()?;
            dump.open_remote_disk()?;
            let entries = dump.remote_metadata()?;
            dump.cleanup()?;

            let mut w = BufWriter::new(io::stdout());
            for e in entries {
                writeln!(w, "{} = {}", e.key, String::from_utf8_lossy(&e.value))?;
            }
            w.flush()?;
        }
    }

    Ok(())
}
