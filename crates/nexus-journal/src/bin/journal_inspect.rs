//! Journal inspection tool.
//!
//! Prints the headers and records of a journal directory without going
//! through a full load.
//!
//! # Usage
//!
//! ```bash
//! # List files with their ids and versions
//! journal-inspect --dir /var/lib/nexus/journal files
//!
//! # Dump every valid record
//! journal-inspect --dir /var/lib/nexus/journal records
//!
//! # Load the journal and print a summary (may append rollback records)
//! journal-inspect --config journal.toml load
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use nexus_journal::journal_file::read_file_header;
use nexus_journal::reader::{read_journal_file, JournalReaderCallback};
use nexus_journal::{
    Journal, JournalConfig, JournalFile, JournalResult, RecordInfo, SequentialFile,
    SequentialFileFactory, StdFileFactory,
};

/// Journal inspection tool
#[derive(Parser, Debug)]
#[command(
    name = "journal-inspect",
    author = "NexusDB Team",
    version,
    about = "Inspect NexusDB journal files"
)]
struct Args {
    /// Journal directory
    #[arg(short = 'd', long, value_name = "DIR", env = "NEXUS_JOURNAL_DIR")]
    dir: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Journal file extension
    #[arg(long)]
    extension: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", env = "NEXUS_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List journal files in id order
    Files,
    /// Print every valid record of every file
    Records {
        /// Print record bodies as hex
        #[arg(long)]
        bodies: bool,
    },
    /// Load the journal and print a summary
    Load,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;
    debug!(dir = %config.dir.display(), "inspecting journal");

    match args.command {
        Command::Files => {
            for (name, file) in scan_files(&config)? {
                println!(
                    "{}  id={} version={} size={}",
                    name,
                    file.file_id(),
                    file.version(),
                    file.file().size()?
                );
            }
        }
        Command::Records { bodies } => {
            for (name, file) in scan_files(&config)? {
                println!("== {} (id={})", name, file.file_id());
                let mut printer = RecordPrinter { bodies };
                let end = read_journal_file(&file, &mut printer)
                    .with_context(|| format!("failed to read {}", name))?;
                println!("   last valid position {}", end);
            }
        }
        Command::Load => {
            let journal = Journal::new(config)?;
            journal.start()?;
            let loaded = journal.load_records(None)?;
            println!("records:      {}", loaded.info.number_of_records);
            println!("max id:       {:?}", loaded.info.max_id);
            println!("prepared txs: {}", loaded.prepared.len());
            println!("data files:   {}", journal.data_files_count());
            println!("free files:   {}", journal.free_files_count());
            print!("{}", journal.debug());
            journal.stop()?;
        }
    }

    Ok(())
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_new(format!("nexus_journal={}", args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<JournalConfig> {
    let mut config = match &args.config {
        Some(path) => JournalConfig::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => JournalConfig::default(),
    };

    if let Some(dir) = &args.dir {
        config.dir = dir.clone();
    }
    if let Some(extension) = &args.extension {
        config.file_extension = extension.clone();
    }
    Ok(config)
}

/// Opens every journal file and reads its header, sorted by file id.
fn scan_files(config: &JournalConfig) -> Result<Vec<(String, JournalFile)>> {
    let factory = StdFileFactory::new(config.dir.clone());
    let mut files = Vec::new();

    for name in factory.list_files(&config.file_extension)? {
        let sf = factory.create_sequential_file(&name);
        sf.open()?;
        let header = read_file_header(sf.as_ref());
        sf.close()?;
        match header {
            Ok(header) => files.push((
                name,
                JournalFile::new(Arc::clone(&sf), header.file_id, header.version),
            )),
            Err(e) => eprintln!("{}: unreadable header: {}", name, e),
        }
    }

    files.sort_by_key(|(_, file)| file.file_id());
    Ok(files)
}

struct RecordPrinter {
    bodies: bool,
}

impl RecordPrinter {
    fn print_info(&self, kind: &str, tx_id: Option<u64>, info: &RecordInfo) {
        let tx = tx_id.map(|id| format!(" tx={}", id)).unwrap_or_default();
        println!(
            "   {:<9}{} id={} type={} compact={} len={}",
            kind,
            tx,
            info.id,
            info.user_record_type,
            info.compact_count,
            info.data.len()
        );
        if self.bodies {
            println!("      {}", hex(&info.data));
        }
    }
}

impl JournalReaderCallback for RecordPrinter {
    fn on_read_add_record(&mut self, info: RecordInfo) -> JournalResult<()> {
        self.print_info("add", None, &info);
        Ok(())
    }

    fn on_read_update_record(&mut self, info: RecordInfo) -> JournalResult<()> {
        self.print_info("update", None, &info);
        Ok(())
    }

    fn on_read_delete_record(&mut self, id: u64) -> JournalResult<()> {
        println!("   delete    id={}", id);
        Ok(())
    }

    fn on_read_add_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
        self.print_info("add", Some(tx_id), &info);
        Ok(())
    }

    fn on_read_update_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
        self.print_info("update", Some(tx_id), &info);
        Ok(())
    }

    fn on_read_delete_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
        self.print_info("delete", Some(tx_id), &info);
        Ok(())
    }

    fn on_read_prepare_record(
        &mut self,
        tx_id: u64,
        extra_data: Bytes,
        number_of_records: u32,
    ) -> JournalResult<()> {
        println!(
            "   prepare   tx={} records={} extra={}",
            tx_id,
            number_of_records,
            extra_data.len()
        );
        Ok(())
    }

    fn on_read_commit_record(&mut self, tx_id: u64, number_of_records: u32) -> JournalResult<()> {
        println!("   commit    tx={} records={}", tx_id, number_of_records);
        Ok(())
    }

    fn on_read_rollback_record(&mut self, tx_id: u64) -> JournalResult<()> {
        println!("   rollback  tx={}", tx_id);
        Ok(())
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}
