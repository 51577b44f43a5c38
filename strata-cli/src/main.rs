//! Strata shell - interactive access to a store directory

use anyhow::Context;
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use strata_core::compaction::{CompactionPolicy, LeveledCompactionOptions};
use strata_core::iterator::StorageIterator;
use strata_core::{Storage, StorageOptions, StrataError};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "strata", version, about = "Interactive shell for a Strata store")]
struct Args {
    /// Store directory
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// Skip the write-ahead log
    #[arg(long)]
    no_wal: bool,

    /// Compact L0 into L1 in the background
    #[arg(long)]
    leveled: bool,

    /// Memtable size that triggers a flush, in bytes
    #[arg(long, default_value_t = strata_core::config::TARGET_SST_SIZE)]
    target_sst_size: usize,

    /// SSTable block size, in bytes
    #[arg(long, default_value_t = strata_core::config::BLOCK_SIZE)]
    block_size: usize,

    /// Background flush tick, in milliseconds
    #[arg(long, default_value_t = strata_core::config::FLUSH_INTERVAL_MS)]
    flush_interval_ms: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            enable_wal: !self.no_wal,
            target_sst_size: self.target_sst_size,
            block_size: self.block_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            compaction: if self.leveled {
                CompactionPolicy::Leveled(LeveledCompactionOptions::default())
            } else {
                CompactionPolicy::NoCompaction
            },
            ..Default::default()
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

const HELP: &str = "\
commands:
  put <key> <value>     insert or overwrite
  get <key>             print the value
  del <key>             delete
  scan <start> <end>    print live entries in [start, end]
  scan                  print every live entry
  flush                 write memtables to disk
  compact               merge L0 and L1
  stats                 show the tree shape
  help                  this text
  exit                  close the store and quit";

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let storage = Storage::open(&args.data_dir, args.storage_options())
        .with_context(|| format!("opening store at {:?}", args.data_dir))?;
    info!("Strata {} ready at {:?}", strata_core::VERSION, args.data_dir);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "strata> ")?;
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        match run_command(&storage, &words, &mut stdout) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => writeln!(stdout, "error: {}", e)?,
        }
    }

    storage.close()?;
    Ok(())
}

/// Execute one command; returns false when the shell should exit
fn run_command(storage: &Storage, words: &[&str], out: &mut impl Write) -> anyhow::Result<bool> {
    match words {
        ["put", key, value] => {
            storage.put(key.as_bytes(), value.as_bytes())?;
            writeln!(out, "OK")?;
        }
        ["get", key] => match storage.get(key.as_bytes()) {
            Ok(value) => writeln!(out, "{}", String::from_utf8_lossy(&value))?,
            Err(StrataError::KeyNotFound) => writeln!(out, "(not found)")?,
            Err(e) => return Err(e.into()),
        },
        ["del", key] | ["delete", key] => {
            storage.delete(key.as_bytes())?;
            writeln!(out, "OK")?;
        }
        ["scan"] => {
            let iter = storage.scan_range(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded)?;
            print_scan(iter, out)?;
        }
        ["scan", start, end] => {
            let iter = storage.scan(start.as_bytes(), end.as_bytes())?;
            print_scan(iter, out)?;
        }
        ["flush"] => {
            storage.force_flush()?;
            writeln!(out, "OK")?;
        }
        ["compact"] => {
            storage.force_full_compaction()?;
            writeln!(out, "OK")?;
        }
        ["stats"] => {
            let stats = storage.stats();
            writeln!(out, "memtable:      #{} ({} bytes)", stats.memtable_id, stats.memtable_size)?;
            writeln!(out, "immutable:     {}", stats.imm_memtables)?;
            writeln!(out, "L0 tables:     {}", stats.l0_sstables)?;
            for (i, count) in stats.level_sstables.iter().enumerate() {
                writeln!(out, "L{} tables:     {}", i + 1, count)?;
            }
            writeln!(out, "table bytes:   {}", stats.total_sst_bytes)?;
            writeln!(out, "last sequence: {}", stats.last_sequence)?;
        }
        ["help"] => writeln!(out, "{}", HELP)?,
        ["exit"] | ["quit"] => return Ok(false),
        _ => writeln!(out, "unknown command, try `help`")?,
    }
    Ok(true)
}

fn print_scan(mut iter: impl StorageIterator, out: &mut impl Write) -> anyhow::Result<()> {
    let mut count = 0;
    while iter.is_valid() {
        writeln!(
            out,
            "{} => {}",
            String::from_utf8_lossy(iter.key()),
            String::from_utf8_lossy(iter.value())
        )?;
        count += 1;
        iter.next()?;
    }
    writeln!(out, "({} entries)", count)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(storage: &Storage, line: &str) -> String {
        let words: Vec<&str> = line.split_whitespace().collect();
        let mut out = Vec::new();
        run_command(storage, &words, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_shell_commands() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path(), StorageOptions::default()).unwrap();

        assert_eq!(run(&storage, "put a 1"), "OK\n");
        assert_eq!(run(&storage, "put b 2"), "OK\n");
        assert_eq!(run(&storage, "get a"), "1\n");
        assert_eq!(run(&storage, "del a"), "OK\n");
        assert_eq!(run(&storage, "get a"), "(not found)\n");
        assert_eq!(run(&storage, "scan a z"), "b => 2\n(1 entries)\n");
        assert_eq!(run(&storage, "flush"), "OK\n");
        assert!(run(&storage, "stats").contains("L0 tables:     1"));
        assert!(run(&storage, "bogus").starts_with("unknown command"));

        let words = ["exit"];
        let mut out = Vec::new();
        assert!(!run_command(&storage, &words, &mut out).unwrap());
    }

    #[test]
    fn test_args_map_to_options() {
        let args = Args::parse_from(["strata", "--no-wal", "--leveled", "--block-size", "1024"]);
        let options = args.storage_options();
        assert!(!options.enable_wal);
        assert_eq!(options.block_size, 1024);
        assert!(options.compaction.runs_in_background());
        options.validate().unwrap();
    }
}
