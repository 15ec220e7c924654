use anyhow::Context;
use clap::Parser;
use kmer_prefilter::*;
use needletail::parse_fastx_file;
use std::path::PathBuf;
use tracing::info;

/// Build a `.kpi` k-mer prefilter index from FASTA/FASTQ.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Input FASTA/FASTQ(.gz) path
    #[arg(short, long)]
    input: PathBuf,

    /// Output `.kpi` path
    #[arg(short, long)]
    output: PathBuf,

    /// K-mer length (<= 31 nucleotide, <= 14 protein)
    #[arg(short = 'k', long)]
    k: usize,

    /// Alphabet: nucl|prot
    #[arg(short, long, default_value = "nucl")]
    alphabet: String,

    /// log2 of the maximum number of grid buckets
    #[arg(short = 'G', long, default_value_t = 20)]
    grid_bits: u32,

    /// Partial runs to build and merge (1 = single split)
    #[arg(long, default_value_t = 1)]
    shards: usize,

    /// Threads
    #[arg(long)]
    threads: Option<usize>,

    /// Representative offset within a group of equal k-mers
    #[arg(long, default_value_t = 0)]
    pick_offset: usize,

    /// Keep every entry of a k-mer group when merging
    #[arg(long, default_value_t = false)]
    keep_all: bool,

    /// Minimum sequence length
    #[arg(long, default_value_t = 0)]
    min_seq_len: usize,

    /// Directory for partial runs
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn parse_alphabet(s: &str) -> anyhow::Result<Alphabet> {
    match s {
        "nucl" | "dna" | "nucleotide" => Ok(Alphabet::Nucleotide),
        "prot" | "aa" | "protein" => Ok(Alphabet::Protein),
        _ => anyhow::bail!("unknown alphabet {s:?} (expected nucl or prot)"),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let alphabet = parse_alphabet(&args.alphabet)?;
    let mut cfg = BuildConfig::new(alphabet, args.k)
        .with_grid_bits(args.grid_bits)
        .with_shards(args.shards)
        .with_pick_offset(args.pick_offset)
        .min_seq_len(args.min_seq_len);
    if args.keep_all {
        cfg = cfg.with_group_policy(GroupPolicy::KeepAll);
    }
    if let Some(n) = args.threads {
        cfg = cfg.threads(n);
    }
    if let Some(dir) = &args.tmp_dir {
        cfg = cfg.with_tmp_dir(dir);
    }
    cfg.validate()?;

    let mut reader = parse_fastx_file(&args.input)
        .with_context(|| format!("Failed to open {}", args.input.display()))?;
    let mut records = Vec::new();
    let mut max_seq_len = 0u32;
    while let Some(record) = reader.next() {
        let rec = record.context("Invalid record")?;
        let seq = rec.seq();
        let id = u32::try_from(records.len()).context("too many sequences for u32 ids")?;
        max_seq_len = max_seq_len.max(u32::try_from(seq.len()).unwrap_or(u32::MAX));
        records.push(SequenceRecord::new(id, seq.into_owned()));
    }
    info!("Read {} sequences from {}", records.len(), args.input.display());

    let mut meta = IndexMetadata::new(alphabet, args.k);
    meta.max_seq_len = max_seq_len;

    let mut writer = IndexFileWriter::create(&args.output)?;
    let stats = build_index(&records, &cfg, &meta, &mut writer)?;
    writer.finish()?;

    info!(
        "Built kpi: alphabet={:?}, k={}, grid_bits={}, runs={}, entries={} of {}",
        alphabet,
        args.k,
        args.grid_bits,
        stats.runs,
        stats.written_entries,
        stats.input_entries
    );
    Ok(())
}
