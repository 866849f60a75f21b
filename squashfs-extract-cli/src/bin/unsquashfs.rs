//! unsquashfs-style CLI for `squashfs-extract`.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use console::Style;
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use squashfs_extract::path_filter::{MatchMode, PathFilter};
use squashfs_extract::{extract, resolve_symlink_paths, stat as read_stat, ExtractOptions};

// -musl malloc is slow, use jemalloc
#[cfg(all(target_env = "musl", target_pointer_width = "64"))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Tool to uncompress, list and extract SquashFS v4 filesystem images.
#[derive(Parser)]
#[command(author, version, name = "unsquashfs-extract", max_term_width = 98)]
struct Args {
    /// Squashfs image
    #[arg(required_unless_present = "completions")]
    filesystem: Option<PathBuf>,

    /// Extract to PATHNAME
    #[arg(short = 'd', long = "dest", default_value = "squashfs-root", value_name = "PATHNAME")]
    dest: PathBuf,

    /// If PATHNAME already exists then overwrite files that collide
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// List filesystem, do not write to DEST
    #[arg(short = 'l', long = "ls")]
    list: bool,

    /// Display filesystem superblock information and exit
    #[arg(short = 's', long = "stat")]
    stat: bool,

    /// Skip BYTES at the start of FILESYSTEM
    #[arg(long = "offset", default_value_t = 0, value_name = "BYTES")]
    offset: u64,

    /// Only extract DEPTH levels deep into the image
    #[arg(long = "max-depth", value_name = "DEPTH")]
    max_depth: Option<u32>,

    /// Extract only files/directories matching PATH (may be repeated)
    #[arg(short = 'e', long = "extract-file", value_name = "PATH")]
    extract_file: Vec<String>,

    /// Exclude files/directories matching PATH (may be repeated)
    #[arg(long = "exclude-list", value_name = "PATH")]
    exclude_list: Vec<String>,

    /// Treat -extract-file/-exclude-list patterns as POSIX extended regexes
    #[arg(short = 'r', long = "regex")]
    regex: bool,

    /// Treat -extract-file/-exclude-list patterns as literal paths, not globs
    #[arg(long = "no-wildcards")]
    no_wildcards: bool,

    /// Follow symlinks in -extract-file, adding every file/symlink needed to
    /// resolve them. Implies -no-wildcards
    #[arg(short = 'L', long = "follow-symlinks")]
    follow_symlinks: bool,

    /// Abort if a -follow-symlinks path can't be resolved
    #[arg(long = "missing-symlinks")]
    missing_symlinks: bool,

    /// Number of decompressor threads to run in parallel
    #[arg(short = 'p', long = "processors", value_name = "NUMBER")]
    processors: Option<usize>,

    /// Don't automatically create sparse files for runs of zero bytes
    #[arg(long = "no-sparse-output")]
    no_sparse_output: bool,

    /// Number of files that can be queued waiting to be written
    #[arg(long = "data-queue", default_value_t = 64, value_name = "NUMBER")]
    data_queue: usize,

    /// Number of files that can be queued waiting to be fragment-written
    #[arg(long = "frag-queue", default_value_t = 3, value_name = "NUMBER")]
    frag_queue: usize,

    /// Treat errors writing files/directories as fatal, increasing the exit code
    #[arg(long = "strict-errors")]
    strict_errors: bool,

    /// Ignore all errors writing files/directories
    #[arg(long = "ignore-errors")]
    ignore_errors: bool,

    /// Exit with code 0 even if non-fatal errors occurred
    #[arg(long = "no-exit-code")]
    no_exit_code: bool,

    /// Silence all progress bar output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Don't display the progress bar
    #[arg(short = 'n', long = "no-progress")]
    no_progress: bool,

    /// Emit shell completion scripts
    #[arg(long)]
    completions: Option<Shell>,
}

fn build_path_filter(args: &Args, extract_paths: &[String]) -> io::Result<PathFilter> {
    let mode = if args.follow_symlinks {
        MatchMode::Literal
    } else if args.regex {
        MatchMode::Regex
    } else if args.no_wildcards {
        MatchMode::Literal
    } else {
        MatchMode::Glob
    };

    let mut filter = PathFilter::new();
    for path in extract_paths {
        filter
            .add_extract(path, mode)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    }
    for path in &args.exclude_list {
        filter
            .add_exclude(path, mode)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    }
    Ok(filter)
}

/// Resolves `-extract-file` patterns to their canonical in-image paths when
/// `-follow-symlinks` was given, dereferencing symlinks along each path and
/// pulling every intermediate symlink into the extraction set too. Patterns
/// that can't be resolved fall back to the literal pattern (or abort, under
/// `-missing-symlinks`).
fn resolve_extract_paths(args: &Args, fs_path: &PathBuf) -> io::Result<Vec<String>> {
    if !args.follow_symlinks || args.extract_file.is_empty() {
        return Ok(args.extract_file.clone());
    }

    let file = File::open(fs_path)?;
    let reader = BufReader::with_capacity(1 << 20, file);
    resolve_symlink_paths(reader, args.offset, &args.extract_file, args.missing_symlinks)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn main() -> ExitCode {
    let args = Args::parse();

    if !args.quiet {
        tracing_subscriber::fmt::init();
    }

    if let Some(shell) = args.completions {
        let mut cmd = Args::command();
        let name = cmd.get_name().to_string();
        generate(shell, &mut cmd, name, &mut io::stdout());
        return ExitCode::SUCCESS;
    }

    let blue_bold = Style::new().blue().bold();
    let red_bold = Style::new().red().bold();

    if args.strict_errors && args.ignore_errors {
        eprintln!(
            "{}: -strict-errors and -ignore-errors are mutually exclusive",
            red_bold.apply_to("error")
        );
        return ExitCode::FAILURE;
    }

    if args.missing_symlinks && !args.follow_symlinks {
        eprintln!("{}: -missing-symlinks requires -follow-symlinks", red_bold.apply_to("error"));
        return ExitCode::FAILURE;
    }

    let path = args.filesystem.as_ref().expect("clap requires filesystem unless --completions");
    let file = match File::open(path) {
        Ok(f) => BufReader::with_capacity(1 << 20, f),
        Err(e) => {
            eprintln!("{}: failed to open {}: {e}", red_bold.apply_to("error"), path.display());
            return ExitCode::FAILURE;
        }
    };

    if args.stat {
        return match read_stat(file, args.offset) {
            Ok(sb) => {
                let used = byte_unit::Byte::from_bytes(sb.bytes_used as u128).get_appropriate_unit(true);
                println!("Filesystem size {used}");
                println!("{sb:#?}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {e}", red_bold.apply_to("error"));
                ExitCode::FAILURE
            }
        };
    }

    let extract_paths = match resolve_extract_paths(&args, path) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}: {e}", red_bold.apply_to("error"));
            return ExitCode::FAILURE;
        }
    };

    let path_filter = match build_path_filter(&args, &extract_paths) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("{}: {e}", red_bold.apply_to("error"));
            return ExitCode::FAILURE;
        }
    };

    let processors = args.processors.unwrap_or_else(num_cpus::get);

    let options = ExtractOptions {
        dest: args.dest.clone(),
        force: args.force,
        max_depth: args.max_depth,
        sparse_output: !args.no_sparse_output,
        list_only: args.list,
        data_buffers: args.data_queue,
        frag_buffers: args.frag_queue,
        processors,
        writer_queue_capacity: args.data_queue + args.frag_queue,
        max_open_files: None,
        offset: args.offset,
        path_filter,
        strict_errors: args.strict_errors,
        ignore_errors: args.ignore_errors,
    };

    let pb = ProgressBar::new_spinner();
    if !args.quiet && !args.no_progress {
        pb.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!("{}", blue_bold.apply_to(if args.list { "Listing" } else { "Extracting" })));
    }

    let start = Instant::now();
    let report = extract(file, options);

    match report {
        Ok(report) => {
            if !args.quiet && !args.no_progress {
                pb.finish_with_message(format!(
                    "{} {} files, {} dirs, {} symlinks, {} devices in {}",
                    blue_bold.apply_to("Done"),
                    report.files_created,
                    report.dirs_created,
                    report.symlinks_created,
                    report.devices_created,
                    HumanDuration(start.elapsed()),
                ));
            }
            if report.had_errors && !args.ignore_errors && !args.no_exit_code {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            if !args.quiet && !args.no_progress {
                pb.finish_with_message(format!("{}: {e}", red_bold.apply_to("failed")));
            } else {
                eprintln!("{}: {e}", red_bold.apply_to("error"));
            }
            ExitCode::FAILURE
        }
    }
}
