use clap::{Parser, Subcommand};
use snapvault::catalog::remote::RemoteCatalog;
use snapvault::catalog::CatalogRead;
use snapvault::crypto::{CryptoParams, KeySet};
use snapvault::recover::{
    AuthFailAction, Overwrite, RecoverOptions, Recoverer, ReducePath, SnapshotSelector,
};
use snapvault::reencrypt::{self, ReencryptOptions};
use snapvault::repo::Repository;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

#[derive(Parser)]
#[command(name = "snapvault", version = "1.0.0", about = "Deduplicating backup repository CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty repository (catalog + blob cache)
    Init {
        /// Repository directory
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,
    },
    /// Recover files or digests from a snapshot
    Recover {
        /// Repository directory
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,
        /// Remote catalog URL (uses HTTP instead of the local catalog)
        #[arg(long)]
        remote: Option<String>,
        /// Login token for the remote catalog
        #[arg(long)]
        token: Option<String>,
        /// Passphrase for an encrypted repository
        #[arg(short, long)]
        password: Option<String>,
        /// Client identifier used for key derivation
        #[arg(long, default_value = "localhost")]
        client: String,
        /// Output file or directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Treat targets as digests instead of paths
        #[arg(short, long)]
        checksum: bool,
        /// Snapshot to use, by name
        #[arg(short, long, conflicts_with_all = ["date", "last"])]
        backup: Option<String>,
        /// Recover as of this date (e.g. "2026-07-01 12:00:00")
        #[arg(short, long, conflicts_with = "last")]
        date: Option<String>,
        /// Recover the most recent version of each target
        #[arg(short, long)]
        last: bool,
        /// Recurse into directory trees
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        recurse: bool,
        /// Recover the filename when recovering a digest
        #[arg(long)]
        recovername: bool,
        /// Authenticate files while regenerating them
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        authenticate: bool,
        /// Action for files that do not authenticate
        #[arg(long, value_parser = ["keep", "rename", "delete"], default_value = "rename")]
        authfail_action: String,
        /// Trim N leading path components; no value for smart reduction
        #[arg(long, value_name = "N", num_args = 0..=1, default_missing_value = "smart")]
        reduce_path: Option<String>,
        /// Restore file times
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        set_times: bool,
        /// Restore mode, group, and owner
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        set_perms: bool,
        /// Restore extended attributes
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        set_attrs: bool,
        /// Restore POSIX ACLs
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        set_acl: bool,
        /// Mode for handling existing files
        #[arg(long, value_parser = ["always", "newer", "older", "never"], default_value = "never")]
        overwrite: String,
        /// Reconstruct hardlinks for repeated inodes
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        hardlinks: bool,
        /// Files or digests to recover
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// List snapshots
    Snapshots {
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,
    },
    /// Delete old snapshots and sweep orphaned blobs
    Purge {
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,
        /// Delete snapshots at or below this priority
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// Delete snapshots that ended at or before this date
        #[arg(long)]
        before: String,
    },
    /// Convert a plaintext repository into an encrypted one
    Reencrypt {
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,
        #[arg(short, long)]
        password: String,
        #[arg(long, default_value = "localhost")]
        client: String,
        /// Encrypt filenames
        #[arg(long)]
        names: bool,
        /// Recompute directory hashes
        #[arg(long)]
        dirs: bool,
        /// Generate signature sidecars
        #[arg(long)]
        sigs: bool,
        /// Encrypt file blobs
        #[arg(long)]
        files: bool,
        /// Write metadata sidecars
        #[arg(long)]
        meta: bool,
        /// All phases, in order
        #[arg(long)]
        all: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    match Cli::parse().command {

        // ── Init ─────────────────────────────────────────────────────────────
        Commands::Init { repo } => {
            Repository::create(&repo)?;
            println!("Initialized repository at {}", repo.display());
        }

        // ── Recover ──────────────────────────────────────────────────────────
        Commands::Recover {
            repo, remote, token, password, client, output, checksum, backup, date, last,
            recurse, recovername, authenticate, authfail_action, reduce_path,
            set_times, set_perms, set_attrs, set_acl, overwrite, hardlinks, targets,
        } => {
            let keys = password
                .as_deref()
                .map(|pw| KeySet::derive(pw, &client, &CryptoParams::default()));

            let opts = RecoverOptions {
                output,
                as_digests: checksum,
                recurse,
                recover_name: recovername,
                authenticate,
                authfail_action: match authfail_action.as_str() {
                    "keep"   => AuthFailAction::Keep,
                    "delete" => AuthFailAction::Delete,
                    _        => AuthFailAction::Rename,
                },
                reduce_path: match reduce_path.as_deref() {
                    None          => ReducePath::None,
                    Some("smart") => ReducePath::Smart,
                    Some(n)       => ReducePath::Components(n.parse()?),
                },
                set_times,
                set_perms,
                set_attrs,
                set_acl,
                overwrite: match overwrite.as_str() {
                    "always" => Overwrite::Always,
                    "newer"  => Overwrite::Newer,
                    "older"  => Overwrite::Older,
                    _        => Overwrite::Never,
                },
                hardlinks,
            };

            let selector = if let Some(name) = backup {
                SnapshotSelector::Named(name)
            } else if let Some(d) = &date {
                SnapshotSelector::AtTime(parse_date(d)?)
            } else if last {
                SnapshotSelector::LastContaining
            } else {
                SnapshotSelector::Latest
            };

            let failures = match remote {
                Some(url) => {
                    let catalog = RemoteCatalog::login(&url, &client, token.as_deref())?;
                    let recoverer = Recoverer::new(&catalog, &catalog, keys.as_ref(), opts);
                    run_recovery(&recoverer, &targets, &selector)?
                }
                None => {
                    let mut repo = Repository::open(&repo)?;
                    repo.set_keys(keys);
                    let recoverer = repo.recoverer(opts);
                    run_recovery(&recoverer, &targets, &selector)?
                }
            };
            if failures > 0 {
                eprintln!("{failures} file(s) could not be recovered");
            }
            std::process::exit(failures.min(255) as i32);
        }

        // ── Snapshots ────────────────────────────────────────────────────────
        Commands::Snapshots { repo } => {
            let repo = Repository::open(&repo)?;
            println!("{:<6} {:<24} {:>11} {:>11} {:>9} {:>5}",
                     "Set", "Name", "Started", "Ended", "Completed", "Prio");
            for snap in repo.catalog().list_snapshots()? {
                println!(
                    "{:<6} {:<24} {:>11} {:>11} {:>9} {:>5}",
                    snap.bset_id,
                    snap.name,
                    snap.start_time,
                    snap.end_time.map(|t| t.to_string()).unwrap_or_else(|| "—".into()),
                    if snap.completed { "yes" } else { "no" },
                    snap.priority,
                );
            }
        }

        // ── Purge ────────────────────────────────────────────────────────────
        Commands::Purge { repo, priority, before } => {
            let mut repo = Repository::open(&repo)?;
            let before_time = parse_date(&before)?;
            let current = repo
                .catalog()
                .last_snapshot(false)?
                .map(|s| s.bset_id)
                .unwrap_or(0);

            let (files, sets) = repo.catalog_mut().purge(priority, before_time, current)?;
            println!("Purged {files} file record(s) across {sets} snapshot(s)");

            // Sweep blobs nothing references any more.
            let orphans = repo.catalog().orphan_checksums()?;
            let mut removed = 0usize;
            for digest in orphans {
                repo.catalog_mut().delete_checksum(&digest)?;
                removed += repo
                    .cache()
                    .remove_suffixes(&digest, &["", ".sig", ".meta", ".basis"])?;
            }
            println!("Swept {removed} orphaned cache file(s)");
        }

        // ── Reencrypt ────────────────────────────────────────────────────────
        Commands::Reencrypt { repo, password, client, names, dirs, sigs, files, meta, all } => {
            let opts = if all {
                ReencryptOptions::all()
            } else {
                ReencryptOptions { names, dirs, sigs, files, meta }
            };
            if !opts.any() {
                return Err("specify at least one of --names --dirs --sigs --files --meta, or --all".into());
            }
            let keys = KeySet::derive(&password, &client, &CryptoParams::default());
            let mut repo = Repository::open(&repo)?;

            let stats = {
                let (catalog, cache) = repo.parts_mut();
                reencrypt::run(catalog, cache, &keys, &opts)?
            };
            println!("── Re-encryption ────────────────────────────────────────");
            println!("  Names encrypted:   {}", stats.names_encrypted);
            println!("  Dirs rehashed:     {}", stats.dirs_rehashed);
            println!("  Signatures:        {}", stats.sigs_generated);
            println!("  Files encrypted:   {}", stats.files_encrypted);
            println!("  Metadata sidecars: {}", stats.metas_written);
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn run_recovery(
    recoverer: &Recoverer,
    targets: &[String],
    selector: &SnapshotSelector,
) -> Result<u32, Box<dyn std::error::Error>> {
    let flag = recoverer.interrupt_flag();
    let _ = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst));
    match recoverer.recover(targets, selector) {
        Ok(failures) => Ok(failures),
        Err(snapvault::Error::Cancelled) => {
            eprintln!("recovery interrupted");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

/// Accept a few common timestamp spellings.
fn parse_date(s: &str) -> Result<i64, Box<dyn std::error::Error>> {
    use chrono::{NaiveDate, NaiveDateTime};
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(dt) = d.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    if let Ok(t) = s.parse::<i64>() {
        return Ok(t);
    }
    Err(format!("could not parse date string: {s}").into())
}
