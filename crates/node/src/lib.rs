//! The `beand` daemon: configuration, data-directory lock, chain state startup, and the
//! import, minter and checkpoint threads.

pub mod config;
mod store;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use beand_chainstate::import::{import_file, ImportError};
use beand_chainstate::minter::{sleep_unless_shutdown, MinterConfig, StakeMinter};
use beand_chainstate::state::{ChainState, ChainStateConfig};
use beand_consensus::{chain_params, hash256_to_hex, Hash256};
use beand_log::{log_error, log_info, log_warn, LogConfig};
use fs2::FileExt;
use serde_json::json;
use tokio::sync::watch;

use crate::config::{usage, CliAction, Config};
use crate::store::Store;

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const BOOTSTRAP_FILE_NAME: &str = "bootstrap.dat";
const BLOCKS_DIR_NAME: &str = "blocks";
const DB_DIR_NAME: &str = "db";
const DEBUG_LOG_FILE_NAME: &str = "debug.log";
const CHECKPOINT_SIGN_INTERVAL: Duration = Duration::from_secs(60);
const HALT_POLL_INTERVAL: Duration = Duration::from_secs(1);

type Chain = ChainState<Store>;

#[derive(Debug)]
struct DataDirLock {
    _file: File,
}

pub async fn run_entry() -> Result<(), String> {
    match config::parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("beand {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(*config).await,
    }
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "data dir {} is already locked (another beand instance may be running); lock file {}{suffix}",
                data_dir.display(),
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

async fn run_with_config(config: Config) -> Result<(), String> {
    fs::create_dir_all(&config.data_dir).map_err(|err| {
        format!(
            "failed to create data dir {}: {err}",
            config.data_dir.display()
        )
    })?;
    let _lock = lock_data_dir(&config.data_dir)?;

    beand_log::init(&LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
        print_to_console: config.print_to_console,
        file: Some(config.data_dir.join(DEBUG_LOG_FILE_NAME)),
    })
    .map_err(|err| err.to_string())?;

    log_info!(
        "beand {} starting on {} (data dir {}, backend {}, checkpoint policy {})",
        env!("CARGO_PKG_VERSION"),
        config.network.as_str(),
        config.data_dir.display(),
        config.backend.as_str(),
        config.checkpoint_mode.as_str()
    );
    for key in &config.unsupported_conf_keys {
        log_warn!(
            "ignoring unsupported option '{key}' in {}",
            config.conf_path.display()
        );
    }

    let params = chain_params(config.network);
    let store = Store::open(config.backend, &config.data_dir.join(DB_DIR_NAME))
        .map_err(|err| format!("failed to open storage: {err}"))?;
    let chain_config = ChainStateConfig {
        checkpoint_mode: config.checkpoint_mode,
        ..ChainStateConfig::default()
    };
    let chain = ChainState::open(
        Arc::new(store),
        params.clone(),
        config.data_dir.join(BLOCKS_DIR_NAME),
        chain_config,
    )
    .map_err(|err| format!("failed to open chain state: {err}"))?;
    let chain = Arc::new(chain);

    let tip = chain.best_tip().map_err(|err| err.to_string())?;
    log_info!(
        "best block {} at height {}",
        hash256_to_hex(&tip.hash),
        tip.height
    );

    let report = chain
        .verify_chain(config.check_level, config.check_blocks)
        .map_err(|err| format!("corrupted block database detected: {err}"))?;
    log_info!(
        "verified {} blocks at level {}",
        report.blocks,
        report.level
    );

    if config.print_block_tree {
        print!("{}", chain.block_tree().map_err(|err| err.to_string())?);
        return Ok(());
    }
    if let Some(prefix) = &config.print_block {
        return print_blocks(&chain, prefix);
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut workers: Vec<thread::JoinHandle<()>> = Vec::new();

    workers.push(spawn_worker("import", {
        let chain = Arc::clone(&chain);
        let shutdown = Arc::clone(&shutdown);
        let files = config.load_blocks.clone();
        let bootstrap = config.data_dir.join(BOOTSTRAP_FILE_NAME);
        let magic = params.message_start;
        move || import_thread(&chain, magic, bootstrap, files, &shutdown)
    })?);

    if config.sprouting {
        match config.stake_key {
            Some(secret) => {
                let minter_config = MinterConfig {
                    reserve_balance: config.reserve_balance,
                    minimize_bean_age: config.minimize_bean_age,
                };
                let minter = StakeMinter::new(Arc::clone(&chain), secret, minter_config)
                    .map_err(|err| format!("failed to start stake minter: {err}"))?;
                let shutdown = Arc::clone(&shutdown);
                let interval = config.miner_sleep;
                workers.push(spawn_worker("minter", move || {
                    minter.run(&shutdown, interval)
                })?);
            }
            None => log_info!("no -stakekey configured; stake minting disabled"),
        }
    }

    if let Some(secret) = config.checkpoint_key {
        let chain = Arc::clone(&chain);
        let shutdown = Arc::clone(&shutdown);
        workers.push(spawn_worker("checkpoint", move || {
            checkpoint_thread(&chain, secret, &shutdown)
        })?);
    }

    let mut halt_poll = tokio::time::interval(HALT_POLL_INTERVAL);
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = halt_poll.tick() => {
                if chain.is_halted() {
                    log_error!("chain state halted after a storage failure; shutting down");
                    break;
                }
            }
        }
    }

    log_info!("shutting down");
    shutdown.store(true, Ordering::SeqCst);
    for worker in workers {
        if worker.join().is_err() {
            log_warn!("worker thread panicked during shutdown");
        }
    }

    if chain.is_halted() {
        return Err("stopped after a storage failure; see debug.log".to_string());
    }
    log_info!("shutdown complete");
    Ok(())
}

fn spawn_worker<F>(name: &str, body: F) -> Result<thread::JoinHandle<()>, String>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("beand-{name}"))
        .spawn(body)
        .map_err(|err| format!("failed to spawn {name} thread: {err}"))
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    log_warn!("failed to install SIGTERM handler: {err}");
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        log_info!("signal received; requesting shutdown");
        let _ = shutdown_tx.send(true);
    });
}

/// Imports `bootstrap.dat` (renamed to `bootstrap.dat.old` once fully read), then every
/// `-loadblock` file in order.
fn import_thread(
    chain: &Chain,
    magic: [u8; 4],
    bootstrap: PathBuf,
    files: Vec<PathBuf>,
    shutdown: &AtomicBool,
) {
    if bootstrap.exists() {
        match import_one(chain, &bootstrap, magic, shutdown) {
            Some(true) => {
                let mut old = bootstrap.clone().into_os_string();
                old.push(".old");
                if let Err(err) = fs::rename(&bootstrap, &old) {
                    log_warn!("failed to rename {}: {err}", bootstrap.display());
                }
            }
            Some(false) => {}
            None => return,
        }
    }
    for file in files {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        if import_one(chain, &file, magic, shutdown).is_none() {
            return;
        }
    }
}

/// `Some(completed)` to keep going, `None` when importing must stop altogether.
fn import_one(chain: &Chain, path: &Path, magic: [u8; 4], shutdown: &AtomicBool) -> Option<bool> {
    match import_file(path, magic, shutdown, |bytes| chain.submit_block(bytes)) {
        Ok(stats) if stats.interrupted => None,
        Ok(stats) => {
            if stats.skipped_bytes > 0 {
                log_warn!(
                    "skipped {} unreadable bytes in {}",
                    stats.skipped_bytes,
                    path.display()
                );
            }
            Some(true)
        }
        Err(ImportError::Io(err)) => {
            log_warn!("failed to import {}: {err}", path.display());
            Some(false)
        }
        Err(err @ ImportError::Halted(_)) => {
            log_error!("{err}");
            None
        }
    }
}

/// Signs a checkpoint for every new tip until shutdown.
fn checkpoint_thread(chain: &Chain, secret: [u8; 32], shutdown: &AtomicBool) {
    let mut signed: Option<Hash256> = None;
    while !shutdown.load(Ordering::SeqCst) && !chain.is_halted() {
        match chain.best_tip() {
            Ok(tip) if signed != Some(tip.hash) => match chain.sign_tip_checkpoint(&secret) {
                Ok(checkpoint) => {
                    log_info!(
                        "signed checkpoint {} at height {}",
                        hash256_to_hex(&checkpoint.hash),
                        checkpoint.height
                    );
                    signed = Some(checkpoint.hash);
                }
                Err(err) => log_warn!("failed to sign checkpoint: {err}"),
            },
            Ok(_) => {}
            Err(err) => log_warn!("failed to read best tip: {err}"),
        }
        sleep_unless_shutdown(shutdown, CHECKPOINT_SIGN_INTERVAL);
    }
}

fn print_blocks(chain: &Chain, prefix: &str) -> Result<(), String> {
    let matches = chain
        .find_blocks_by_prefix(prefix)
        .map_err(|err| err.to_string())?;
    if matches.is_empty() {
        return Err(format!("no block hash starts with '{prefix}'"));
    }
    for hash in matches {
        let Some(info) = chain.block_info(&hash).map_err(|err| err.to_string())? else {
            continue;
        };
        let block = chain
            .read_block_by_hash(&hash)
            .map_err(|err| err.to_string())?;
        let mut value = json!({
            "hash": hash256_to_hex(&info.hash),
            "height": info.height,
            "status": format!("{:?}", info.status),
            "active": info.is_active,
            "chain_weight": info.chain_weight.to_string(),
            "proof_of_stake": info.is_proof_of_stake,
            "failure": info.failure.map(|kind| format!("{kind:?}")),
        });
        if let Some(block) = block {
            value["version"] = json!(block.header.version);
            value["previous"] = json!(hash256_to_hex(&block.header.prev_block));
            value["merkle_root"] = json!(hash256_to_hex(&block.header.merkle_root));
            value["time"] = json!(block.header.time);
            value["bits"] = json!(format!("{:08x}", block.header.bits));
            value["nonce"] = json!(block.header.nonce);
            value["tx"] = json!(block
                .transactions
                .iter()
                .map(|tx| hash256_to_hex(&tx.txid()))
                .collect::<Vec<_>>());
            value["signature_bytes"] = json!(block.signature.len());
        }
        let text = serde_json::to_string_pretty(&value).map_err(|err| err.to_string())?;
        println!("{text}");
    }
    Ok(())
}
