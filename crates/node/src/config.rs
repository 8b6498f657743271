//! Command line and `beancash.conf` parsing.
//!
//! Options are bitcoind style: `-name`, `-name=value`, `--name=value`, and `-noname` for a
//! false boolean. The config file holds `name=value` lines and never overrides the command
//! line.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use beand_chainstate::verify::{DEFAULT_CHECK_BLOCKS, DEFAULT_CHECK_LEVEL};
use beand_consensus::money::{money_range, Amount, COIN};
use beand_consensus::{chain_params, select_network, CheckpointMode, Network};
use beand_log::{Format, Level};
use beand_primitives::wif_to_secret_key;

pub const CONF_FILE_NAME: &str = "beancash.conf";
const DEFAULT_DATA_DIR_NAME: &str = ".beancash";
const DEFAULT_MINER_SLEEP_MS: u64 = 500;
const MAX_CHECK_LEVEL: u32 = 6;

const BOOL_OPTIONS: &[&str] = &[
    "testnet",
    "regtest",
    "sprouting",
    "minimizebeanage",
    "printblocktree",
    "debug",
    "logtimestamps",
    "printtoconsole",
    "help",
    "version",
];

const VALUE_OPTIONS: &[&str] = &[
    "datadir",
    "conf",
    "backend",
    "cppolicy",
    "loadblock",
    "minersleep",
    "reservebalance",
    "stakekey",
    "checkpointkey",
    "printblock",
    "checkblocks",
    "checklevel",
    "loglevel",
    "logformat",
];

/// Options that only make sense on the command line.
const COMMAND_LINE_ONLY: &[&str] = &["datadir", "conf", "help", "version"];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub network: Network,
    /// Network-specific data directory (the base directory plus the network suffix).
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub backend: Backend,
    pub checkpoint_mode: CheckpointMode,
    pub load_blocks: Vec<PathBuf>,
    pub sprouting: bool,
    pub miner_sleep: Duration,
    pub reserve_balance: Amount,
    pub stake_key: Option<[u8; 32]>,
    pub checkpoint_key: Option<[u8; 32]>,
    pub minimize_bean_age: bool,
    pub print_block_tree: bool,
    pub print_block: Option<String>,
    pub check_blocks: u32,
    pub check_level: u32,
    pub log_level: Level,
    pub log_format: Format,
    pub log_timestamps: bool,
    pub print_to_console: bool,
    /// Config file keys that were ignored.
    pub unsupported_conf_keys: Vec<String>,
}

#[derive(Debug)]
pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

type Options = HashMap<String, Vec<String>>;

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut options = Options::new();
    for arg in raw_args {
        match arg.as_str() {
            "-h" | "-?" => return Ok(CliAction::PrintHelp),
            "-V" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
        let Some(body) = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-')) else {
            return Err(format!("unexpected argument '{arg}'"));
        };
        let (name, value) = split_option(body)?;
        options.entry(name).or_default().push(value);
    }

    if flag(&options, "help", false)? {
        return Ok(CliAction::PrintHelp);
    }
    if flag(&options, "version", false)? {
        return Ok(CliAction::PrintVersion);
    }

    let base_dir = match last(&options, "datadir") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        Some(_) => return Err("-datadir requires a path".to_string()),
        None => default_data_dir(),
    };
    let conf_path = match last(&options, "conf") {
        Some(path) if !path.is_empty() => {
            let path = PathBuf::from(path);
            if path.is_absolute() {
                path
            } else {
                base_dir.join(path)
            }
        }
        Some(_) => return Err("-conf requires a path".to_string()),
        None => base_dir.join(CONF_FILE_NAME),
    };

    let mut unsupported_conf_keys = Vec::new();
    if let Some(conf) = load_conf(&conf_path)? {
        for (key, values) in conf {
            let known = BOOL_OPTIONS.contains(&key.as_str()) || VALUE_OPTIONS.contains(&key.as_str());
            if !known || COMMAND_LINE_ONLY.contains(&key.as_str()) {
                unsupported_conf_keys.push(key);
                continue;
            }
            options.entry(key).or_insert(values);
        }
        unsupported_conf_keys.sort();
    }

    let network = select_network(flag(&options, "testnet", false)?, flag(&options, "regtest", false)?)
        .map_err(|err| err.to_string())?;
    let params = chain_params(network);
    let data_dir = match params.data_dir_suffix {
        Some(suffix) => base_dir.join(suffix),
        None => base_dir,
    };

    let backend = match last(&options, "backend") {
        Some(raw) => Backend::parse(raw).ok_or_else(|| format!("invalid -backend '{raw}'"))?,
        None => Backend::Fjall,
    };
    let checkpoint_mode = match last(&options, "cppolicy") {
        Some(raw) => {
            CheckpointMode::parse(raw).ok_or_else(|| format!("invalid -cppolicy '{raw}'"))?
        }
        None => CheckpointMode::default(),
    };

    let mut load_blocks = Vec::new();
    for raw in options.get("loadblock").into_iter().flatten() {
        if raw.is_empty() {
            return Err("-loadblock requires a file".to_string());
        }
        load_blocks.push(PathBuf::from(raw));
    }

    let miner_sleep_ms = number::<u64>(&options, "minersleep")?.unwrap_or(DEFAULT_MINER_SLEEP_MS);
    let reserve_balance = match last(&options, "reservebalance") {
        Some(raw) => parse_amount(raw).map_err(|err| format!("invalid -reservebalance: {err}"))?,
        None => 0,
    };

    let stake_key = match last(&options, "stakekey") {
        Some(raw) => Some(
            wif_to_secret_key(raw, &params.base58)
                .map_err(|err| format!("invalid -stakekey: {err}"))?
                .0,
        ),
        None => None,
    };
    let checkpoint_key = match last(&options, "checkpointkey") {
        Some(raw) => Some(
            wif_to_secret_key(raw, &params.base58)
                .map_err(|err| format!("invalid -checkpointkey: {err}"))?
                .0,
        ),
        None => None,
    };

    let print_block = match last(&options, "printblock") {
        Some(raw) if raw.is_empty() || !raw.chars().all(|ch| ch.is_ascii_hexdigit()) => {
            return Err(format!("invalid -printblock hash prefix '{raw}'"));
        }
        Some(raw) => Some(raw.to_ascii_lowercase()),
        None => None,
    };

    let check_blocks = number::<u32>(&options, "checkblocks")?.unwrap_or(DEFAULT_CHECK_BLOCKS);
    let check_level = number::<u32>(&options, "checklevel")?.unwrap_or(DEFAULT_CHECK_LEVEL);
    if check_level > MAX_CHECK_LEVEL {
        return Err(format!("-checklevel must be between 0 and {MAX_CHECK_LEVEL}"));
    }

    let mut log_level = if flag(&options, "debug", false)? {
        Level::Debug
    } else {
        Level::Info
    };
    if let Some(raw) = last(&options, "loglevel") {
        log_level = Level::parse(raw).ok_or_else(|| format!("invalid -loglevel '{raw}'"))?;
    }
    let log_format = match last(&options, "logformat") {
        Some(raw) => Format::parse(raw).ok_or_else(|| format!("invalid -logformat '{raw}'"))?,
        None => Format::Text,
    };

    Ok(CliAction::Run(Box::new(Config {
        network,
        data_dir,
        conf_path,
        backend,
        checkpoint_mode,
        load_blocks,
        sprouting: flag(&options, "sprouting", true)?,
        miner_sleep: Duration::from_millis(miner_sleep_ms),
        reserve_balance,
        stake_key,
        checkpoint_key,
        minimize_bean_age: flag(&options, "minimizebeanage", false)?,
        print_block_tree: flag(&options, "printblocktree", false)?,
        print_block,
        check_blocks,
        check_level,
        log_level,
        log_format,
        log_timestamps: flag(&options, "logtimestamps", true)?,
        print_to_console: flag(&options, "printtoconsole", false)?,
        unsupported_conf_keys,
    })))
}

/// Splits `name[=value]`, folding `-nofoo` into `foo=0` for boolean options.
fn split_option(body: &str) -> Result<(String, String), String> {
    let (name, value) = match body.split_once('=') {
        Some((name, value)) => (name.to_ascii_lowercase(), value.trim().to_string()),
        None => (body.to_ascii_lowercase(), String::new()),
    };
    if BOOL_OPTIONS.contains(&name.as_str()) || VALUE_OPTIONS.contains(&name.as_str()) {
        return Ok((name, value));
    }
    if let Some(negated) = name.strip_prefix("no") {
        if BOOL_OPTIONS.contains(&negated) {
            let enabled = parse_bool(&value)
                .ok_or_else(|| format!("invalid value '{value}' for -{name}"))?;
            let value = if enabled { "0" } else { "1" };
            return Ok((negated.to_string(), value.to_string()));
        }
    }
    Err(format!("unknown option -{name}"))
}

fn last<'a>(options: &'a Options, name: &str) -> Option<&'a str> {
    options
        .get(name)
        .and_then(|values| values.last())
        .map(String::as_str)
}

fn flag(options: &Options, name: &str, default: bool) -> Result<bool, String> {
    match last(options, name) {
        Some(raw) => parse_bool(raw).ok_or_else(|| format!("invalid value '{raw}' for -{name}")),
        None => Ok(default),
    }
}

fn number<T: std::str::FromStr>(options: &Options, name: &str) -> Result<Option<T>, String> {
    match last(options, name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("invalid value '{raw}' for -{name}")),
        None => Ok(None),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Parses a decimal coin amount with at most 8 fractional digits.
pub fn parse_amount(value: &str) -> Result<Amount, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("amount is empty".to_string());
    }
    if value.starts_with('-') {
        return Err("amount must be >= 0".to_string());
    }
    let (whole, frac) = match value.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (value, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(format!("invalid amount '{value}'"));
    }
    if frac.len() > 8 {
        return Err(format!("amount has too many decimal places '{value}'"));
    }
    let digits = |part: &str| part.chars().all(|ch| ch.is_ascii_digit());
    if !digits(whole) || !digits(frac) {
        return Err(format!("invalid amount '{value}'"));
    }

    let whole: Amount = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| format!("invalid amount '{value}'"))?
    };
    let frac: Amount = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<8}")
            .parse()
            .map_err(|_| format!("invalid amount '{value}'"))?
    };
    let amount = whole
        .checked_mul(COIN)
        .and_then(|coins| coins.checked_add(frac))
        .filter(|amount| money_range(*amount))
        .ok_or_else(|| format!("amount out of range '{value}'"))?;
    Ok(amount)
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(DEFAULT_DATA_DIR_NAME),
        None => PathBuf::from(DEFAULT_DATA_DIR_NAME),
    }
}

/// Reads `name=value` lines, skipping blanks and `#` comments. A missing file is `None`.
fn load_conf(path: &Path) -> Result<Option<Options>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out = Options::new();
    for raw_line in contents.lines() {
        let line = match raw_line.find('#') {
            Some(idx) => &raw_line[..idx],
            None => raw_line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, ""),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

pub fn usage() -> String {
    [
        "Usage:",
        "  beand [options]",
        "",
        "Options:",
        "  -help, -h, -?              Print this help and exit",
        "  -version, -V               Print version and exit",
        "  -conf=<file>               Config file (default: <datadir>/beancash.conf)",
        "  -datadir=<dir>             Data directory (default: ~/.beancash)",
        "  -testnet                   Use the test network",
        "  -regtest                   Use the regression test network",
        "  -backend=<fjall|memory>    Storage backend (default: fjall)",
        "  -cppolicy=<policy>         Checkpoint policy: strict, advisory or permissive (default: strict)",
        "  -loadblock=<file>          Import blocks from an external blk*.dat file (repeatable)",
        "  -checkblocks=<n>           How many blocks to check at startup (default: 600, 0 = all)",
        "  -checklevel=<n>            How thorough the block verification is, 0 to 6 (default: 1)",
        "  -printblocktree            Print the block tree and exit",
        "  -printblock=<prefix>       Print blocks whose hash starts with <prefix> and exit",
        "",
        "Staking:",
        "  -sprouting                 Mint proof-of-stake blocks (default: 1)",
        "  -stakekey=<wif>            Private key whose outputs are staked",
        "  -minersleep=<ms>           Delay between minting attempts (default: 500)",
        "  -reservebalance=<amount>   Keep this amount out of staking",
        "  -minimizebeanage           Stake the smallest eligible outputs first",
        "  -checkpointkey=<wif>       Sign checkpoints for the local tip with this key",
        "",
        "Logging:",
        "  -debug                     Log at debug level",
        "  -loglevel=<level>          error, warn, info, debug or trace",
        "  -logformat=<text|json>     Log record format (default: text)",
        "  -logtimestamps             Prefix records with timestamps (default: 1)",
        "  -printtoconsole            Send log records to stderr as well as debug.log",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_config(args: &[&str]) -> Result<Config, String> {
        match parse_args_from(args.iter().map(|arg| arg.to_string()))? {
            CliAction::Run(config) => Ok(*config),
            other => Err(format!("unexpected action {other:?}")),
        }
    }

    fn in_dir(dir: &Path, args: &[&str]) -> Result<Config, String> {
        let mut all = vec![format!("-datadir={}", dir.display())];
        all.extend(args.iter().map(|arg| arg.to_string()));
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        run_config(&refs)
    }

    #[test]
    fn defaults_select_mainnet_and_strict_checkpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = in_dir(dir.path(), &[]).expect("config");
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.checkpoint_mode, CheckpointMode::Strict);
        assert_eq!(config.backend, Backend::Fjall);
        assert!(config.sprouting);
        assert_eq!(config.miner_sleep, Duration::from_millis(500));
        assert_eq!(config.check_blocks, 600);
        assert_eq!(config.check_level, 1);
        assert_eq!(config.log_level, Level::Info);
    }

    #[test]
    fn testnet_and_regtest_together_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = in_dir(dir.path(), &["-testnet", "-regtest"]).expect_err("conflict");
        assert!(err.contains("-testnet and -regtest"));
    }

    #[test]
    fn network_selects_data_subdirectory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let test = in_dir(dir.path(), &["--testnet"]).expect("testnet");
        assert_eq!(test.data_dir, dir.path().join("testnet2"));
        let regtest = in_dir(dir.path(), &["-regtest=1"]).expect("regtest");
        assert_eq!(regtest.data_dir, dir.path().join("regtest"));
    }

    #[test]
    fn invalid_values_are_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        for args in [
            &["-cppolicy=lenient"][..],
            &["-backend=rocks"],
            &["-checklevel=7"],
            &["-checkblocks=-1"],
            &["-minersleep=soon"],
            &["-reservebalance=1.123456789"],
            &["-logformat=xml"],
            &["-stakekey=notakey"],
            &["-printblock=xyz"],
            &["-sprouting=maybe"],
            &["-bogus"],
        ] {
            assert!(in_dir(dir.path(), args).is_err(), "{args:?}");
        }
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert!(matches!(
            parse_args_from(["-help".to_string()]),
            Ok(CliAction::PrintHelp)
        ));
        assert!(matches!(
            parse_args_from(["--version".to_string(), "-bogus".to_string()]),
            Err(_)
        ));
        assert!(matches!(
            parse_args_from(["-V".to_string()]),
            Ok(CliAction::PrintVersion)
        ));
    }

    #[test]
    fn conf_file_fills_in_but_command_line_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(CONF_FILE_NAME),
            "# node settings\ncppolicy=advisory\nminersleep=250\nloadblock=a.dat\nrpcport=1\nsprouting=0\n",
        )
        .expect("write conf");
        let config = in_dir(dir.path(), &["-cppolicy=permissive", "-loadblock=b.dat"]).expect("config");
        assert_eq!(config.checkpoint_mode, CheckpointMode::Permissive);
        assert_eq!(config.miner_sleep, Duration::from_millis(250));
        assert_eq!(config.load_blocks, vec![PathBuf::from("b.dat")]);
        assert!(!config.sprouting);
        assert_eq!(config.unsupported_conf_keys, vec!["rpcport".to_string()]);
    }

    #[test]
    fn negated_flags_and_debug_level() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = in_dir(dir.path(), &["-nosprouting", "-debug", "-nologtimestamps"]).expect("config");
        assert!(!config.sprouting);
        assert!(!config.log_timestamps);
        assert_eq!(config.log_level, Level::Debug);

        let config = in_dir(dir.path(), &["-debug", "-loglevel=warn"]).expect("config");
        assert_eq!(config.log_level, Level::Warn);
    }

    #[test]
    fn amounts_parse_to_base_units() {
        assert_eq!(parse_amount("1"), Ok(COIN));
        assert_eq!(parse_amount("0.5"), Ok(COIN / 2));
        assert_eq!(parse_amount(".00000001"), Ok(1));
        assert_eq!(parse_amount("12.3"), Ok(12 * COIN + 30_000_000));
        assert!(parse_amount("-1").is_err());
        assert!(parse_amount("1e5").is_err());
        assert!(parse_amount("999999999999").is_err());
    }

    #[test]
    fn stake_key_decodes_for_the_selected_network() {
        let dir = tempfile::tempdir().expect("tempdir");
        let secret = [0x11u8; 32];
        let params = chain_params(Network::Regtest);
        let wif = beand_primitives::secret_key_to_wif(&secret, &params.base58, true);
        let config = in_dir(dir.path(), &["-regtest", &format!("-stakekey={wif}")]).expect("config");
        assert_eq!(config.stake_key, Some(secret));
        assert!(in_dir(dir.path(), &[&format!("-stakekey={wif}")]).is_err());
    }
}
