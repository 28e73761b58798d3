use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use kroma_guard_core::analysis::analyze;
use kroma_guard_core::history::{HistoryStore, SqliteHistoryStore};
use kroma_guard_core::settings::{
    load_guard_settings, resolve_history_db_path, resolve_settings_path, GuardSettings,
    GuardSettingsOverlay,
};
use kroma_guard_core::tools::{registry, ToolCallProposal};
use kroma_guard_core::validation::{ParameterValidator, ResultExpectation, ResultValidator};
use serde_json::{json, Map, Value};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

const DEFAULT_HISTORY_LIMIT: usize = 20;

fn main() -> CliResult<()> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let Some(command) = cli_args.first().map(String::as_str) else {
        print_usage();
        return Ok(());
    };
    let rest = &cli_args[1..];
    if rest
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_usage();
        return Ok(());
    }

    let output = match command {
        "analyze" => run_analyze_cli(rest)?,
        "validate-params" => run_validate_params_cli(rest)?,
        "validate-result" => run_validate_result_cli(rest)?,
        "history" => run_history_cli(rest)?,
        "tools" => run_tools_cli(rest)?,
        "-h" | "--help" => {
            print_usage();
            return Ok(());
        }
        unknown => {
            return Err(std::io::Error::other(format!(
                "Unknown command: {unknown}\n\nUse --help for usage."
            ))
            .into());
        }
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_analyze_cli(args: &[String]) -> CliResult<Value> {
    let flags = parse_flag_values(args, &["--image"])?;
    let image = read_image_arg(required(&flags, "--image")?)?;
    Ok(serde_json::to_value(analyze(&image)?)?)
}

fn run_validate_params_cli(args: &[String]) -> CliResult<Value> {
    let flags = parse_flag_values(
        args,
        &["--tool", "--params", "--image", "--history-db", "--settings"],
    )?;
    let settings = load_cli_settings(flags.get("--settings").map(String::as_str))?;
    let image = read_image_arg(required(&flags, "--image")?)?;
    let proposal = ToolCallProposal::new(
        required(&flags, "--tool")?,
        parse_params_arg(flags.get("--params").map(String::as_str))?,
    );
    let history = open_history(flags.get("--history-db").map(String::as_str))?;
    let analysis = analyze(&image)?;
    let validator = ParameterValidator::new(settings, history);
    Ok(serde_json::to_value(validator.validate(&proposal, &analysis))?)
}

fn run_validate_result_cli(args: &[String]) -> CliResult<Value> {
    let flags = parse_flag_values(
        args,
        &["--tool", "--before", "--after", "--params", "--settings"],
    )?;
    let settings = load_cli_settings(flags.get("--settings").map(String::as_str))?;
    let tool = required(&flags, "--tool")?;
    let spec = registry()
        .get(tool)
        .ok_or_else(|| std::io::Error::other(format!("Unknown tool: {tool}")))?;
    let before = read_image_arg(required(&flags, "--before")?)?;
    let after = read_image_arg(required(&flags, "--after")?)?;
    let params = parse_params_arg(flags.get("--params").map(String::as_str))?;
    let before_dims = analyze(&before)?.dimensions();
    let expectation = ResultExpectation::for_tool(spec, &params, before_dims);
    let result = ResultValidator::new(settings).validate(spec.name, &before, &after, &expectation);
    Ok(serde_json::to_value(result)?)
}

fn run_history_cli(args: &[String]) -> CliResult<Value> {
    let flags = parse_flag_values(args, &["--tool", "--limit", "--history-db"])?;
    let tool = required(&flags, "--tool")?;
    let limit = match flags.get("--limit") {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| std::io::Error::other(format!("Invalid --limit value: {raw}")))?,
        None => DEFAULT_HISTORY_LIMIT,
    };
    let history = open_history(flags.get("--history-db").map(String::as_str))?;
    let records = history.recent_for_tool(tool.trim(), limit)?;
    Ok(json!({
        "ok": true,
        "tool": tool.trim(),
        "count": records.len(),
        "records": records
    }))
}

fn run_tools_cli(args: &[String]) -> CliResult<Value> {
    parse_flag_values(args, &[])?;
    let tools = registry().iter().collect::<Vec<_>>();
    Ok(json!({ "tools": tools }))
}

/// Collects `--flag value` pairs, rejecting flags outside `known`.
fn parse_flag_values(args: &[String], known: &[&str]) -> CliResult<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> CliResult<String> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            known_flag if known.contains(&known_flag) => {
                out.insert(known_flag.to_string(), needs_value(i)?);
                i += 2;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }
    Ok(out)
}

fn required<'a>(flags: &'a BTreeMap<String, String>, flag: &str) -> CliResult<&'a str> {
    flags
        .get(flag)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| std::io::Error::other(format!("Missing required {flag}")).into())
}

/// Accepts a filesystem path or a `data:image/...;base64,` URL.
fn read_image_arg(value: &str) -> CliResult<Vec<u8>> {
    if let Some(rest) = value.strip_prefix("data:") {
        let Some((_, payload)) = rest.split_once(";base64,") else {
            return Err(std::io::Error::other("Data URL images must be base64 encoded").into());
        };
        return Ok(BASE64_STANDARD.decode(payload.trim())?);
    }
    Ok(std::fs::read(value)?)
}

fn parse_params_arg(raw: Option<&str>) -> CliResult<Map<String, Value>> {
    let Some(raw) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(std::io::Error::other("--params must be a JSON object").into()),
    }
}

fn load_cli_settings(explicit_path: Option<&str>) -> CliResult<GuardSettings> {
    let Some(path) = resolve_settings_path(explicit_path) else {
        return Ok(GuardSettings::default());
    };
    Ok(load_guard_settings(
        Some(path.as_path()),
        None,
        &GuardSettingsOverlay::default(),
    )?)
}

fn open_history(explicit_path: Option<&str>) -> CliResult<Arc<SqliteHistoryStore>> {
    let store = SqliteHistoryStore::new(resolve_history_db_path(explicit_path));
    store.initialize()?;
    Ok(Arc::new(store))
}

fn print_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  kroma-guard analyze --image <path|data-url>\n",
        "  kroma-guard validate-params --tool <name> --params <json> --image <path|data-url> ",
        "[--history-db PATH] [--settings PATH]\n",
        "  kroma-guard validate-result --tool <name> --before <path|data-url> --after <path|data-url> ",
        "[--params <json>] [--settings PATH]\n",
        "  kroma-guard history --tool <name> [--limit N] [--history-db PATH]\n",
        "  kroma-guard tools\n\n",
        "Environment:\n",
        "  KROMA_GUARD_SETTINGS    settings file (TOML or JSON) when --settings is absent\n",
        "  KROMA_GUARD_HISTORY_DB  history database (default: var/guard/history.db)\n",
        "  RUST_LOG                log filter (default: info)\n"
    ));
}
