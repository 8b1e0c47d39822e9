use anyhow::Context;
use colored::Colorize;
use serde_json::json;
use tracing::debug;
use vmcp_core::{
    CheckpointConfig, Checkpointer, EventChainCheckpointer, MachineRecord, RecordState,
    VersionedCheckpointer,
};
use vmcp_types::{Hash, Value};

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    debug!(path = %config.path.display(), "opening checkpoint store");
    let cp = Checkpointer::open_read_only(&config)
        .with_context(|| format!("opening checkpoint store at {}", config.path.display()))?;
    let out = Output(cli.format);
    let result = match cli.command {
        Command::Keys => cmd_keys(&cp, out),
        Command::Machine(args) => cmd_machine(&cp, out, args),
        Command::Value(args) => cmd_value(&cp, out, args),
        Command::Versions => cmd_versions(&cp, out),
        Command::Version(args) => cmd_version(&cp, out, args),
        Command::Chains => cmd_chains(&cp, out),
        Command::Chain(args) => cmd_chain(&cp, out, args),
    };
    cp.close()?;
    result
}

fn load_config(cli: &Cli) -> anyhow::Result<CheckpointConfig> {
    let mut config = match &cli.config {
        Some(path) => CheckpointConfig::load(path)?,
        None => CheckpointConfig::default(),
    };
    if let Some(path) = &cli.path {
        config.path = path.clone();
    }
    Ok(config)
}

#[derive(Clone, Copy)]
struct Output(OutputFormat);

impl Output {
    fn json(self) -> bool {
        self.0 == OutputFormat::Json
    }

    fn emit(self, value: serde_json::Value) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(&value)?);
        Ok(())
    }
}

fn cmd_keys(cp: &Checkpointer, out: Output) -> anyhow::Result<()> {
    let keys = cp.machine_keys()?;
    if out.json() {
        let keys: Vec<_> = keys.iter().map(|k| render_key(k)).collect();
        return out.emit(json!({ "keys": keys }));
    }
    if keys.is_empty() {
        println!("No machines saved.");
    }
    for key in &keys {
        println!("{}", render_key(key).yellow());
    }
    Ok(())
}

fn cmd_machine(cp: &Checkpointer, out: Output, args: KeyArgs) -> anyhow::Result<()> {
    let key = parse_key(&args.key)?;
    let record = cp.machine_record(&key)?;
    if out.json() {
        return out.emit(record_json(&record));
    }
    println!("Machine {}", render_key(&key).yellow().bold());
    print_record(&record, "  ");
    Ok(())
}

fn cmd_value(cp: &Checkpointer, out: Output, args: ValueArgs) -> anyhow::Result<()> {
    let hash = Hash::from_hex(args.hash.trim())?;
    let value = cp.restore_value(hash)?;
    let refs = cp.ref_count(&hash)?;
    if out.json() {
        return out.emit(json!({
            "hash": hash.to_hex(),
            "refs": refs,
            "value": render_value(&value, VALUE_RENDER_NODES),
        }));
    }
    println!("{} {}", "✓".green().bold(), hash.to_hex().cyan());
    println!("  Refs:  {}", refs.to_string().bold());
    println!("  Value: {}", render_value(&value, VALUE_RENDER_NODES));
    Ok(())
}

fn cmd_versions(cp: &Checkpointer, out: Output) -> anyhow::Result<()> {
    let vcp = VersionedCheckpointer::open(cp)?;
    let (min, max) = vcp.known_versions();
    if out.json() {
        return out.emit(json!({ "min": min, "max": max }));
    }
    if max < 0 {
        println!("No versions saved.");
    } else {
        println!("Versions {} through {}", min.to_string().yellow(), max.to_string().yellow());
    }
    Ok(())
}

fn cmd_version(cp: &Checkpointer, out: Output, args: VersionArgs) -> anyhow::Result<()> {
    let vcp = VersionedCheckpointer::open(cp)?;
    let record = vcp.version_record(args.version)?;
    if out.json() {
        return out.emit(json!({
            "version": args.version,
            "machine": record_json(&record.machine),
            "aux": record.aux.as_deref().map(hex::encode),
        }));
    }
    println!("Version {}", args.version.to_string().yellow().bold());
    print_record(&record.machine, "  ");
    match &record.aux {
        Some(aux) => println!("  Aux:     {} bytes", aux.len()),
        None => println!("  Aux:     {}", "none".dimmed()),
    }
    Ok(())
}

fn cmd_chains(cp: &Checkpointer, out: Output) -> anyhow::Result<()> {
    let keys = EventChainCheckpointer::chain_keys(cp)?;
    if out.json() {
        let keys: Vec<_> = keys.iter().map(|k| render_key(k)).collect();
        return out.emit(json!({ "chains": keys }));
    }
    if keys.is_empty() {
        println!("No event chains.");
    }
    for key in &keys {
        println!("{}", render_key(key).yellow());
    }
    Ok(())
}

fn cmd_chain(cp: &Checkpointer, out: Output, args: KeyArgs) -> anyhow::Result<()> {
    let key = parse_key(&args.key)?;
    let ecc = EventChainCheckpointer::restore(cp, &key)?;
    let next_seq = ecc.next_seq_num()?;
    let time_bounds = ecc.time_bounds()?;
    let balances = ecc.balance_tracker()?;
    let last_signed = ecc.last_signed_seq()?;
    let states = (0..next_seq)
        .map(|seq| ecc.record_state(seq))
        .collect::<Result<Vec<_>, _>>()?;

    if out.json() {
        return out.emit(json!({
            "key": render_key(ecc.key()),
            "time_bounds": time_bounds,
            "balance_tracker": hex::encode(&balances),
            "next_seq": next_seq,
            "last_signed": last_signed,
            "records": states,
        }));
    }

    let [lo, hi] = time_bounds;
    println!("Chain {}", render_key(ecc.key()).yellow().bold());
    println!("  Time bounds: [{lo}, {hi}]");
    println!("  Balances:    {} bytes", balances.len());
    println!("  Next seq:    {}", next_seq.to_string().bold());
    match last_signed {
        Some(seq) => println!("  Last signed: {seq}"),
        None => println!("  Last signed: {}", "none".dimmed()),
    }
    for (seq, state) in states.iter().enumerate() {
        let label = match state {
            RecordState::SignaturesRecorded => "signed".green(),
            RecordState::IntentRecorded => "intent".yellow(),
            RecordState::Empty => "empty".dimmed(),
        };
        println!("  #{seq:<6} {label}");
    }
    Ok(())
}

fn print_record(record: &MachineRecord, indent: &str) {
    println!("{indent}Hash:    {}", record.machine_hash.to_hex().cyan());
    println!("{indent}Code:    {} bytes", record.code.len());
    for (i, root) in record.roots.iter().enumerate() {
        println!("{indent}Root {i}:  {}", root.short_hex().dimmed());
    }
}

fn record_json(record: &MachineRecord) -> serde_json::Value {
    json!({
        "machine_hash": record.machine_hash.to_hex(),
        "code_len": record.code.len(),
        "roots": record.roots.iter().map(Hash::to_hex).collect::<Vec<_>>(),
    })
}

/// Nodes printed before a value is elided. Shared sub-values are printed once
/// per occurrence, so a small DAG can expand exponentially.
const VALUE_RENDER_NODES: usize = 256;

fn render_value(value: &Value, max_nodes: usize) -> String {
    let mut out = String::new();
    let mut budget = max_nodes;
    write_value(value, &mut budget, &mut out);
    out
}

fn write_value(value: &Value, budget: &mut usize, out: &mut String) {
    if *budget == 0 {
        out.push_str("...");
        return;
    }
    *budget -= 1;
    match value {
        Value::Int(v) => out.push_str(&v.to_string()),
        Value::EmptyTuple => out.push_str("()"),
        Value::Tuple(_) => {
            out.push('(');
            for (i, item) in value.children().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                if *budget == 0 {
                    out.push_str("...");
                    break;
                }
                write_value(item, budget, out);
            }
            out.push(')');
        }
    }
}

/// `0x`-prefixed input is hex; anything else is taken as UTF-8 bytes.
fn parse_key(raw: &str) -> anyhow::Result<Vec<u8>> {
    match raw.strip_prefix("0x") {
        Some(digits) => hex::decode(digits).with_context(|| format!("invalid hex key {raw:?}")),
        None => Ok(raw.as_bytes().to_vec()),
    }
}

fn render_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) if !s.starts_with("0x") => s.to_string(),
        _ => format!("0x{}", hex::encode(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_render_back_to_parseable_form() {
        for key in [b"main".to_vec(), vec![0xff, 0x00], b"0xabc".to_vec()] {
            assert_eq!(parse_key(&render_key(&key)).unwrap(), key);
        }
    }

    #[test]
    fn bad_hex_key_is_an_error() {
        assert!(parse_key("0xzz").is_err());
    }

    #[test]
    fn small_values_render_in_full() {
        let v = Value::tuple(vec![Value::int(1), Value::EmptyTuple, Value::int(-2)]).unwrap();
        assert_eq!(render_value(&v, VALUE_RENDER_NODES), v.to_string());
    }

    #[test]
    fn shared_dag_render_is_bounded() {
        // 2^40 leaves once expanded, but only 41 distinct nodes.
        let mut v = Value::int(7);
        for _ in 0..40 {
            v = Value::tuple(vec![v.clone(), v]).unwrap();
        }
        let rendered = render_value(&v, 16);
        assert!(rendered.contains("..."));
        assert!(rendered.len() < 200);
    }
}
