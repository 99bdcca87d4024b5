#![forbid(unsafe_code)]

use std::path::PathBuf;

use of_conformance::{HarnessConfig, emit_elementwise_matrix, mode_label};
use of_core::ExecutionMode;
use of_dispatch::OpKind;
use serde_json::json;

const USAGE: &str = "usage: run_elementwise_matrix [--mode strict|hardened|both] [--op Div|Log|Sqr|Sigmoid] [--samples N] [--seed N] [--output path] [--print-full-log]";

fn main() -> Result<(), String> {
    let mut mode = String::from("both");
    let mut output: Option<PathBuf> = None;
    let mut op: Option<OpKind> = None;
    let mut print_full_log = false;
    let mut config = HarnessConfig::from_env()?;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                mode = args
                    .next()
                    .ok_or_else(|| "--mode requires one of: strict|hardened|both".to_string())?;
            }
            "--op" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--op requires an operator name (e.g., Sigmoid)".to_string())?;
                op = Some(OpKind::from_name(value.as_str()).map_err(|error| error.to_string())?);
            }
            "--samples" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--samples requires a count".to_string())?;
                config.samples_per_case = value
                    .parse()
                    .map_err(|error| format!("invalid --samples '{value}': {error}"))?;
            }
            "--seed" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--seed requires an unsigned integer".to_string())?;
                config.base_seed = value
                    .parse()
                    .map_err(|error| format!("invalid --seed '{value}': {error}"))?;
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--print-full-log" => {
                print_full_log = true;
            }
            other => {
                return Err(format!("unknown arg '{other}'. {USAGE}"));
            }
        }
    }

    let modes = parse_modes(mode.as_str())?;
    let output_path = output.unwrap_or_else(|| config.matrix_path());

    let summary = emit_elementwise_matrix(&config, output_path.as_path(), modes.as_slice(), op)?;

    if print_full_log {
        let raw = std::fs::read_to_string(summary.output_path.as_path()).map_err(|error| {
            format!(
                "failed to read generated matrix log {}: {error}",
                summary.output_path.display()
            )
        })?;
        print!("{raw}");
        return Ok(());
    }

    let mode_labels: Vec<&str> = summary.modes.iter().copied().map(mode_label).collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": if summary.failed_entries == 0 { "ok" } else { "failures" },
            "output_path": summary.output_path.display().to_string(),
            "log_entries": summary.log_entries,
            "failed_entries": summary.failed_entries,
            "modes": mode_labels,
            "op_filter": summary.op_filter.map(OpKind::name),
            "samples_per_case": config.samples_per_case,
            "base_seed": config.base_seed,
        }))
        .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    Ok(())
}

fn parse_modes(raw: &str) -> Result<Vec<ExecutionMode>, String> {
    match raw {
        "strict" => Ok(vec![ExecutionMode::Strict]),
        "hardened" => Ok(vec![ExecutionMode::Hardened]),
        "both" => Ok(vec![ExecutionMode::Strict, ExecutionMode::Hardened]),
        _ => Err(format!(
            "unsupported mode '{raw}'; expected strict|hardened|both"
        )),
    }
}
