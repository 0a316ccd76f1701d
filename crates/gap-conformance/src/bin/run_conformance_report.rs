#![forbid(unsafe_code)]

use std::path::PathBuf;

use gap_conformance::{
    HarnessConfig, emit_case_logs, run_gemv_conformance, run_ownership_conformance,
};
use gap_core::ExecutionMode;
use serde_json::json;

fn main() -> Result<(), String> {
    let mut mode = String::from("both");
    let mut output: Option<PathBuf> = None;
    let mut fixture_root: Option<PathBuf> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--mode requires one of: strict|hardened|both".to_string())?;
                mode = value;
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--fixtures" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--fixtures requires a directory".to_string())?;
                fixture_root = Some(PathBuf::from(value));
            }
            other => {
                return Err(format!(
                    "unknown arg '{other}'. usage: run_conformance_report [--mode strict|hardened|both] [--fixtures dir] [--output path]"
                ));
            }
        }
    }

    let modes = parse_modes(mode.as_str())?;
    let mut config = HarnessConfig::default_paths();
    if let Some(root) = fixture_root {
        config.fixture_root = root;
    }

    let mut suites = Vec::new();
    for mode in &modes {
        let (gemv, gemv_cases) = run_gemv_conformance(&config, *mode)?;
        let (ownership, ownership_cases) = run_ownership_conformance(&config, *mode)?;
        let failed: Vec<&str> = gemv_cases
            .iter()
            .filter(|case| !case.passed())
            .map(|case| case.name.as_str())
            .chain(
                ownership_cases
                    .iter()
                    .filter(|case| !case.passed())
                    .map(|case| case.name.as_str()),
            )
            .collect();
        suites.push(json!({
            "mode": mode.label(),
            "gemv": { "total": gemv.cases_total, "passed": gemv.cases_passed },
            "ownership": { "total": ownership.cases_total, "passed": ownership.cases_passed },
            "failed_cases": failed,
        }));
    }

    let log_summary = match output {
        Some(path) => {
            let summary = emit_case_logs(&config, path.as_path(), modes.as_slice())?;
            Some(json!({
                "output_path": summary.output_path.display().to_string(),
                "log_entries": summary.log_entries,
                "failed_entries": summary.failed_entries,
            }))
        }
        None => None,
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": "ok",
            "fixture_root": config.fixture_root.display().to_string(),
            "suites": suites,
            "case_log": log_summary,
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
