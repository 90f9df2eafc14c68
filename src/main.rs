//! `subline [config.json]`: translate stdin lines, print formatted blocks.
//!
//! Backend and language come from the environment:
//! `SUBLINE_BASE_URL`, `SUBLINE_API_KEY`, `SUBLINE_MODEL`,
//! `SUBLINE_SOURCE_LANG`, `SUBLINE_TARGET_LANG`.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use subline::{
    init_tracing, BatchDispatcher, FingerprintCache, Job, OpenAiCompatClient, PipelineConfig,
    TranslationParams,
};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => match PipelineConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path.display(), error = %e, "config rejected");
                return ExitCode::from(2);
            }
        },
        None => PipelineConfig::default(),
    };

    let lines: Vec<String> = match io::stdin().lock().lines().collect() {
        Ok(lines) => lines,
        Err(e) => {
            error!(error = %e, "failed to read stdin");
            return ExitCode::FAILURE;
        }
    };
    if lines.is_empty() {
        info!("no input lines");
        return ExitCode::SUCCESS;
    }

    let client = match OpenAiCompatClient::from_env() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "backend client init failed");
            return ExitCode::FAILURE;
        }
    };
    let cache = Arc::new(FingerprintCache::open(&config.cache));
    let dispatcher = match BatchDispatcher::new(client, cache, &config) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!(error = %e, "dispatcher rejected config");
            return ExitCode::from(2);
        }
    };

    let params = TranslationParams::new(
        env_or("SUBLINE_SOURCE_LANG", "en"),
        env_or("SUBLINE_TARGET_LANG", "zh-TW"),
        env_or("SUBLINE_MODEL", "gpt-4o-mini"),
    );
    let job = Job::from_lines(&lines, config.context_window);

    let report = match dispatcher.run(job, &params).await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "job rejected");
            return ExitCode::from(2);
        }
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for result in &report.results {
        let written = match &result.outcome {
            Ok(t) => writeln!(out, "{}\n{}\n", result.index + 1, t.text),
            Err(e) => {
                eprintln!("segment {}: {e}", result.index + 1);
                writeln!(out, "{}\n\n", result.index + 1)
            }
        };
        if let Err(e) = written {
            error!(error = %e, "failed to write output");
            return ExitCode::FAILURE;
        }
    }

    let s = &report.stats;
    eprintln!(
        "{} segments: {} translated, {} cached, {} blank, {} failed, {} cancelled ({} calls, {} retries) in {:.1}s",
        s.total,
        s.translated,
        s.from_cache,
        s.blank,
        s.failed,
        s.cancelled,
        s.backend_calls,
        s.retries,
        s.elapsed.as_secs_f64()
    );

    if report.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
