//! CLI command implementations

use crate::output::{format_bytes, format_size, truncate};
use crate::progress::DownloadProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Context, Result};
use batchdl_core::BatchCore;
use batchdl_types::{CoreEvent, Job, Settings, SINGLE_STREAM_HEADER};
use console::style;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;

// ============================================================================
// Download Commands
// ============================================================================

pub struct GetOptions {
    pub output: Option<PathBuf>,
    pub chunks: Option<u32>,
    pub single_stream: bool,
    pub headers: Vec<String>,
}

/// Build the batch for `urls`, saving into `dir`
fn build_jobs(urls: &[String], dir: &Path, options: &GetOptions) -> Result<Vec<Job>> {
    let headers = options
        .headers
        .iter()
        .map(|raw| parse_header(raw))
        .collect::<Result<Vec<_>>>()?;

    urls.iter()
        .map(|raw| {
            let url = url::Url::parse(raw).with_context(|| format!("Invalid URL: {}", raw))?;
            let mut job = Job::new(raw.clone(), dir.join(file_name_for(&url)));
            for (name, value) in &headers {
                job = job.with_header(name.clone(), value.clone());
            }
            if options.single_stream {
                job = job.with_header(SINGLE_STREAM_HEADER, "1");
            }
            Ok(job)
        })
        .collect()
}

/// `Name: value` into its two halves
fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Header must look like 'Name: value', got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("Header name is empty in '{}'", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Last non-empty path segment of the URL, or `download`
fn file_name_for(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "download".to_string())
}

pub async fn get_download(
    core: &BatchCore,
    urls: Vec<String>,
    options: GetOptions,
    format: OutputFormat,
) -> Result<()> {
    let dir = options
        .output
        .clone()
        .unwrap_or_else(|| core.get_settings().default_download_path);
    let jobs = build_jobs(&urls, &dir, &options)?;

    if let Some(chunks) = options.chunks {
        core.set_chunk_count(chunks).await;
    }

    let label = match jobs.as_slice() {
        [job] => job
            .destination
            .file_name()
            .map(|name| truncate(&name.to_string_lossy(), 30))
            .unwrap_or_default(),
        jobs => format!("{} files", jobs.len()),
    };

    // Subscribe before submitting so no event is missed
    let mut events = core.subscribe();
    let id = core.submit(jobs)?;
    let progress = match format {
        OutputFormat::Human => Some(DownloadProgress::new(id, label)),
        _ => None,
    };

    let outcome = loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                core.pause(id).await;
                if let Some(progress) = &progress {
                    progress.handle_event(&CoreEvent::Paused { id });
                }
                println!(
                    "{} Paused. Run the same command again to resume.",
                    style("⏸").yellow()
                );
                return Ok(());
            }
            event = events.recv() => event,
        };

        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break Err(anyhow!("Event channel closed")),
        };
        if event.id() != id {
            continue;
        }

        if let OutputFormat::Json = format {
            if !matches!(event, CoreEvent::Progress(_)) {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        if let Some(progress) = &progress {
            progress.handle_event(&event);
        }

        match event {
            CoreEvent::Completed { .. } => break Ok(()),
            CoreEvent::Error { reason, .. } => break Err(anyhow!(reason)),
            CoreEvent::Cancelled { .. } => break Err(anyhow!("Download cancelled")),
            _ => {}
        }
    };

    if outcome.is_ok() {
        if let OutputFormat::Table = format {
            println!("{} Saved to {}", style("✓").green().bold(), dir.display());
        }
    }
    outcome
}

// ============================================================================
// Probe Commands
// ============================================================================

pub async fn probe_urls(core: &BatchCore, urls: Vec<String>, format: OutputFormat) -> Result<()> {
    #[derive(serde::Serialize)]
    struct ProbeReport {
        url: String,
        size: Option<u64>,
        accepts_ranges: bool,
        error: Option<String>,
    }

    let mut reports = Vec::with_capacity(urls.len());
    for url in urls {
        let report = match core.probe(&url).await {
            Ok(result) => ProbeReport {
                url,
                size: result.size,
                accepts_ranges: result.accepts_ranges,
                error: None,
            },
            Err(e) => ProbeReport {
                url,
                size: None,
                accepts_ranges: false,
                error: Some(e.to_string()),
            },
        };
        reports.push(report);
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct ProbeRow {
                url: String,
                size: String,
                ranges: String,
            }

            let rows: Vec<ProbeRow> = reports
                .iter()
                .map(|report| ProbeRow {
                    url: truncate(&report.url, 50),
                    size: format_size(report.size),
                    ranges: match (&report.error, report.accepts_ranges) {
                        (Some(_), _) => "error",
                        (None, true) => "Yes",
                        (None, false) => "No",
                    }
                    .to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            for report in &reports {
                if let Some(ref error) = report.error {
                    println!(
                        "{} {}: {}",
                        style("✗").red(),
                        report.url,
                        style(error).red()
                    );
                    continue;
                }
                println!("{} {}", style("✓").green(), report.url);
                println!("    Size: {}", format_size(report.size));
                println!(
                    "    Resumable: {}",
                    if report.accepts_ranges {
                        style("Yes").green()
                    } else {
                        style("No").yellow()
                    }
                );
            }
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

const CONFIG_KEYS: &[&str] = &[
    "default_download_path",
    "chunk_count",
    "parallel_threshold_bytes",
    "max_retries",
    "retry_base_delay_ms",
    "probe_timeout_secs",
    "progress_interval_ms",
    "part_poll_interval_ms",
    "user_agent",
    "suspicious_size.enabled",
    "suspicious_size.min_bytes",
    "suspicious_size.max_retries",
];

fn config_value(settings: &Settings, key: &str) -> Result<String> {
    Ok(match key {
        "default_download_path" => settings.default_download_path.display().to_string(),
        "chunk_count" => settings.chunk_count.to_string(),
        "parallel_threshold_bytes" => settings.parallel_threshold_bytes.to_string(),
        "max_retries" => settings.max_retries.to_string(),
        "retry_base_delay_ms" => settings.retry_base_delay_ms.to_string(),
        "probe_timeout_secs" => settings.probe_timeout_secs.to_string(),
        "progress_interval_ms" => settings.progress_interval_ms.to_string(),
        "part_poll_interval_ms" => settings.part_poll_interval_ms.to_string(),
        "user_agent" => settings.user_agent.clone(),
        "suspicious_size.enabled" => settings.suspicious_size.enabled.to_string(),
        "suspicious_size.min_bytes" => settings.suspicious_size.min_bytes.to_string(),
        "suspicious_size.max_retries" => settings.suspicious_size.max_retries.to_string(),
        _ => bail!("Unknown config key: {} (known: {})", key, CONFIG_KEYS.join(", ")),
    })
}

fn set_config_value(settings: &mut Settings, key: &str, value: &str) -> Result<()> {
    match key {
        "default_download_path" => settings.default_download_path = PathBuf::from(value),
        "chunk_count" => settings.chunk_count = value.parse::<u32>()?.max(1),
        "parallel_threshold_bytes" => settings.parallel_threshold_bytes = value.parse()?,
        "max_retries" => settings.max_retries = value.parse::<u32>()?.max(1),
        "retry_base_delay_ms" => settings.retry_base_delay_ms = value.parse()?,
        "probe_timeout_secs" => settings.probe_timeout_secs = value.parse()?,
        "progress_interval_ms" => settings.progress_interval_ms = value.parse()?,
        "part_poll_interval_ms" => settings.part_poll_interval_ms = value.parse()?,
        "user_agent" => settings.user_agent = value.to_string(),
        "suspicious_size.enabled" => settings.suspicious_size.enabled = value.parse()?,
        "suspicious_size.min_bytes" => settings.suspicious_size.min_bytes = value.parse()?,
        "suspicious_size.max_retries" => settings.suspicious_size.max_retries = value.parse()?,
        _ => bail!("Unknown config key: {}", key),
    }
    Ok(())
}

pub async fn config_action(
    core: &BatchCore,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = core.get_settings();

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                _ => {
                    println!("batchdl Configuration:");
                    println!();
                    for key in CONFIG_KEYS {
                        println!("  {}: {}", key, config_value(&settings, key)?);
                    }
                    println!();
                    println!(
                        "  Files above {} are split into {} chunks",
                        format_bytes(settings.parallel_threshold_bytes),
                        settings.chunk_count
                    );
                    println!("  Stored in {}", core.storage().settings_path().display());
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            println!("{}", config_value(&core.get_settings(), &key)?);
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = core.get_settings();
            set_config_value(&mut settings, &key, &value)
                .with_context(|| format!("Invalid value for {}: {}", key, value))?;
            core.update_settings(settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset) => {
            use dialoguer::Confirm;

            let confirmed = Confirm::new()
                .with_prompt("Reset all settings to defaults?")
                .default(false)
                .interact()?;

            if confirmed {
                core.reset_settings().await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> GetOptions {
        GetOptions {
            output: None,
            chunks: None,
            single_stream: false,
            headers: Vec::new(),
        }
    }

    #[test]
    fn parses_headers() {
        assert_eq!(
            parse_header("Authorization: Bearer a:b").unwrap(),
            ("Authorization".to_string(), "Bearer a:b".to_string())
        );
        assert!(parse_header("no colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn names_files_after_the_url_path() {
        let url = url::Url::parse("https://example.com/dir/file.iso?x=1").unwrap();
        assert_eq!(file_name_for(&url), "file.iso");
        let url = url::Url::parse("https://example.com/").unwrap();
        assert_eq!(file_name_for(&url), "download");
    }

    #[test]
    fn builds_jobs_with_flags_and_headers() {
        let mut options = options();
        options.single_stream = true;
        options.headers = vec!["Cookie: a=b".to_string()];

        let jobs = build_jobs(
            &["https://example.com/a.bin".to_string()],
            Path::new("/tmp/out"),
            &options,
        )
        .unwrap();

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].destination, PathBuf::from("/tmp/out/a.bin"));
        assert!(jobs[0].forces_single_stream());
        assert_eq!(jobs[0].headers.get("Cookie").map(String::as_str), Some("a=b"));
    }

    #[test]
    fn config_keys_round_trip() {
        let mut settings = Settings::default();
        set_config_value(&mut settings, "chunk_count", "4").unwrap();
        set_config_value(&mut settings, "suspicious_size.enabled", "true").unwrap();
        assert_eq!(config_value(&settings, "chunk_count").unwrap(), "4");
        assert_eq!(config_value(&settings, "suspicious_size.enabled").unwrap(), "true");
        assert!(set_config_value(&mut settings, "nope", "1").is_err());
        assert!(set_config_value(&mut settings, "max_retries", "x").is_err());
        for key in CONFIG_KEYS {
            assert!(config_value(&settings, key).is_ok());
        }
    }
}
