use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{error::ErrorKind, CommandFactory, Parser};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::cli::args::CliArgs;
use crate::cli::validation;
use crate::config::{self, ConfigFile, StageFile};
use crate::coordinator::StageSettings;
use crate::output::{self, ConsoleSink, OutputFormat};
use crate::runner::{Options, ParserMode, Runner, ScanResult};

fn print_banner() {
    const BANNER: &str = r#"
                                __    _
   ______________ _____  ____  / /   (_)___  ___
  / ___/ ___/ __ `/ __ \/ __ \/ /   / / __ \/ _ \
 (__  ) /__/ /_/ / / / / / / / /___/ / / / /  __/
/____/\___/\__,_/_/ /_/_/ /_/_____/_/_/ /_/\___/
"#;
    print!("{}", BANNER);
    println!(
        "       v{} - scan coordination and backpressure engine",
        env!("CARGO_PKG_VERSION")
    );
    println!();
}

fn format_kv_line(label: &str, value: &str) {
    println!(":: {:<10}: {}", label, value);
}

fn format_bool(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn render_custom_help() -> String {
    let cmd = CliArgs::command();
    let mut out = String::new();

    out.push_str(cmd.get_name());
    if let Some(version) = cmd.get_version() {
        out.push(' ');
        out.push_str(version);
    }
    out.push('\n');

    if let Some(about) = cmd.get_about() {
        out.push_str(&about.to_string());
        out.push('\n');
    }
    if let Some(long_about) = cmd.get_long_about() {
        out.push('\n');
        out.push_str(&long_about.to_string());
        out.push('\n');
    }

    out.push_str("\nUsage: ");
    out.push_str(cmd.get_name());
    out.push_str(" [OPTIONS]\n\n");

    let mut sections: Vec<(String, Vec<&clap::Arg>)> = Vec::new();
    let mut section_idx: HashMap<String, usize> = HashMap::new();
    for arg in cmd.get_arguments() {
        if arg.is_hide_set() {
            continue;
        }
        let heading = arg.get_help_heading().unwrap_or("Options").to_string();
        let idx = match section_idx.get(&heading).copied() {
            Some(i) => i,
            None => {
                sections.push((heading.clone(), Vec::new()));
                section_idx.insert(heading, sections.len() - 1);
                sections.len() - 1
            }
        };
        sections[idx].1.push(arg);
    }

    for (heading, args) in sections {
        out.push_str(&heading);
        out.push_str(":\n");
        for arg in args {
            let mut parts: Vec<String> = Vec::new();
            if let Some(short) = arg.get_short() {
                parts.push(format!("-{short}"));
            }
            if let Some(long) = arg.get_long() {
                parts.push(format!("--{long}"));
            }
            if let Some(aliases) = arg.get_visible_aliases() {
                for alias in aliases {
                    let rendered = format!("--{alias}");
                    if !parts.contains(&rendered) {
                        parts.push(rendered);
                    }
                }
            }
            let mut flags = parts.join(", ");
            if arg.get_action().takes_values() {
                let value_name = arg
                    .get_value_names()
                    .and_then(|names| names.first())
                    .map(|name| name.as_str())
                    .unwrap_or("VALUE");
                flags.push_str(&format!(" <{value_name}>"));
            }

            out.push_str("  ");
            out.push_str(&flags);
            out.push('\n');
            if let Some(help) = arg.get_help() {
                let help = help.to_string();
                if !help.trim().is_empty() {
                    out.push_str("          ");
                    out.push_str(help.trim());
                    out.push('\n');
                }
            }
            out.push('\n');
        }
    }
    out
}

/// Everything the CLI needs for one run, after merging defaults, the config
/// file and flags (flags win).
#[derive(Clone, Debug)]
struct RunConfig {
    options: Options,
    workers: usize,
    verbose: u8,
    no_color: bool,
    quiet: bool,
    show_errors: bool,
    output: Option<String>,
    output_format: OutputFormat,
}

fn apply_stage(
    name: &str,
    settings: &mut StageSettings,
    file: Option<StageFile>,
    cli: Option<&str>,
) -> Result<(), String> {
    if let Some(file) = file {
        settings.min_workers = file.min_workers.unwrap_or(settings.min_workers);
        settings.max_workers = file.max_workers.unwrap_or(settings.max_workers);
        settings.mem_capacity = file.mem_capacity.unwrap_or(settings.mem_capacity);
        settings.high_watermark = file.high_watermark.unwrap_or(settings.high_watermark);
    }
    if let Some(raw) = cli {
        let (min, max) = crate::utils::parse_range_usize(raw)
            .map_err(|e| format!("invalid --{name}-workers '{raw}': {e}"))?;
        settings.min_workers = min;
        settings.max_workers = max;
    }
    if settings.min_workers == 0 || settings.min_workers > settings.max_workers {
        return Err(format!(
            "invalid {name} workers: min {} must be at least 1 and at most max {}",
            settings.min_workers, settings.max_workers
        ));
    }
    Ok(())
}

fn build_run_config(args: CliArgs, cfg: ConfigFile) -> Result<RunConfig, String> {
    validation::validate(&args)?;

    let mut o = Options::default();

    o.targets = args.url.clone();
    if let Some(extra) = cfg.targets {
        o.targets.extend(extra);
    }
    o.input_file = args
        .input_file
        .or(cfg.input_file)
        .map(|p| config::expand_tilde(&p).to_string_lossy().to_string());

    o.plugins = match args.plugins.as_deref() {
        Some(raw) => crate::utils::parse_csv_list(raw),
        None => cfg.plugins.unwrap_or_default(),
    };
    for name in &o.plugins {
        if !crate::plugins::BUILTIN_PLUGINS.contains(&name.as_str()) {
            return Err(format!("unknown plugin '{name}' in config"));
        }
    }

    o.rate = args.rate.or(cfg.rate).unwrap_or(0);
    o.pool.pool_size = args.pool_size.or(cfg.pool_size).unwrap_or(o.pool.pool_size);
    o.pool.max_requests_per_connection = cfg
        .max_requests_per_connection
        .unwrap_or(o.pool.max_requests_per_connection);
    if let Some(secs) = cfg.idle_connection_timeout_s {
        o.pool.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.timeout.or(cfg.request_timeout_s) {
        o.pool.timeout.initial = Duration::from_secs(secs);
    }
    if let Some(ms) = cfg.timeout_floor_ms {
        o.pool.timeout.floor = Duration::from_millis(ms);
    }
    if let Some(ms) = cfg.timeout_ceiling_ms {
        o.pool.timeout.ceiling = Duration::from_millis(ms);
    }
    let timeout = o.pool.timeout;
    if timeout.floor > timeout.ceiling {
        return Err("invalid timeouts: floor must not exceed ceiling".to_string());
    }
    o.pool.timeout.initial = timeout.initial.clamp(timeout.floor, timeout.ceiling);

    o.max_body_bytes = cfg.max_body_bytes.unwrap_or(o.max_body_bytes);
    o.proxy = args.proxy.or(cfg.proxy).filter(|p| !p.trim().is_empty());
    o.follow_redirects = args.follow_redirects || cfg.follow_redirects.unwrap_or(false);
    if let Some(raw) = args.header.or(cfg.header) {
        o.headers = crate::utils::parse_header_lines(&raw).map_err(|e| format!("invalid header: {e}"))?;
    }

    let c = &mut o.coordinator;
    apply_stage("crawl", &mut c.crawl, cfg.crawl, args.crawl_workers.as_deref())?;
    apply_stage("audit", &mut c.audit, cfg.audit, args.audit_workers.as_deref())?;
    apply_stage("grep", &mut c.grep, cfg.grep, args.grep_workers.as_deref())?;
    apply_stage("output", &mut c.output, cfg.output_stage, None)?;

    c.admission.low_watermark = cfg.grep_low_watermark.unwrap_or(c.admission.low_watermark);
    c.admission.high_watermark = cfg.grep_high_watermark.unwrap_or(c.admission.high_watermark);
    if let Some(raw) = args.grep_watermarks.as_deref() {
        let (low, high) = crate::utils::parse_range_usize(raw)
            .map_err(|e| format!("invalid --grep-watermarks '{raw}': {e}"))?;
        c.admission.low_watermark = low;
        c.admission.high_watermark = high;
    }
    if c.admission.low_watermark >= c.admission.high_watermark {
        return Err(format!(
            "invalid grep watermarks: low {} must be below high {}",
            c.admission.low_watermark, c.admission.high_watermark
        ));
    }

    let scope = match args.scope.as_deref() {
        Some(raw) => crate::utils::parse_csv_list(raw),
        None => cfg.scope.unwrap_or_default(),
    };
    c.scope = scope.iter().map(|h| h.to_lowercase()).collect();
    c.max_depth = args.max_depth.or(cfg.max_depth).unwrap_or(c.max_depth);
    if let Some(dir) = args.spill_dir.or(cfg.spill_dir) {
        c.spill_dir = config::expand_tilde(&dir);
    }
    if let Some(secs) = args.plugin_timeout.or(cfg.plugin_timeout_s) {
        c.plugin_timeout = Duration::from_secs(secs);
        c.item_timeout = c.item_timeout.max(c.plugin_timeout * 3);
    }
    if let Some(secs) = cfg.shutdown_grace_s {
        c.shutdown_grace = Duration::from_secs(secs);
    }
    if let Some(ms) = cfg.resize_interval_ms {
        c.resize_interval = Duration::from_millis(ms.max(10));
    }

    o.parser.workers = args.parser_workers.or(cfg.parser_workers).unwrap_or(o.parser.workers);
    o.parser.memory_limit_mb = args
        .parser_memory_limit
        .or(cfg.parser_memory_limit_mb)
        .unwrap_or(o.parser.memory_limit_mb);
    if let Some(secs) = args.parser_timeout.or(cfg.parser_timeout_s) {
        o.parser.timeout = Duration::from_secs(secs.max(1));
    }
    o.parser.max_tasks = cfg.parser_max_tasks.unwrap_or(o.parser.max_tasks);
    o.parser.max_document_bytes = o.max_body_bytes;
    o.parser_mode = if args.inline_parser {
        ParserMode::Inline
    } else {
        ParserMode::Isolated
    };

    o.max_findings_per_plugin = args
        .max_findings_per_plugin
        .or(cfg.max_findings_per_plugin)
        .unwrap_or(o.max_findings_per_plugin);
    o.events_path = args.events.or(cfg.events);

    let output = args.output.or(cfg.output).filter(|p| !p.trim().is_empty());
    let output_format = match args.output_format.or(cfg.output_format) {
        Some(raw) => OutputFormat::parse(&raw)
            .ok_or_else(|| format!("invalid output format '{raw}', expected text, json, or xml"))?,
        None => output
            .as_deref()
            .and_then(output::infer_format_from_path)
            .unwrap_or(OutputFormat::Text),
    };

    let workers = args.workers.or(cfg.workers).unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    });

    Ok(RunConfig {
        options: o,
        workers: workers.max(1),
        verbose: args.verbose,
        no_color: args.no_color || cfg.no_color.unwrap_or(false),
        quiet: args.quiet,
        show_errors: args.show_errors,
        output,
        output_format,
    })
}

fn init_tracing(verbose: u8, no_color: bool) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("scanline={level}")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!no_color)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_summary(result: &ScanResult, elapsed: Duration) {
    let s = &result.summary;
    let c = &s.counters;
    println!();
    format_kv_line("Requests", &format!("{} ({} probes)", s.requests, s.probes));
    format_kv_line("Findings", &c.findings.to_string());
    format_kv_line(
        "Grep",
        &format!(
            "accepted {}, shed {}, seen {}",
            s.admission.accepted,
            s.admission.load_shed,
            s.admission.seen_url + s.admission.seen_body
        ),
    );
    format_kv_line(
        "Failures",
        &format!(
            "fetch {}, parser {}, plugin {}",
            c.fetch_failures,
            c.parser_failures(),
            c.plugin_errors
        ),
    );
    for d in &s.degraded {
        println!(
            "{} {} stage halted: {}",
            "::".bold().white(),
            d.stage.to_string().bold().red(),
            d.reason
        );
    }
    println!();
    let state = if s.cancelled { "Cancelled" } else { "Completed" };
    println!(":: {state} :: scan took {}s ::", elapsed.as_secs());
}

async fn run_async(run: RunConfig) -> Result<(), String> {
    if run.no_color {
        colored::control::set_override(false);
    }
    if !run.quiet {
        print_banner();
        let o = &run.options;
        let c = &o.coordinator;
        format_kv_line("Targets", &o.targets.join(", "));
        if let Some(path) = o.input_file.as_deref() {
            format_kv_line("Input", path);
        }
        format_kv_line(
            "Plugins",
            &if o.plugins.is_empty() {
                crate::plugins::BUILTIN_PLUGINS.join(",")
            } else {
                o.plugins.join(",")
            },
        );
        format_kv_line("Rate", &o.rate.to_string());
        format_kv_line(
            "Workers",
            &format!(
                "crawl {}-{}, audit {}-{}, grep {}-{}",
                c.crawl.min_workers,
                c.crawl.max_workers,
                c.audit.min_workers,
                c.audit.max_workers,
                c.grep.min_workers,
                c.grep.max_workers
            ),
        );
        format_kv_line(
            "Grep queue",
            &format!("{}-{}", c.admission.low_watermark, c.admission.high_watermark),
        );
        format_kv_line("Max depth", &c.max_depth.to_string());
        format_kv_line("Redirects", format_bool(o.follow_redirects));
        if let Some(path) = run.output.as_deref() {
            format_kv_line("Output", path);
        }
        println!();
    }

    let progress = if run.quiet {
        None
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_draw_target(ProgressDrawTarget::stderr());
        if let Ok(style) = ProgressStyle::with_template("{spinner:.blue} [{elapsed_precise}] {msg}") {
            pb.set_style(style);
        }
        pb.set_message("scanning");
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    };

    let runner = Runner::new(run.options.clone())
        .map_err(|e| e.to_string())?
        .with_sink(Arc::new(ConsoleSink::new(progress.clone(), run.show_errors)));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let pb_signal = progress.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Some(pb) = pb_signal.as_ref() {
                pb.set_message("cancelling, waiting for in-flight work");
            }
            warn!("interrupt received, cancelling scan");
            on_signal.cancel();
        }
    });

    let started = Instant::now();
    let outcome = runner.run(cancel).await;
    if let Some(pb) = progress.as_ref() {
        pb.finish_and_clear();
    }
    let result = outcome.map_err(|e| e.to_string())?;

    if let Some(path) = run.output.as_deref() {
        let path: PathBuf = config::expand_tilde(path);
        let rendered = output::render(run.output_format, &result.summary, &result.findings);
        let mut outfile = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| format!("failed to open output file {}: {e}", path.display()))?;
        outfile
            .write_all(&rendered)
            .await
            .map_err(|e| format!("failed to write output file {}: {e}", path.display()))?;
    }

    print_summary(&result, started.elapsed());
    Ok(())
}

pub fn run_cli() -> Result<(), String> {
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp => {
                print!("{}", render_custom_help());
                return Ok(());
            }
            ErrorKind::DisplayVersion => {
                print!("{}", CliArgs::command().render_version());
                return Ok(());
            }
            _ => return Err(e.to_string()),
        },
    };

    if args.list_plugins {
        for name in crate::plugins::BUILTIN_PLUGINS {
            println!("{name}");
        }
        return Ok(());
    }

    if args.init_config {
        let path = args
            .config
            .clone()
            .map(|p| config::expand_tilde(&p))
            .or_else(config::default_config_path)
            .ok_or_else(|| "cannot determine a config path; pass --cfg".to_string())?;
        config::ensure_default_config_file(&path)?;
        println!("{}", path.display());
        return Ok(());
    }

    let cfg = match args.config.clone().map(|p| config::expand_tilde(&p)) {
        Some(path) => config::load_config(&path, false)?,
        None => match config::default_config_path() {
            Some(path) => config::load_config(&path, true)?,
            None => ConfigFile::default(),
        },
    };

    let run = build_run_config(args, cfg)?;
    init_tracing(run.verbose, run.no_color);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(run.workers)
        .build()
        .map_err(|e| format!("failed to build runtime: {e}"))?;

    rt.block_on(run_async(run))
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use crate::model::Stage;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["scanline", "-u", "http://example.com/"];
        argv.extend_from_slice(extra);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn flags_override_config_file() {
        let cfg: ConfigFile = serde_yaml::from_str(
            "rate: 5\nmax_depth: 3\ngrep:\n  min_workers: 1\n  max_workers: 3\ngrep_low_watermark: 10\ngrep_high_watermark: 40\n",
        )
        .unwrap();
        let run = build_run_config(args(&["--rate", "9", "--grep-workers", "2-6"]), cfg).unwrap();
        let o = &run.options;
        assert_eq!(o.rate, 9);
        assert_eq!(o.coordinator.max_depth, 3);
        let grep = o.coordinator.stage(Stage::Grep);
        assert_eq!((grep.min_workers, grep.max_workers), (2, 6));
        assert_eq!(o.coordinator.admission.low_watermark, 10);
        assert_eq!(o.coordinator.admission.high_watermark, 40);
    }

    #[test]
    fn inverted_watermarks_from_config_are_rejected() {
        let cfg: ConfigFile =
            serde_yaml::from_str("grep_low_watermark: 50\ngrep_high_watermark: 20\n").unwrap();
        let err = build_run_config(args(&[]), cfg).unwrap_err();
        assert!(err.contains("watermarks"));
    }

    #[test]
    fn output_format_is_inferred_from_path() {
        let run = build_run_config(args(&["-o", "out/report.json"]), ConfigFile::default()).unwrap();
        assert_eq!(run.output_format, OutputFormat::Json);

        let run = build_run_config(
            args(&["-o", "out/report.json", "--output-format", "xml"]),
            ConfigFile::default(),
        )
        .unwrap();
        assert_eq!(run.output_format, OutputFormat::Xml);
    }

    #[test]
    fn config_targets_and_headers_are_merged() {
        let cfg: ConfigFile = serde_yaml::from_str(
            "urls: [http://other.test/]\nheader: \"X-Scan: 1; Cookie: a=b\"\n",
        )
        .unwrap();
        let run = build_run_config(args(&["--scope", "Example.com,cdn.example.com"]), cfg).unwrap();
        let o = &run.options;
        assert_eq!(o.targets, vec!["http://example.com/", "http://other.test/"]);
        assert_eq!(o.headers.len(), 2);
        assert_eq!(o.coordinator.scope, vec!["example.com", "cdn.example.com"]);
    }

    #[test]
    fn request_timeout_is_clamped_to_bounds() {
        let cfg: ConfigFile =
            serde_yaml::from_str("timeout_floor_ms: 3000\ntimeout_ceiling_ms: 5000\n").unwrap();
        let run = build_run_config(args(&["--timeout", "30"]), cfg).unwrap();
        assert_eq!(run.options.pool.timeout.initial, Duration::from_secs(5));
    }

    #[test]
    fn help_lists_every_heading() {
        let help = render_custom_help();
        for heading in ["Output:", "Input:", "Scan:", "Performance:", "Parser:", "HTTP:"] {
            assert!(help.contains(heading), "missing {heading}");
        }
        assert!(help.contains("--grep-watermarks <LOW-HIGH>"));
    }
}
