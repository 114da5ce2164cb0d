use clap::{Arg, ArgAction, ArgGroup, Command};
use clap::parser::ValueSource;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use slipscan::{
    config::{RealTestConfig, ScanConfig},
    events::{self, EventReceiver, ScanEvent},
    output::{OutputWriters, RealTestFormat},
    realtest::{self, Orchestrator, RealTestMode},
    scanner::{Counters, ScanEngine},
    utils::file_input::{self, LossyLines, TokenSource},
    ScanError,
};

// File descriptor headroom for Unix systems
#[cfg(unix)]
fn ensure_fd_headroom(threads: usize) {
    use rlimit::Resource;

    let desired = threads as u64 + 128;
    match Resource::NOFILE.get() {
        Ok((soft, hard)) => {
            if soft >= desired {
                return;
            }
            let target = desired.min(hard);
            if Resource::NOFILE.set(target, hard).is_ok() {
                println!(
                    "{} {}",
                    "[~] Raising open-file limit to".bright_blue(),
                    target.to_string().bright_cyan().bold()
                );
            } else {
                log::warn!(
                    "Could not raise the open-file limit above {}, large scans may hit it",
                    soft
                );
            }
        }
        Err(_) => log::warn!("Could not read the open-file limit"),
    }
}

#[cfg(not(unix))]
fn ensure_fd_headroom(_threads: usize) {}

fn print_banner() {
    println!("{}", " ____  _     ___ ____  ____   ____    _    _   _ ".truecolor(0, 188, 212).bold());
    println!("{}", "/ ___|| |   |_ _|  _ \\/ ___| / ___|  / \\  | \\ | |".truecolor(0, 188, 212).bold());
    println!("{}", "\\___ \\| |    | || |_) \\___ \\| |     / _ \\ |  \\| |".truecolor(0, 188, 212).bold());
    println!("{}", " ___) | |___ | ||  __/ ___) | |___ / ___ \\| |\\  |".truecolor(0, 188, 212).bold());
    println!("{}", "|____/|_____|___|_|   |____/ \\____/_/   \\_\\_| \\_|".truecolor(0, 188, 212).bold());
    println!();
    println!("{}", "Slipscan – finds the resolvers that really tunnel ⚡".truecolor(255, 215, 0).bold());
    println!();
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
        .unwrap()
        .progress_chars("█▉▊▋▌▍▎▏ ")
}

/// What the event renderer is driving the progress bar with
enum RenderMode {
    Scan,
    RealTest,
}

/// Turn the pipeline's event stream into a progress bar plus the
/// line-per-result stdout contract. Scan hits print as
/// `ip<TAB>ms<TAB>detail`, real-test results as `RT<TAB>ip<TAB>status<TAB>ms`
/// (no prefix in realtest-only mode).
async fn render_events(mut events: EventReceiver, quiet: bool, mode: RenderMode) {
    let mut bar: Option<ProgressBar> = None;
    let mut ok = 0u64;
    let mut fail = 0u64;

    while let Some(event) = events.recv().await {
        match event {
            ScanEvent::Started { total, workers } => {
                let pb = ProgressBar::new(total);
                pb.set_style(progress_style());
                pb.set_message(format!("workers={}", workers));
                bar = Some(pb);
            }
            ScanEvent::Scan(result) => {
                if result.ok {
                    ok += 1;
                } else {
                    fail += 1;
                }
                let line = if result.ok && !quiet {
                    Some(format!(
                        "{}\t{}\t{}",
                        result.target,
                        result.elapsed_display(),
                        result.detail
                    ))
                } else {
                    None
                };
                if let Some(pb) = &bar {
                    if matches!(mode, RenderMode::Scan) {
                        pb.inc(1);
                    }
                    pb.set_message(format!("ok={} fail={}", ok, fail));
                    if let Some(line) = line {
                        pb.println(line);
                    }
                } else if let Some(line) = line {
                    println!("{}", line);
                }
            }
            ScanEvent::RealTestStarted { target } => {
                if let (Some(pb), RenderMode::RealTest) = (&bar, &mode) {
                    pb.set_message(format!("testing {}", target));
                }
            }
            ScanEvent::RealTest(result) => {
                let line = if quiet {
                    None
                } else {
                    let prefix = match mode {
                        RenderMode::Scan => "RT\t",
                        RenderMode::RealTest => "",
                    };
                    Some(format!(
                        "{}{}\t{}\t{}",
                        prefix,
                        result.target,
                        result.status,
                        result.elapsed_display()
                    ))
                };
                if let Some(pb) = &bar {
                    if matches!(mode, RenderMode::RealTest) {
                        pb.inc(1);
                    }
                    if let Some(line) = line {
                        pb.println(line);
                    }
                } else if let Some(line) = line {
                    println!("{}", line);
                }
            }
            ScanEvent::DrainStarted { pending } => {
                let line = format!(
                    "{} Waiting for {} outstanding real tests",
                    "[~]".bright_blue(),
                    pending.to_string().bright_cyan()
                );
                match &bar {
                    Some(pb) => pb.println(line),
                    None => println!("{}", line),
                }
            }
            ScanEvent::Finished(_) => {
                if let Some(pb) = bar.take() {
                    pb.finish_and_clear();
                }
                break;
            }
        }
    }
}

fn read_stdin_lines() -> Vec<String> {
    LossyLines::new(std::io::stdin().lock()).collect()
}

fn print_summary(counters: &Counters, show_scan: bool, show_rt: bool) {
    println!();
    if show_scan {
        println!(
            "{} {} scanned, {} ok, {} fail",
            "[✓]".bright_green(),
            counters.scan_done.to_string().bright_cyan().bold(),
            counters.scan_ok.to_string().bright_green().bold(),
            counters.scan_fail.to_string().bright_red()
        );
    }
    if show_rt {
        println!(
            "{} {} real-tested, {} ok, {} fail",
            "[✓]".bright_green(),
            counters.rt_done.to_string().bright_cyan().bold(),
            counters.rt_ok.to_string().bright_green().bold(),
            counters.rt_fail.to_string().bright_red()
        );
    }
}

async fn cmd_scan(matches: &clap::ArgMatches) -> anyhow::Result<i32> {
    let domain = matches.get_one::<String>("domain").unwrap().trim().to_string();
    if domain.is_empty() {
        eprintln!("{}", "ERROR: --domain is required".bright_red());
        return Ok(2);
    }

    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => ScanConfig::from_toml_file(path)?,
        None => ScanConfig::load_default_config(),
    };
    config.domain = domain;

    let from_cli = |id: &str| matches.value_source(id) == Some(ValueSource::CommandLine);
    if from_cli("timeout-ms") {
        config.timeout_ms = *matches.get_one::<u64>("timeout-ms").unwrap();
    }
    if from_cli("threads") {
        config.threads = (*matches.get_one::<usize>("threads").unwrap()).max(1);
    }
    if from_cli("random-per-cidr") {
        config.random_per_cidr = *matches.get_one::<u32>("random-per-cidr").unwrap();
    }
    if from_cli("auto-realtest") {
        config.realtest.mode = matches
            .get_one::<String>("auto-realtest")
            .unwrap()
            .parse::<RealTestMode>()?;
    }
    if let Some(ms) = matches.get_one::<i64>("realtest-ms-max") {
        config.realtest.ms_max = Some(*ms);
    }
    if from_cli("realtest-timeout-s") {
        config.realtest.timeout_s = *matches.get_one::<f64>("realtest-timeout-s").unwrap();
    }
    if from_cli("realtest-ready-ms") {
        config.realtest.ready_ms = *matches.get_one::<u64>("realtest-ready-ms").unwrap();
    }
    if from_cli("realtest-parallel") {
        config.realtest.parallel = (*matches.get_one::<usize>("realtest-parallel").unwrap()).max(1);
    }
    if from_cli("live-drain-timeout-s") {
        config.realtest.drain_timeout_s = *matches.get_one::<f64>("live-drain-timeout-s").unwrap();
    }
    if let Some(path) = matches.get_one::<String>("realtest-slipstream-path") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            config.realtest.binary_path = trimmed.to_string();
        }
    }

    if let Err(e) = config.validate() {
        eprintln!("{} {}", "ERROR:".bright_red(), e);
        return Ok(2);
    }

    let quiet = matches.get_flag("quiet");
    if !quiet {
        print_banner();
    }

    let format: RealTestFormat = matches
        .get_one::<String>("realtest-ok-format")
        .unwrap()
        .parse()?;
    let outputs = OutputWriters::new(
        matches.get_one::<PathBuf>("scan-ok-out").map(|p| p.as_path()),
        matches.get_one::<PathBuf>("realtest-ok-out").map(|p| p.as_path()),
        format,
    )?;

    // File input wins over inline tokens when both are present
    let source = if let Some(path) = matches.get_one::<String>("file") {
        if path == "-" {
            TokenSource::Tokens(read_stdin_lines())
        } else {
            TokenSource::File(PathBuf::from(path))
        }
    } else {
        let tokens = matches
            .get_many::<String>("targets")
            .map(|vals| vals.cloned().collect())
            .unwrap_or_default();
        TokenSource::Tokens(tokens)
    };

    ensure_fd_headroom(config.threads);

    let mode = config.realtest.mode;
    let engine = ScanEngine::new(config.clone());
    let stream = match engine.start(&source) {
        Ok(stream) => stream,
        Err(ScanError::NoTargets) => {
            eprintln!("{}", "WARN: No targets found.".bright_yellow());
            return Ok(1);
        }
        Err(e) => return Err(e.into()),
    };

    if !quiet {
        println!(
            "{} domain={} workers={}/{} timeout={}ms random={} auto={}",
            "[~]".bright_blue(),
            config.domain.bright_cyan(),
            stream.workers.to_string().bright_cyan(),
            config.threads,
            config.timeout_ms,
            config.random_per_cidr,
            mode
        );
    }

    let cancel = stream.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}", "Interrupted.".bright_red());
            cancel.cancel();
        }
    });

    let (events, event_rx) = events::channel();
    let renderer = tokio::spawn(render_events(event_rx, quiet, RenderMode::Scan));

    let counters = Orchestrator::new(config, events, outputs).run(stream).await?;
    let _ = renderer.await;

    print_summary(&counters, true, mode != RealTestMode::Off);
    Ok(0)
}

async fn cmd_realtest(matches: &clap::ArgMatches) -> anyhow::Result<i32> {
    let domain = matches.get_one::<String>("domain").unwrap().trim().to_string();
    if domain.is_empty() {
        eprintln!("{}", "ERROR: --domain is required".bright_red());
        return Ok(2);
    }

    let ips = match matches.get_one::<String>("file") {
        Some(path) => file_input::read_ip_file(Path::new(path))?,
        None => {
            if std::io::stdin().is_terminal() {
                Vec::new()
            } else {
                file_input::read_ip_lines(std::io::stdin().lock())
            }
        }
    };
    if ips.is_empty() {
        eprintln!("{}", "ERROR: no IPs provided for realtest".bright_red());
        return Ok(2);
    }

    let mut rt = RealTestConfig {
        ready_ms: *matches.get_one::<u64>("ready-timeout-ms").unwrap(),
        timeout_s: *matches.get_one::<f64>("timeout-s").unwrap(),
        ..RealTestConfig::default()
    };
    if let Some(path) = matches.get_one::<String>("slipstream-path") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            rt.binary_path = trimmed.to_string();
        }
    }

    let quiet = matches.get_flag("quiet");
    if !quiet {
        print_banner();
        println!(
            "{} RealTest only | domain={} | timeout={}s | ready={}ms",
            "[~]".bright_blue(),
            domain.bright_cyan(),
            rt.timeout_s,
            rt.ready_ms
        );
    }

    let format: RealTestFormat = matches
        .get_one::<String>("realtest-ok-format")
        .unwrap()
        .parse()?;
    let mut outputs = OutputWriters::new(
        None,
        matches.get_one::<PathBuf>("realtest-ok-out").map(|p| p.as_path()),
        format,
    )?;

    let (events, event_rx) = events::channel();
    let renderer = tokio::spawn(render_events(event_rx, quiet, RenderMode::RealTest));

    let counters = realtest::run_sequential(&ips, &domain, &rt, &events, &mut outputs).await?;
    drop(events);
    let _ = renderer.await;

    print_summary(&counters, false, true);
    Ok(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let matches = Command::new("slipscan")
        .version("0.3.1")
        .about("Slipscan: DNS-tunnel resolver scanner with SOCKS-verified real connectivity testing")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("scan")
                .about("Probe targets over UDP/53 for slipstream-capable resolvers")
                .arg(
                    Arg::new("domain")
                        .long("domain")
                        .value_name("DOMAIN")
                        .help("Tunnel domain to query")
                        .required(true),
                )
                .arg(
                    Arg::new("file")
                        .short('f')
                        .long("file")
                        .value_name("PATH")
                        .help("Target file with IPs/CIDRs, '-' reads stdin"),
                )
                .arg(
                    Arg::new("targets")
                        .long("targets")
                        .value_name("TOKEN")
                        .num_args(1..)
                        .help("Inline target tokens (IPs or CIDRs)"),
                )
                .group(
                    ArgGroup::new("source")
                        .args(["file", "targets"])
                        .required(true)
                        .multiple(true),
                )
                .arg(
                    Arg::new("timeout-ms")
                        .long("timeout-ms")
                        .value_name("MS")
                        .default_value("800")
                        .value_parser(clap::value_parser!(u64))
                        .help("Per-probe reply timeout"),
                )
                .arg(
                    Arg::new("threads")
                        .long("threads")
                        .value_name("N")
                        .default_value("200")
                        .value_parser(clap::value_parser!(usize))
                        .help("Scan worker count"),
                )
                .arg(
                    Arg::new("random-per-cidr")
                        .long("random-per-cidr")
                        .value_name("K")
                        .default_value("0")
                        .value_parser(clap::value_parser!(u32))
                        .help("Sample K random addresses per CIDR block (0 scans whole blocks)"),
                )
                .arg(
                    Arg::new("scan-ok-out")
                        .long("scan-ok-out")
                        .value_name("PATH")
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("Write scan-OK IPs to file, one per line"),
                )
                .arg(
                    Arg::new("realtest-ok-out")
                        .long("realtest-ok-out")
                        .value_name("PATH")
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("Write real-test passes to file"),
                )
                .arg(
                    Arg::new("realtest-ok-format")
                        .long("realtest-ok-format")
                        .value_name("FMT")
                        .default_value("ip")
                        .value_parser(["ip", "ipms"])
                        .help("Line format for --realtest-ok-out: ip or 'ip ms'"),
                )
                .arg(
                    Arg::new("auto-realtest")
                        .long("auto-realtest")
                        .value_name("MODE")
                        .default_value("off")
                        .value_parser(["off", "end", "live"])
                        .help("Real-test scan hits: never, after the scan, or concurrently"),
                )
                .arg(
                    Arg::new("realtest-ms-max")
                        .long("realtest-ms-max")
                        .value_name("MS")
                        .value_parser(clap::value_parser!(i64))
                        .help("Only real-test hits whose probe latency stayed below this"),
                )
                .arg(
                    Arg::new("realtest-timeout-s")
                        .long("realtest-timeout-s")
                        .value_name("SECS")
                        .default_value("5.0")
                        .value_parser(clap::value_parser!(f64))
                        .help("Per-attempt real-test timeout"),
                )
                .arg(
                    Arg::new("realtest-ready-ms")
                        .long("realtest-ready-ms")
                        .value_name("MS")
                        .default_value("2000")
                        .value_parser(clap::value_parser!(u64))
                        .help("How long to wait for the spawned client to come up"),
                )
                .arg(
                    Arg::new("realtest-parallel")
                        .long("realtest-parallel")
                        .value_name("N")
                        .default_value("1")
                        .value_parser(clap::value_parser!(usize))
                        .help("Live-mode real-test workers"),
                )
                .arg(
                    Arg::new("realtest-slipstream-path")
                        .long("realtest-slipstream-path")
                        .value_name("PATH")
                        .help("Slipstream client binary to launch per real test"),
                )
                .arg(
                    Arg::new("live-drain-timeout-s")
                        .long("live-drain-timeout-s")
                        .value_name("SECS")
                        .default_value("30.0")
                        .value_parser(clap::value_parser!(f64))
                        .help("After a live scan ends, wait up to this long for outstanding real tests"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_name("PATH")
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("TOML config file (flags take precedence)"),
                )
                .arg(
                    Arg::new("quiet")
                        .short('q')
                        .long("quiet")
                        .action(ArgAction::SetTrue)
                        .help("Suppress banner and per-result stdout lines"),
                ),
        )
        .subcommand(
            Command::new("realtest")
                .about("Real-test a list of resolvers from a file or stdin, one at a time")
                .arg(
                    Arg::new("domain")
                        .long("domain")
                        .value_name("DOMAIN")
                        .help("Tunnel domain the client should use")
                        .required(true),
                )
                .arg(
                    Arg::new("file")
                        .short('f')
                        .long("file")
                        .value_name("PATH")
                        .help("IP list file (default: stdin)"),
                )
                .arg(
                    Arg::new("slipstream-path")
                        .long("slipstream-path")
                        .value_name("PATH")
                        .help("Slipstream client binary to launch per real test"),
                )
                .arg(
                    Arg::new("ready-timeout-ms")
                        .long("ready-timeout-ms")
                        .value_name("MS")
                        .default_value("2000")
                        .value_parser(clap::value_parser!(u64))
                        .help("How long to wait for the spawned client to come up"),
                )
                .arg(
                    Arg::new("timeout-s")
                        .long("timeout-s")
                        .value_name("SECS")
                        .default_value("5.0")
                        .value_parser(clap::value_parser!(f64))
                        .help("Per-attempt real-test timeout"),
                )
                .arg(
                    Arg::new("realtest-ok-out")
                        .long("realtest-ok-out")
                        .value_name("PATH")
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("Write real-test passes to file"),
                )
                .arg(
                    Arg::new("realtest-ok-format")
                        .long("realtest-ok-format")
                        .value_name("FMT")
                        .default_value("ip")
                        .value_parser(["ip", "ipms"])
                        .help("Line format for --realtest-ok-out: ip or 'ip ms'"),
                )
                .arg(
                    Arg::new("quiet")
                        .short('q')
                        .long("quiet")
                        .action(ArgAction::SetTrue)
                        .help("Suppress banner and per-result stdout lines"),
                ),
        )
        .get_matches();

    let exit = match matches.subcommand() {
        Some(("scan", sub)) => cmd_scan(sub).await?,
        Some(("realtest", sub)) => cmd_realtest(sub).await?,
        _ => unreachable!(),
    };
    if exit != 0 {
        process::exit(exit);
    }
    Ok(())
}
