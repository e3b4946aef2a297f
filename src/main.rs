use std::io::{self, BufRead, Write};

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay_locator::api::{CsvFormatter, JsonFormatter, OutputFormat, PackageRecord, TextFormatter};
use relay_locator::processing::{is_balanced, parse_package_line, parse_packages, parse_topology};
use relay_locator::{Locator, LocatorConfig, Package, TopologyAnalyzer};

const USAGE: &str = "\
Usage: relay-locator <graph.json | --example> [options]

  graph.json                 JSON file with the edges of the environment graph
      --example              Use the built-in example graph (relays 1001..1004)
  -c, --checkpoints          Enable checkpointing on sensor encounters
      --no-checkpoints       Disable checkpointing
  -r, --rectification        Enable graph-based path rectification
      --no-rectification     Disable path rectification
  -f, --file <packages>      Read packages from a file instead of stdin
      --config <config>      JSON file with locator settings
      --format <json|text|csv>
                             Output format (default json)
      --pretty               Pretty-print JSON output
  -h, --help                 Print this message

Log verbosity follows RUST_LOG (default relay_locator=info).";

#[derive(Debug, Default)]
struct CliOptions {
    graph: Option<String>,
    example: bool,
    checkpoints: Option<bool>,
    rectification: Option<bool>,
    file: Option<String>,
    config: Option<String>,
    format: OutputFormat,
    pretty: bool,
    help: bool,
}

fn parse_args<I: Iterator<Item = String>>(mut args: I) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().ok_or_else(|| format!("{} requires a value", name));
        match arg.as_str() {
            "--example" => options.example = true,
            "-c" | "--checkpoints" => options.checkpoints = Some(true),
            "--no-checkpoints" => options.checkpoints = Some(false),
            "-r" | "--rectification" => options.rectification = Some(true),
            "--no-rectification" => options.rectification = Some(false),
            "-f" | "--file" => options.file = Some(value("--file")?),
            "--config" => options.config = Some(value("--config")?),
            "--format" => options.format = value("--format")?.parse()?,
            "--pretty" => options.pretty = true,
            "-h" | "--help" => options.help = true,
            flag if flag.starts_with('-') => return Err(format!("unknown option '{}'", flag)),
            path => {
                if options.graph.replace(path.to_string()).is_some() {
                    return Err("only one environment graph may be given".to_string());
                }
            }
        }
    }

    if !options.help && options.graph.is_none() && !options.example {
        return Err("an environment graph or --example is required".to_string());
    }
    Ok(options)
}

/// Writes resolved packages to stdout in the selected format
struct Emitter {
    format: OutputFormat,
    json: JsonFormatter,
    text: TextFormatter,
    csv: CsvFormatter,
    header_written: bool,
}

impl Emitter {
    fn new(format: OutputFormat, pretty: bool) -> Self {
        Self {
            format,
            json: JsonFormatter { pretty },
            text: TextFormatter::compact(),
            csv: CsvFormatter::new(),
            header_written: false,
        }
    }

    fn emit(&mut self, out: &mut impl Write, packages: &[Package]) -> Result<(), Box<dyn std::error::Error>> {
        for package in packages {
            let record = PackageRecord::from(package);
            match self.format {
                OutputFormat::Json => writeln!(out, "{}", self.json.format_json(&record)?)?,
                OutputFormat::Text => writeln!(out, "{}", self.text.format_text(&record))?,
                OutputFormat::Csv => {
                    if self.csv.include_header && !self.header_written {
                        writeln!(out, "{}", self.csv.header())?;
                        self.header_written = true;
                    }
                    writeln!(out, "{}", self.csv.format_csv(&record))?;
                }
            }
        }
        out.flush()?;
        Ok(())
    }
}

fn feed(locator: &mut Locator, package: Package) -> Vec<Package> {
    let (sensor, timestamp) = (package.sensor_id, package.timestamp);
    match locator.feed(package) {
        Ok(resolved) => resolved,
        Err(e) if matches!(e, relay_locator::LocatorError::NotASensor(_)) => {
            warn!(sensor, timestamp, error = %e, "ignoring package");
            Vec::new()
        }
        Err(e) => {
            error!(sensor, timestamp, error = %e, "localization failed");
            Vec::new()
        }
    }
}

fn run_stream(locator: &mut Locator, emitter: &mut Emitter) -> Result<(), Box<dyn std::error::Error>> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut pending = String::new();

    for line in stdin.lock().lines() {
        let line = line?;
        if pending.is_empty() {
            if line.trim().is_empty() {
                continue;
            }
            if !line.trim_start().starts_with('{') {
                warn!(line = %line, "expected a JSON object");
                continue;
            }
        }
        pending.push_str(&line);
        pending.push('\n');
        if !is_balanced(&pending) {
            continue;
        }

        match parse_package_line(&pending) {
            Ok(package) => {
                let resolved = feed(locator, package);
                emitter.emit(&mut out, &resolved)?;
            }
            Err(e) => warn!(error = %e, "ignoring malformed package"),
        }
        pending.clear();
    }

    if !pending.trim().is_empty() {
        warn!("input ended inside an unterminated JSON object");
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "relay_locator=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let options = match parse_args(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{}\n\n{}", message, USAGE);
            std::process::exit(2);
        }
    };
    if options.help {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut config = match &options.config {
        Some(path) => LocatorConfig::from_file(path)?,
        None => LocatorConfig::default(),
    };
    if let Some(enabled) = options.checkpoints {
        config = config.with_checkpoints(enabled);
    }
    if let Some(enabled) = options.rectification {
        config = config.with_path_rectification(enabled);
    }

    let topology = match &options.graph {
        Some(path) if !options.example => parse_topology(&std::fs::read_to_string(path)?)?,
        _ => TopologyAnalyzer::sample(),
    };
    let mut locator = Locator::new(topology, config);
    info!(
        relays = locator.topology().relays().count(),
        edges = locator.topology().edge_count(),
        checkpoints = locator.config().checkpoints,
        rectification = locator.config().path_rectification,
        "locator ready"
    );
    let mut emitter = Emitter::new(options.format, options.pretty);

    match &options.file {
        Some(path) => {
            let packages = parse_packages(&std::fs::read_to_string(path)?)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for package in packages {
                let resolved = feed(&mut locator, package);
                emitter.emit(&mut out, &resolved)?;
            }
        }
        None => run_stream(&mut locator, &mut emitter)?,
    }

    let unresolved: usize = locator
        .sensors()
        .map(|s| s.epochs().iter().map(|e| e.len()).sum::<usize>())
        .sum();
    if unresolved > 0 {
        info!(unresolved, "packages still awaiting resolution");
    }
    Ok(())
}
