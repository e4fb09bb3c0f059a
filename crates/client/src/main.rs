use arrow::util::pretty::pretty_format_batches;
use tracing_subscriber::EnvFilter;
use tundra_client::{JobRunner, JobSpec};
use tundra_common::EngineConfig;
use tundra_storage::Catalog;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty()
        || args
            .first()
            .map(|a| a == "--help" || a == "-h")
            .unwrap_or(false)
    {
        print_usage();
        return Ok(());
    }
    if args.first().map(|a| a.as_str()) != Some("run") {
        print_usage();
        return Err(format!("unknown command: {}", args[0]).into());
    }

    let opts = parse_run_opts(&args)?;
    let config = match &opts.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    }
    .with_env_overrides();
    let mut runner = JobRunner::new(config)?;
    if let Some(catalog_path) = &opts.catalog {
        runner = runner.with_catalog(Catalog::load_from_json(catalog_path)?);
    }

    let job = JobSpec::from_json_file(&opts.job)?;
    let output = runner.run(&job)?;
    if output.num_rows() == 0 {
        println!("OK: 0 rows");
    } else {
        let rendered = pretty_format_batches(&output.batches)?;
        println!("{rendered}");
    }
    if opts.metrics {
        print!("{}", runner.metrics().render_prometheus());
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct RunOpts {
    job: String,
    catalog: Option<String>,
    config: Option<String>,
    metrics: bool,
}

fn parse_run_opts(args: &[String]) -> Result<RunOpts, Box<dyn std::error::Error>> {
    let mut job = None;
    let mut catalog = None;
    let mut config = None;
    let mut metrics = false;

    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--job" => {
                i += 1;
                job = Some(args.get(i).cloned().ok_or("missing value for --job")?);
            }
            "--catalog" => {
                i += 1;
                catalog = Some(
                    args.get(i)
                        .cloned()
                        .ok_or("missing value for --catalog")?,
                );
            }
            "--config" => {
                i += 1;
                config = Some(args.get(i).cloned().ok_or("missing value for --config")?);
            }
            "--metrics" => {
                metrics = true;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
        i += 1;
    }

    Ok(RunOpts {
        job: job.ok_or("--job is required")?,
        catalog,
        config,
        metrics,
    })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  tundra run --job <job.json> [--catalog <catalog.json>]");
    eprintln!("             [--config <config.json>] [--metrics]");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  TUNDRA_BATCH_SIZE_ROWS, TUNDRA_MEM_BUDGET_BYTES, TUNDRA_SCANNER_THREADS,");
    eprintln!("  TUNDRA_MAX_BUFFERED_BATCHES override the config file");
    eprintln!("  RUST_LOG sets the log filter (default: info)");
}
