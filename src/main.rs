use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Error};
use clap::{Parser, ValueEnum};
use servingbench::bench::{DEFAULT_ITERATIONS, DEFAULT_OUTPUT};
use servingbench::request::{DEFAULT_MODEL, DEFAULT_SIGNATURE};
use servingbench::{
    build_feature_request, report, report_schema, Bench, BenchConfig, Client, ClientConfig,
    ModelRef, OutputFormat, RetryPolicy, Schema,
};
use termcolor::{ColorChoice, StandardStream};
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

const DEFAULT_PORT: u16 = 8500;

#[derive(Debug, Parser)]
#[command(name = "servingbench")]
#[command(about = "latency benchmark for TensorFlow Serving predict calls")]
#[command(version)]
struct Cli {
    /// Prediction server host
    #[arg(long, env = "SERVINGBENCH_HOST", default_value = "127.0.0.1")]
    host: String,
    /// Prediction server gRPC port
    #[arg(long, short, env = "SERVINGBENCH_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Feature schema, one column name per line
    #[arg(long, env = "SERVINGBENCH_SCHEMA", default_value = "schema.conf")]
    schema: PathBuf,
    /// Served model name
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    /// Signature of the model to call
    #[arg(long, default_value = DEFAULT_SIGNATURE)]
    signature: String,
    /// Pin a model version instead of the latest
    #[arg(long)]
    model_version: Option<i64>,
    /// Output tensor whose scores are printed
    #[arg(long, default_value = DEFAULT_OUTPUT)]
    output: String,
    /// Number of predict calls
    #[arg(long, short = 'n', default_value_t = DEFAULT_ITERATIONS)]
    iterations: u64,
    /// Example value fed to every feature column, one per batch row
    #[arg(long = "value", default_values = ["0", "1"])]
    values: Vec<String>,
    /// Per-call deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Retries for unavailable or timed out calls before giving up
    #[arg(long, default_value_t = 0)]
    retries: u32,
    /// Output in json
    #[arg(
        long,
        short,
        default_value_t = false,
        default_missing_value = "true",
        num_args = 0
    )]
    json: bool,
    /// Only print the summary
    #[arg(long, short, default_value_t = false)]
    quiet: bool,
    #[arg(
        long,
        value_name = "WHEN",
        default_value_t = ColorWhen::Auto,
        value_enum,
        num_args = 0..=1,
        default_missing_value = "always",
    )]
    color: ColorWhen,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, PartialOrd)]
enum ColorWhen {
    Always,
    Auto,
    Never,
}

impl ColorWhen {
    fn choice(self) -> ColorChoice {
        match self {
            ColorWhen::Always => ColorChoice::Always,
            ColorWhen::Auto if atty::is(atty::Stream::Stdout) => ColorChoice::Auto,
            ColorWhen::Auto | ColorWhen::Never => ColorChoice::Never,
        }
    }
}

impl fmt::Display for ColorWhen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_possible_value()
            .expect("no values are skipped")
            .get_name()
            .fmt(f)
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let schema = Schema::load(&cli.schema)?;
    report_schema(&schema, format, &mut std::io::stdout().lock())?;

    let model = ModelRef {
        name: cli.model,
        signature_name: cli.signature,
        version: cli.model_version,
    };
    let labels = vec![0.0_f32; cli.values.len()];
    let request = build_feature_request(model, &schema, &cli.values, &labels)
        .context("failed to build predict request")?;

    let config = ClientConfig {
        request_timeout: cli.timeout_ms.map(Duration::from_millis),
        ..ClientConfig::new(&cli.host, cli.port)
    };
    let client = Client::connect(&config).await?;

    let bench_config = BenchConfig {
        iterations: cli.iterations,
        output_name: cli.output,
        retry: RetryPolicy::with_retries(cli.retries),
        format,
        quiet: cli.quiet,
    };
    let mut bench = Bench::new(client, request.to_proto(), bench_config);

    let stdout = StandardStream::stdout(cli.color.choice());
    let mut stdout = stdout.lock();
    let shutdown = async {
        // Without a signal handler the run can only end by completing.
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let summary = bench.run_until(&mut stdout, shutdown).await?;
    info!(iterations = summary.iterations, "benchmark finished");
    report(&summary, format, &mut stdout)?;

    Ok(())
}
