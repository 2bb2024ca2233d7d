use std::future::Future;
use std::io;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use termcolor::{ColorSpec, WriteColor};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::client::Predictor;
use crate::proto::{PredictRequest, PredictResponse};
use crate::retry::RetryPolicy;
use crate::schema::Schema;
use crate::tensor::Tensor;
use crate::BenchError;

pub const DEFAULT_ITERATIONS: u64 = 100_000;
pub const DEFAULT_OUTPUT: &str = "output1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub iterations: u64,
    /// Response tensor whose float values are reported.
    pub output_name: String,
    pub retry: RetryPolicy,
    pub format: OutputFormat,
    /// Skip the per-iteration lines.
    pub quiet: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            output_name: DEFAULT_OUTPUT.to_string(),
            retry: RetryPolicy::default(),
            format: OutputFormat::Text,
            quiet: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationResult {
    pub iteration: u64,
    pub scores: Vec<f32>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub retries: u32,
}

impl IterationResult {
    fn print_for_display<P: io::Write + WriteColor>(&self, printer: &mut P) -> io::Result<()> {
        printer.reset()?;
        printer.set_color(ColorSpec::new().set_bold(true))?;
        write!(printer, "scores1:")?;
        printer.reset()?;
        write!(printer, " {:?} ", self.scores)?;
        printer.set_color(ColorSpec::new().set_bold(true))?;
        write!(printer, "time:")?;
        printer.reset()?;
        writeln!(printer, " {}", self.elapsed.as_millis())?;
        Ok(())
    }
}

fn serialize_millis<S: serde::Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64() * 1e3)
}

/// Latency statistics over all completed iterations, in milliseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub started_at: String,
    pub iterations: u64,
    pub retries: u64,
    pub interrupted: bool,
    pub total_secs: f64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl Summary {
    fn from_latencies(
        started_at: OffsetDateTime,
        total: Duration,
        latencies: &mut [Duration],
        retries: u64,
        interrupted: bool,
    ) -> Self {
        let started_at = started_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| started_at.to_string());
        let mut summary = Summary {
            started_at,
            iterations: latencies.len() as u64,
            retries,
            interrupted,
            total_secs: total.as_secs_f64(),
            ..Default::default()
        };
        if latencies.is_empty() {
            return summary;
        }

        latencies.sort_unstable();
        let ms = |d: Duration| d.as_secs_f64() * 1e3;
        let sum: Duration = latencies.iter().sum();
        summary.min_ms = ms(latencies[0]);
        summary.max_ms = ms(latencies[latencies.len() - 1]);
        summary.mean_ms = ms(sum) / latencies.len() as f64;
        summary.p50_ms = ms(percentile(latencies, 50.0));
        summary.p99_ms = ms(percentile(latencies, 99.0));
        summary
    }

    pub fn print_for_display<P: io::Write + WriteColor>(&self, printer: &mut P) -> io::Result<()> {
        printer.reset()?;
        writeln!(printer)?;
        printer.set_color(ColorSpec::new().set_bold(true))?;
        write!(printer, "{} calls", self.iterations)?;
        printer.reset()?;
        write!(printer, " in {:.2} sec", self.total_secs)?;
        if self.retries > 0 {
            write!(printer, " ({} retries)", self.retries)?;
        }
        if self.interrupted {
            write!(printer, " [interrupted]")?;
        }
        writeln!(printer)?;

        let rows = [
            ("min", self.min_ms),
            ("mean", self.mean_ms),
            ("p50", self.p50_ms),
            ("p99", self.p99_ms),
            ("max", self.max_ms),
        ];
        for (label, value) in rows {
            write!(printer, "{label:>5}{:^3}{value:.3}", "|")?;
            printer.set_color(ColorSpec::new().set_bold(true))?;
            writeln!(printer, " ms")?;
            printer.reset()?;
        }
        printer.flush()
    }
}

/// Nearest-rank percentile of an ascending, non-empty slice.
fn percentile(sorted: &[Duration], pct: f64) -> Duration {
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Writes the summary in the chosen format.
pub fn report<P: io::Write + WriteColor>(
    summary: &Summary,
    format: OutputFormat,
    printer: &mut P,
) -> Result<(), BenchError> {
    match format {
        OutputFormat::Text => summary.print_for_display(printer)?,
        OutputFormat::Json => {
            serde_json::to_writer(&mut *printer, summary)?;
            writeln!(printer)?;
            printer.flush()?;
        }
    }
    Ok(())
}

/// Writes the `schema:` start-up line, or a `{"schema":[..]}` object in JSON
/// mode so every stdout line stays valid JSON.
pub fn report_schema<P: io::Write>(
    schema: &Schema,
    format: OutputFormat,
    printer: &mut P,
) -> Result<(), BenchError> {
    match format {
        OutputFormat::Text => writeln!(printer, "schema: {schema}")?,
        OutputFormat::Json => {
            serde_json::to_writer(&mut *printer, &serde_json::json!({ "schema": schema.columns() }))?;
            writeln!(printer)?;
        }
    }
    printer.flush()?;
    Ok(())
}

/// Sends the same prebuilt request over and over, one call in flight.
pub struct Bench<P> {
    predictor: P,
    request: PredictRequest,
    config: BenchConfig,
    rng: StdRng,
}

impl<P: Predictor + Send> Bench<P> {
    pub fn new(predictor: P, request: PredictRequest, config: BenchConfig) -> Self {
        Self {
            predictor,
            request,
            config,
            rng: StdRng::from_entropy(),
        }
    }

    pub async fn run<W: io::Write + WriteColor>(&mut self, out: &mut W) -> Result<Summary, BenchError> {
        self.run_until(out, std::future::pending::<()>()).await
    }

    /// Runs until the iteration count is reached, a call fails for good, or
    /// `shutdown` resolves. An in-flight call is abandoned on shutdown.
    pub async fn run_until<W, F>(&mut self, out: &mut W, shutdown: F) -> Result<Summary, BenchError>
    where
        W: io::Write + WriteColor,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(iterations = self.config.iterations, "starting benchmark");

        let started_at = OffsetDateTime::now_utc();
        let run_start = Instant::now();
        let mut latencies = Vec::with_capacity(self.config.iterations.min(1 << 20) as usize);
        let mut total_retries = 0_u64;
        let mut interrupted = false;

        for iteration in 0..self.config.iterations {
            let result = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(iteration, "benchmark interrupted");
                    interrupted = true;
                    break;
                }
                result = self.iterate(iteration) => result,
            };

            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    error!(iteration, "benchmark aborted: {e}");
                    return Err(e);
                }
            };
            latencies.push(result.elapsed);
            total_retries += u64::from(result.retries);
            self.print_iteration(&result, out)?;
        }

        debug!("done");
        Ok(Summary::from_latencies(
            started_at,
            run_start.elapsed(),
            &mut latencies,
            total_retries,
            interrupted,
        ))
    }

    async fn iterate(&mut self, iteration: u64) -> Result<IterationResult, BenchError> {
        let (response, elapsed, retries) = self.call_with_retry().await?;
        let scores = extract_scores(response, &self.config.output_name)?;
        Ok(IterationResult {
            iteration,
            scores,
            elapsed,
            retries,
        })
    }

    /// Times the attempt that succeeds; failed attempts only count as retries.
    async fn call_with_retry(&mut self) -> Result<(PredictResponse, Duration, u32), BenchError> {
        let mut retries = 0;
        loop {
            let start = Instant::now();
            match self.predictor.predict(&self.request).await {
                Ok(response) => return Ok((response, start.elapsed(), retries)),
                Err(status) if self.config.retry.should_retry(&status, retries) => {
                    let wait = self.config.retry.backoff(retries, &mut self.rng);
                    warn!(
                        code = ?status.code(),
                        retry = retries + 1,
                        wait_ms = wait.as_millis() as u64,
                        "transient predict failure: {}",
                        status.message()
                    );
                    retries += 1;
                    tokio::time::sleep(wait).await;
                }
                Err(status) if retries > 0 => {
                    return Err(BenchError::RetriesExhausted {
                        attempts: retries + 1,
                        status,
                    })
                }
                Err(status) => return Err(BenchError::Rpc(status)),
            }
        }
    }

    fn print_iteration<W: io::Write + WriteColor>(
        &self,
        result: &IterationResult,
        out: &mut W,
    ) -> Result<(), BenchError> {
        if self.config.quiet {
            return Ok(());
        }
        match self.config.format {
            OutputFormat::Text => result.print_for_display(out)?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut *out, result)?;
                writeln!(out)?;
            }
        }
        Ok(())
    }
}

/// Pulls the float values of output `name` out of a response.
pub fn extract_scores(mut response: PredictResponse, name: &str) -> Result<Vec<f32>, BenchError> {
    let proto = response
        .outputs
        .remove(name)
        .ok_or_else(|| BenchError::MissingOutput(name.to_string()))?;
    let tensor = Tensor::try_from(proto)?;
    Ok(tensor.as_floats()?.to_vec())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto::TensorProto;
    use crate::tensor::{encode_float_vector, encode_string_vector};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use termcolor::Buffer;
    use tonic::Status;

    /// Replays scripted outcomes; once drained, every call succeeds.
    struct ScriptedPredictor {
        script: VecDeque<Result<PredictResponse, Status>>,
        calls: usize,
    }

    impl ScriptedPredictor {
        fn new(script: Vec<Result<PredictResponse, Status>>) -> Self {
            Self {
                script: script.into(),
                calls: 0,
            }
        }
    }

    fn scores_response(scores: &[f32]) -> PredictResponse {
        let mut response = PredictResponse::default();
        response
            .outputs
            .insert(DEFAULT_OUTPUT.to_string(), TensorProto::from(&encode_float_vector(scores)));
        response
    }

    #[async_trait]
    impl Predictor for ScriptedPredictor {
        async fn predict(&mut self, _request: &PredictRequest) -> Result<PredictResponse, Status> {
            self.calls += 1;
            self.script
                .pop_front()
                .unwrap_or_else(|| Ok(scores_response(&[0.5, 0.25])))
        }
    }

    fn config(iterations: u64, retries: u32) -> BenchConfig {
        BenchConfig {
            iterations,
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                ..RetryPolicy::with_retries(retries)
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_prints_every_iteration() {
        let predictor = ScriptedPredictor::new(vec![]);
        let mut bench = Bench::new(predictor, PredictRequest::default(), config(3, 0));
        let mut out = Buffer::no_color();

        let summary = bench.run(&mut out).await.unwrap();
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.retries, 0);
        assert!(!summary.interrupted);
        assert!(summary.min_ms <= summary.p50_ms && summary.p50_ms <= summary.max_ms);

        let text = String::from_utf8(out.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| l.starts_with("scores1: [0.5, 0.25] time: ")));
    }

    #[tokio::test]
    async fn test_json_lines() {
        let predictor = ScriptedPredictor::new(vec![]);
        let config = BenchConfig {
            format: OutputFormat::Json,
            ..config(2, 0)
        };
        let mut bench = Bench::new(predictor, PredictRequest::default(), config);
        let mut out = Buffer::no_color();
        bench.run(&mut out).await.unwrap();

        let text = String::from_utf8(out.into_inner()).unwrap();
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["iteration"], 0);
        assert_eq!(first["scores"], serde_json::json!([0.5, 0.25]));
        assert!(first["elapsed_ms"].is_f64());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let predictor = ScriptedPredictor::new(vec![
            Err(Status::unavailable("restarting")),
            Err(Status::deadline_exceeded("slow")),
        ]);
        let mut bench = Bench::new(predictor, PredictRequest::default(), config(2, 3));
        let mut out = Buffer::no_color();

        let summary = bench.run(&mut out).await.unwrap();
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.retries, 2);
        assert_eq!(bench.predictor.calls, 4);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let predictor = ScriptedPredictor::new(vec![
            Err(Status::unavailable("down")),
            Err(Status::unavailable("down")),
            Err(Status::unavailable("down")),
        ]);
        let mut bench = Bench::new(predictor, PredictRequest::default(), config(5, 2));
        let mut out = Buffer::no_color();

        let err = bench.run(&mut out).await.unwrap_err();
        assert!(matches!(err, BenchError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_permanent_error_aborts() {
        let predictor = ScriptedPredictor::new(vec![
            Ok(scores_response(&[1.0])),
            Err(Status::invalid_argument("unknown signature")),
        ]);
        let mut bench = Bench::new(predictor, PredictRequest::default(), config(5, 3));
        let mut out = Buffer::no_color();

        let err = bench.run(&mut out).await.unwrap_err();
        match err {
            BenchError::Rpc(status) => assert_eq!(status.code(), tonic::Code::InvalidArgument),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(bench.predictor.calls, 2);
    }

    #[tokio::test]
    async fn test_missing_output() {
        let predictor = ScriptedPredictor::new(vec![Ok(PredictResponse::default())]);
        let mut bench = Bench::new(predictor, PredictRequest::default(), config(1, 0));
        let mut out = Buffer::no_color();

        let err = bench.run(&mut out).await.unwrap_err();
        assert!(matches!(err, BenchError::MissingOutput(name) if name == DEFAULT_OUTPUT));
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let predictor = ScriptedPredictor::new(vec![]);
        let mut bench = Bench::new(predictor, PredictRequest::default(), config(1_000, 0));
        let mut out = Buffer::no_color();

        let summary = bench.run_until(&mut out, async {}).await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.iterations, 0);
        assert_eq!(summary.mean_ms, 0.0);
    }

    #[test]
    fn test_extract_scores_requires_floats() {
        let mut response = PredictResponse::default();
        response.outputs.insert(
            DEFAULT_OUTPUT.to_string(),
            TensorProto::from(&encode_string_vector(&["a"])),
        );
        assert!(matches!(
            extract_scores(response, DEFAULT_OUTPUT),
            Err(BenchError::Encode(_))
        ));
    }

    #[test]
    fn test_percentile() {
        let sorted: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        assert_eq!(percentile(&sorted, 50.0), Duration::from_millis(50));
        assert_eq!(percentile(&sorted, 99.0), Duration::from_millis(99));
        assert_eq!(percentile(&sorted[..1], 99.0), Duration::from_millis(1));
    }

    #[test]
    fn test_summary_text() {
        let mut latencies = vec![Duration::from_millis(4), Duration::from_millis(2)];
        let summary = Summary::from_latencies(
            OffsetDateTime::UNIX_EPOCH,
            Duration::from_millis(10),
            &mut latencies,
            1,
            false,
        );
        assert_eq!(summary.started_at, "1970-01-01T00:00:00Z");
        assert_eq!(summary.mean_ms, 3.0);

        let mut out = Buffer::no_color();
        report(&summary, OutputFormat::Text, &mut out).unwrap();
        let text = String::from_utf8(out.into_inner()).unwrap();
        assert!(text.contains("2 calls in 0.01 sec (1 retries)"));
        assert!(text.contains("  max | 4.000 ms"));
    }

    #[test]
    fn test_schema_line() {
        let schema = Schema::from_lines(["user_id int", "item_id int"]);

        let mut out = Vec::new();
        report_schema(&schema, OutputFormat::Text, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "schema: [user_id, item_id]\n");

        let mut out = Vec::new();
        report_schema(&schema, OutputFormat::Json, &mut out).unwrap();
        let line: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(line, serde_json::json!({ "schema": ["user_id", "item_id"] }));
    }
}
