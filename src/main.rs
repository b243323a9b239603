use clap::Parser;
use colored::*;
use std::time::Duration;
use vantage::backend::{CacheProbe, HttpBackend};
use vantage::config::{Args, ClientConfig, Command};
use vantage::reducer::{CacheStatus, LoggedEvent, RunStatus, StreamState};
use vantage::result_fetcher::ResultFetcher;
use vantage::router::{DeliveryMode, DeliveryRouter, RouterPhase};
use vantage::sim::SimState;
use vantage::transport::SseTransport;
use vantage::*;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let guards = match logging::init_tracing(args.log_dir.as_deref()) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };
    logging::setup_panic_hook();

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("{} {}", "error:".red().bold(), e);
            1
        }
    };
    drop(guards);
    std::process::exit(code);
}

/// Runs one subcommand. Returns the process exit code.
async fn run(args: Args) -> Result<i32> {
    let config = ClientConfig::from_args(&args)?;
    match args.command {
        Command::Watch {
            competitors,
            focus_area,
            live,
            research,
            analysis_id,
            fetch,
            export_log,
        } => {
            let request = AnalysisRequest::new(competitors, &focus_area)?.with_research(research);
            let analysis_id = match analysis_id {
                Some(id) => AnalysisId::from(id),
                None => request.new_analysis_id(),
            };
            let mode = if live { DeliveryMode::Live } else { DeliveryMode::CacheAware };
            let state = watch(&config, request, analysis_id, mode).await?;

            if let Some(path) = export_log {
                event_log::export(&path, &state.event_log)?;
                println!("{} {}", "event log written to".dimmed(), path.display());
            }
            if fetch && state.run_status == RunStatus::Completed {
                let backend = HttpBackend::new(config.build_http_client()?, config.clone());
                let result = ResultFetcher::new(backend, config.retry_policy())
                    .fetch_completed(&state)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&result.payload)?);
            }
            Ok(if state.run_status == RunStatus::Failed { 2 } else { 0 })
        }
        Command::Probe {
            competitors,
            focus_area,
        } => {
            let request = AnalysisRequest::new(competitors, &focus_area)?;
            let backend = HttpBackend::new(config.build_http_client()?, config.clone());
            let descriptor = backend.probe(&request).await?;
            if descriptor.is_cached {
                println!(
                    "{} cost saved ${} | original processing {} ms",
                    "cached".green().bold(),
                    descriptor.cost_saved,
                    descriptor.processing_time_ms
                );
            } else {
                println!("{}", "not cached".yellow());
            }
            Ok(0)
        }
        Command::Fetch { analysis_id } => {
            let backend = HttpBackend::new(config.build_http_client()?, config.clone());
            let result = ResultFetcher::new(backend, config.retry_policy())
                .fetch(&AnalysisId::from(analysis_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&result.payload)?);
            Ok(0)
        }
        Command::Replay { path } => {
            let events = event_log::import(&path)?;
            let analysis_id = match path.file_stem() {
                Some(stem) => AnalysisId::from(stem.to_string_lossy().to_string()),
                None => AnalysisId::from("replay"),
            };
            let state = event_log::replay(analysis_id, &events);
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(0)
        }
        Command::Simulate {
            host,
            port,
            step_delay_ms,
        } => {
            let addr = format!("{}:{}", host, port);
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            sim::serve(listener, SimState::new(Duration::from_millis(step_delay_ms))).await?;
            Ok(0)
        }
    }
}

async fn watch(config: &ClientConfig, request: AnalysisRequest, analysis_id: AnalysisId, mode: DeliveryMode) -> Result<StreamState> {
    let client = config.build_http_client()?;
    let transport = SseTransport::new(client.clone(), config.api_token.clone());
    let backend = HttpBackend::new(client, config.clone());
    let router = DeliveryRouter::new(transport, backend, config.clone());

    println!(
        "{} {} ({})",
        "watching".bold(),
        analysis_id,
        request.competitors.join(", ")
    );
    let mut session = router.watch(request, analysis_id, mode);

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut printed = Printed::default();
    session
        .run_with_reconnects(&config.retry_policy(), |phase, state| {
            print_update(phase, state, &mut printed)
        })
        .await;

    let state = session.into_state();
    print_outcome(&state);
    Ok(state)
}

/// How much of which attempt's event log is already on screen.
#[derive(Default)]
struct Printed {
    attempt: u32,
    entries: usize,
}

impl Printed {
    /// Log entries not shown yet. A new attempt starts over from its first entry.
    fn take_new<'a>(&mut self, state: &'a StreamState) -> &'a [LoggedEvent] {
        if state.attempt != self.attempt {
            self.attempt = state.attempt;
            self.entries = 0;
        }
        let start = self.entries.min(state.event_log.len());
        self.entries = state.event_log.len();
        &state.event_log[start..]
    }
}

fn print_update(phase: RouterPhase, state: &StreamState, printed: &mut Printed) {
    for logged in printed.take_new(state) {
        let kind = logged.envelope.kind.as_str();
        let tag = if logged.duplicate {
            format!("{} (dup)", kind).dimmed()
        } else {
            kind.cyan()
        };
        let text = match (&logged.envelope.error, logged.envelope.insight_text()) {
            (Some(err), _) => err.red().to_string(),
            (None, Some(text)) => text,
            (None, None) => String::new(),
        };
        println!(
            "[{:>3}%] {:<8} {:<22} {}",
            state.progress,
            cache_label(state.cache_status),
            tag,
            text
        );
    }

    if let Some(fault) = &state.connection_error {
        if phase != RouterPhase::Done {
            println!("{} {}", "connection lost:".yellow(), fault.message);
        }
    }
}

fn cache_label(status: CacheStatus) -> ColoredString {
    match status {
        CacheStatus::Unknown => "-".normal(),
        CacheStatus::Checking => "checking".dimmed(),
        CacheStatus::Hit => "cached".green(),
        CacheStatus::Miss => "miss".yellow(),
        CacheStatus::Live => "live".blue(),
    }
}

fn print_outcome(state: &StreamState) {
    match state.run_status {
        RunStatus::Completed => {
            println!("{} ({}%)", "analysis completed".green().bold(), state.progress);
            if state.cache_status == CacheStatus::Hit {
                println!("cost saved: ${:.4}", state.cost_saved);
            }
            for insight in &state.insights {
                println!("  {} {}", "•".cyan(), insight.text);
            }
        }
        RunStatus::Failed => {
            let message = state.error_message.as_deref().unwrap_or("analysis failed");
            println!("{} {}", "analysis failed:".red().bold(), message);
        }
        RunStatus::Idle | RunStatus::Running => {
            let reason = match &state.connection_error {
                Some(fault) => fault.message.clone(),
                None => "stopped".to_string(),
            };
            println!("{} at {}%: {}", "watch ended".yellow().bold(), state.progress, reason);
        }
    }
}
