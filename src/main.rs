use std::sync::Arc;

use clap::Parser;
use colored::*;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use ab_engine::cli::{Args, Command};
use ab_engine::config::EngineConfig;
use ab_engine::engine::RecommendedAction;
use ab_engine::store::ExperimentFilter;
use ab_engine::{web, EngineError, ExperimentEngine, ExperimentStatus, StatisticalAnalysis};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("{} {}", "error:".bright_red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> ab_engine::Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(db) = &args.db {
        config.store.path = db.clone();
    }
    if let Command::Serve { port: Some(port) } = &args.command {
        config.server.port = *port;
    }
    config.validate()?;

    let store = config.open_store()?;
    let (engine, worker) = ExperimentEngine::new(store, config.engine_settings());
    let worker = worker.spawn();
    let engine = Arc::new(engine);

    match args.command {
        Command::Serve { .. } => {
            eprintln!("{}", format!("  store: {}", config.store.path).bright_cyan());
            let listener = TcpListener::bind(config.bind_addr()).await?;
            web::serve(listener, Arc::clone(&engine), config.sweep_interval()).await?;
        }
        Command::Sweep { site_id } => {
            let analyses = engine.sweep(site_id.as_deref())?;
            if analyses.is_empty() {
                eprintln!("{}", "  no active experiments".yellow());
            }
            for analysis in &analyses {
                print_summary(analysis);
            }
        }
        Command::Analyze { experiment_id } => {
            let analysis = engine.analyze_experiment(&experiment_id)?;
            print_summary(&analysis);
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Command::Status { experiment_id, action } => {
            let status = engine.set_status(&experiment_id, &action)?;
            println!("{} {} -> {}", "✓".bright_green(), experiment_id, status.to_string().bold());
        }
        Command::List { site_id, status } => {
            let mut filter = ExperimentFilter::default();
            filter.site_id = site_id;
            if let Some(status) = status {
                filter = filter.with_status(status.parse::<ExperimentStatus>()?);
            }
            for e in engine.list_experiments(&filter)? {
                println!(
                    "{}  {:<10} {:<9} {:<24} {}/{} visitors",
                    e.id.dimmed(),
                    e.site_id,
                    e.status.as_str(),
                    e.name,
                    e.control_visitors,
                    e.variant_visitors
                );
            }
        }
        ref command @ Command::Create { .. } => {
            let input = command
                .new_experiment()
                .ok_or_else(|| EngineError::Config("create arguments missing".into()))?;
            let experiment = engine.create_experiment(input)?;
            println!("{}", serde_json::to_string_pretty(&experiment)?);
        }
    }

    // Let queued completions land before exit.
    drop(engine);
    if let Ok(stats) = worker.await {
        if stats.completed > 0 {
            eprintln!(
                "{}",
                format!("  completed {} experiment(s)", stats.completed).bright_green()
            );
        }
    }
    Ok(())
}

fn print_summary(a: &StatisticalAnalysis) {
    let action = match a.recommended_action {
        RecommendedAction::DeclareWinner => a.recommended_action.to_string().bright_green().bold(),
        RecommendedAction::StopTest => a.recommended_action.to_string().yellow(),
        RecommendedAction::Continue => a.recommended_action.to_string().normal(),
    };
    eprintln!(
        "  {} {}  control {:.2}%  variant {:.2}%  lift {:+.1}%  p={:.4}  n={}/{}",
        a.experiment_id.dimmed(),
        action,
        a.control_rate * 100.0,
        a.variant_rate * 100.0,
        a.improvement_percentage,
        a.p_value,
        a.sample_size,
        a.min_sample_size
    );
}
