use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::engine::{NewExperiment, TrafficSplit};

#[derive(Parser, Debug)]
#[command(name = "ab-engine")]
#[command(version)]
#[command(about = "A/B testing engine: deterministic bucketing, z-tests and automatic winners")]
pub struct Args {
    /// TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Store path, overrides [store] path (":memory:" for in-memory)
    #[arg(long, global = true)]
    pub db: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Run the HTTP API (and the scheduled sweep)
    Serve {
        /// Port, overrides [server] port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Analyze every active experiment once and complete the winners
    Sweep {
        #[arg(long)]
        site_id: Option<String>,
    },
    /// Print the statistical analysis of one experiment
    Analyze { experiment_id: String },
    /// Apply a status action: pause, resume, start, cancel, complete
    Status { experiment_id: String, action: String },
    /// List experiments
    List {
        #[arg(long)]
        site_id: Option<String>,
        /// draft, active, paused, completed or cancelled
        #[arg(long)]
        status: Option<String>,
    },
    /// Create an experiment
    Create {
        #[arg(long)]
        site_id: String,
        #[arg(long)]
        name: String,
        /// Experiment type used to scope site assignment
        #[arg(long = "type")]
        kind: Option<String>,
        /// Control content (JSON, or a plain string)
        #[arg(long)]
        control: String,
        /// Variant content (JSON, or a plain string)
        #[arg(long)]
        variant: String,
        /// Traffic split as CONTROL/VARIANT percentages, e.g. 70/30
        #[arg(long, value_parser = parse_split)]
        split: Option<TrafficSplit>,
        /// Create in draft instead of active
        #[arg(long)]
        draft: bool,
    },
}

impl Command {
    /// Build the creation request for [`Command::Create`].
    pub fn new_experiment(&self) -> Option<NewExperiment> {
        match self {
            Command::Create { site_id, name, kind, control, variant, split, draft } => {
                Some(NewExperiment {
                    site_id: site_id.clone(),
                    name: name.clone(),
                    kind: kind.clone(),
                    control_content: parse_content(control),
                    variant_content: parse_content(variant),
                    traffic_split: *split,
                    draft: *draft,
                })
            }
            _ => None,
        }
    }
}

/// Parse `"70/30"` into a split. The sum is checked at creation.
pub fn parse_split(s: &str) -> Result<TrafficSplit, String> {
    let (control, variant) = s
        .split_once('/')
        .ok_or_else(|| format!("expected CONTROL/VARIANT, got '{s}'"))?;
    let control: u32 =
        control.trim().parse().map_err(|_| format!("bad control percentage in '{s}'"))?;
    let variant: u32 =
        variant.trim().parse().map_err(|_| format!("bad variant percentage in '{s}'"))?;
    Ok(TrafficSplit::new(control, variant))
}

/// JSON if it parses, otherwise the raw text as a JSON string.
pub fn parse_content(s: &str) -> Value {
    serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args_parse_serve_defaults() {
        let args = Args::parse_from(["ab-engine", "serve"]);
        assert_eq!(args.command, Command::Serve { port: None });
        assert!(args.config.is_none());
        assert!(args.db.is_none());
    }

    #[test]
    fn test_args_parse_global_flags_after_subcommand() {
        let args = Args::parse_from([
            "ab-engine", "serve", "--port", "9000", "--db", ":memory:", "--config", "ab.toml",
        ]);
        assert_eq!(args.command, Command::Serve { port: Some(9000) });
        assert_eq!(args.db.as_deref(), Some(":memory:"));
        assert_eq!(args.config, Some(PathBuf::from("ab.toml")));
    }

    #[test]
    fn test_args_parse_status() {
        let args = Args::parse_from(["ab-engine", "status", "exp-1", "pause"]);
        assert_eq!(
            args.command,
            Command::Status { experiment_id: "exp-1".into(), action: "pause".into() }
        );
    }

    #[test]
    fn test_args_parse_sweep_scoped() {
        let args = Args::parse_from(["ab-engine", "sweep", "--site-id", "site-9"]);
        assert_eq!(args.command, Command::Sweep { site_id: Some("site-9".into()) });
    }

    #[test]
    fn test_args_parse_create() {
        let args = Args::parse_from([
            "ab-engine",
            "create",
            "--site-id",
            "s1",
            "--name",
            "Hero headline",
            "--type",
            "headline",
            "--control",
            "Build your site",
            "--variant",
            r#"{"text":"Launch in minutes"}"#,
            "--split",
            "70/30",
        ]);
        let input = args.command.new_experiment().unwrap();
        assert_eq!(input.site_id, "s1");
        assert_eq!(input.kind.as_deref(), Some("headline"));
        assert_eq!(input.control_content, json!("Build your site"));
        assert_eq!(input.variant_content, json!({"text": "Launch in minutes"}));
        assert_eq!(input.traffic_split, Some(TrafficSplit::new(70, 30)));
        assert!(!input.draft);
    }

    #[test]
    fn test_args_reject_bad_split() {
        let result = Args::try_parse_from([
            "ab-engine", "create", "--site-id", "s", "--name", "n", "--control", "a", "--variant",
            "b", "--split", "seventy",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_args_missing_subcommand_is_error() {
        assert!(Args::try_parse_from(["ab-engine"]).is_err());
    }

    #[test]
    fn test_parse_split() {
        assert_eq!(parse_split("50/50").unwrap(), TrafficSplit::default());
        assert_eq!(parse_split(" 90 / 10 ").unwrap(), TrafficSplit::new(90, 10));
        assert!(parse_split("50").is_err());
        assert!(parse_split("a/b").is_err());
    }

    #[test]
    fn test_new_experiment_only_for_create() {
        assert!(Command::Analyze { experiment_id: "e".into() }.new_experiment().is_none());
    }
}
