use clap::{Arg, ArgMatches, Command};
use log::LevelFilter;
use phishguard::config::OracleConfig;
use phishguard::dns::HickoryDns;
use phishguard::oracle::{ChatCompletionsOracle, CompletionOracle, UnconfiguredOracle};
use phishguard::store::{JsonFileStore, StoredAnalysis, VerdictStore};
use phishguard::{EmailRecord, EngineConfig, RiskAggregator, RiskLevel, RiskVerdict};
use std::path::Path;
use std::process;
use std::str::FromStr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("phishguard")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Phishing risk scoring for individual email messages")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/phishguard.yaml")
                .global(true),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging with per-lookup detail")
                .action(clap::ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("analyze")
                .about("Score an email given as a JSON record or a raw .eml message")
                .arg(Arg::new("file").value_name("FILE").required(true))
                .arg(
                    Arg::new("json")
                        .long("json")
                        .help("Print the verdict as JSON")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("save")
                        .long("save")
                        .help("Store the verdict in the configured store directory")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("show")
                .about("Show a stored analysis")
                .arg(Arg::new("id").value_name("ID").required(true)),
        )
        .subcommand(
            Command::new("list")
                .about("List stored analyses, most recent first")
                .arg(
                    Arg::new("limit")
                        .short('n')
                        .long("limit")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("20"),
                )
                .arg(
                    Arg::new("min-level")
                        .long("min-level")
                        .value_name("LEVEL")
                        .help("Only show verdicts at this level or above (safe, low, medium, high, critical, error)")
                        .action(clap::ArgAction::Set),
                ),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/phishguard.yaml");
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        config
            .logging
            .as_ref()
            .and_then(|l| LevelFilter::from_str(&l.level).ok())
            .unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if !Path::new(config_path).exists() {
        log::warn!("Configuration file '{config_path}' not found, using default configuration");
    }

    let result = match matches.subcommand() {
        Some(("analyze", sub)) => analyze_command(&config, sub).await,
        Some(("show", sub)) => show_command(&config, sub).await,
        Some(("list", sub)) => list_command(&config, sub).await,
        _ => {
            eprintln!("No command given; try 'phishguard analyze <FILE>' or --help");
            process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<EngineConfig> {
    if Path::new(path).exists() {
        EngineConfig::from_file(path)
    } else {
        Ok(EngineConfig::default())
    }
}

fn generate_default_config(path: &str) {
    let config = EngineConfig::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn build_oracle(config: &OracleConfig) -> Arc<dyn CompletionOracle> {
    let api_key = match std::env::var(&config.api_key_env) {
        Ok(key) if !key.trim().is_empty() => key,
        _ => {
            log::warn!(
                "{} is not set, content analysis will be scored as failed",
                config.api_key_env
            );
            return Arc::new(UnconfiguredOracle::new(&format!(
                "{} is not set",
                config.api_key_env
            )));
        }
    };

    match ChatCompletionsOracle::new(&config.endpoint, &config.model, &api_key, config.timeout()) {
        Ok(oracle) => Arc::new(oracle),
        Err(e) => {
            log::warn!("Could not build completion client: {e}");
            Arc::new(UnconfiguredOracle::new(&e.to_string()))
        }
    }
}

async fn open_store(config: &EngineConfig) -> anyhow::Result<JsonFileStore> {
    let store = config
        .store
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no store directory configured (store.directory)"))?;
    Ok(JsonFileStore::open(&store.directory).await?)
}

fn read_email(path: &str) -> anyhow::Result<EmailRecord> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read email file {path}: {e}"))?;
    let file = Path::new(path);

    if file.extension().and_then(|e| e.to_str()) == Some("eml") {
        let fallback_id = file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("message");
        Ok(EmailRecord::from_eml(&content, fallback_id))
    } else {
        EmailRecord::from_json(&content)
    }
}

async fn analyze_command(config: &EngineConfig, matches: &ArgMatches) -> anyhow::Result<()> {
    let path = matches
        .get_one::<String>("file")
        .ok_or_else(|| anyhow::anyhow!("missing email file"))?;
    let email = read_email(path)?;

    let dns = Arc::new(HickoryDns::from_system_conf(config.dns.timeout()));
    let oracle = build_oracle(&config.oracle);
    let aggregator = RiskAggregator::new(config, dns, oracle);

    let verdict = aggregator.analyze(&email).await;

    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        print_verdict(&email.id, &email.sender, &email.subject, &verdict);
    }

    if matches.get_flag("save") {
        let store = open_store(config).await?;
        store.save(StoredAnalysis::new(&email, verdict)).await?;
        log::info!("Saved analysis for email {}", email.id);
    }

    Ok(())
}

async fn show_command(config: &EngineConfig, matches: &ArgMatches) -> anyhow::Result<()> {
    let id = matches
        .get_one::<String>("id")
        .ok_or_else(|| anyhow::anyhow!("missing analysis id"))?;
    let store = open_store(config).await?;

    match store.get(id).await? {
        Some(stored) => {
            println!("Analyzed at: {}", stored.analyzed_at.to_rfc3339());
            print_verdict(
                &stored.email_id,
                &stored.sender,
                &stored.subject,
                &stored.verdict,
            );
            Ok(())
        }
        None => anyhow::bail!("no stored analysis with id {id}"),
    }
}

async fn list_command(config: &EngineConfig, matches: &ArgMatches) -> anyhow::Result<()> {
    let limit = matches.get_one::<usize>("limit").copied().unwrap_or(20);
    let store = open_store(config).await?;
    let analyses = match matches.get_one::<String>("min-level") {
        Some(level) => {
            let min_level = RiskLevel::from_str(level).map_err(|e| anyhow::anyhow!(e))?;
            store.list_at_least(min_level, limit).await?
        }
        None => store.list(limit).await?,
    };

    if analyses.is_empty() {
        println!("No stored analyses.");
        return Ok(());
    }

    for stored in analyses {
        println!(
            "{}  {:>3} {:<8}  {:<30}  {}",
            stored.analyzed_at.format("%Y-%m-%d %H:%M"),
            stored.verdict.risk_score,
            stored.verdict.risk_level.to_string(),
            truncate_string(&stored.email_id, 30),
            truncate_string(&stored.subject, 50)
        );
    }
    Ok(())
}

fn print_verdict(id: &str, sender: &str, subject: &str, verdict: &RiskVerdict) {
    println!("Email:   {id}");
    println!("From:    {sender}");
    println!("Subject: {subject}");
    println!(
        "Risk:    {}/100 ({})",
        verdict.risk_score, verdict.risk_level
    );
    println!("Recommendation: {}", verdict.recommendation);
    if verdict.findings.is_empty() {
        println!("Findings: none");
    } else {
        println!("Findings:");
        for finding in &verdict.findings {
            println!("  - {finding}");
        }
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
