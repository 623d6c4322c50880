use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use colored::Colorize;
use futures::future::join_all;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vaas::http::DEFAULT_HTTP_URL;
use vaas::{
    ConnectionOptions, Credentials, OidcAuthenticator, RequestContext, Sha256, Vaas, VaasHttp,
    VaasOptions, VaasVerdict, Verdict,
};

#[derive(Parser, Debug)]
#[command(name = "vaas")]
#[command(about = "Ask Verdict-as-a-Service about hashes, files and URLs", long_about = None)]
#[command(version)]
#[command(group(ArgGroup::new("check").required(true).args(["sha256", "file", "url"])))]
struct Cli {
    /// Targets are SHA-256 hashes
    #[arg(short = 's', long)]
    sha256: bool,

    /// Targets are local files
    #[arg(short = 'f', long)]
    file: bool,

    /// Targets are URLs
    #[arg(short = 'u', long)]
    url: bool,

    /// Hashes, file paths or URLs to check
    #[arg(required = true)]
    targets: Vec<String>,

    /// Use the stateless HTTP polling API instead of the websocket gateway
    #[arg(long)]
    http: bool,

    /// Service endpoint (defaults to the production gateway)
    #[arg(long)]
    endpoint: Option<String>,

    /// Credentials file (TOML); environment variables override its values
    #[arg(long, env = "VAAS_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Timeout per target in seconds
    #[arg(long, default_value_t = 600)]
    timeout: u64,

    /// Do not answer from the server's verdict cache
    #[arg(long)]
    no_cache: bool,

    /// Do not answer from hash reputation lookups
    #[arg(long)]
    no_hash_lookup: bool,

    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn options(&self) -> VaasOptions {
        VaasOptions {
            use_cache: !self.no_cache,
            use_hash_lookup: !self.no_hash_lookup,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "vaas=debug",
        _ => "vaas=trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(verdicts) => report(&verdicts),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<Vec<(String, VaasVerdict)>> {
    let mut credentials =
        Credentials::load(cli.credentials.as_deref()).context("Failed to load credentials")?;
    if let Some(endpoint) = &cli.endpoint {
        credentials.vaas_url = Some(endpoint.clone());
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling outstanding requests");
                cancel.cancel();
            }
        });
    }
    let ctx = RequestContext::with_timeout(Duration::from_secs(cli.timeout)).with_cancellation(cancel);

    if cli.http {
        run_http(&cli, &credentials, &ctx).await
    } else {
        run_websocket(&cli, &credentials, &ctx).await
    }
}

async fn run_websocket(
    cli: &Cli,
    credentials: &Credentials,
    ctx: &RequestContext,
) -> Result<Vec<(String, VaasVerdict)>> {
    let vaas = Vaas::from_credentials(credentials, cli.options(), ConnectionOptions::default())
        .context("Failed to set up client")?;
    vaas.connect()
        .await
        .with_context(|| format!("Failed to connect to {}", credentials.vaas_url()))?;

    let verdicts = if cli.sha256 {
        let hashes = parse_hashes(&cli.targets)?;
        vaas.for_sha256_list(&hashes, ctx).await
    } else if cli.file {
        let paths: Vec<PathBuf> = cli.targets.iter().map(PathBuf::from).collect();
        vaas.for_file_list(&paths, ctx).await
    } else {
        let client = &vaas;
        join_all(cli.targets.iter().map(|url| async move {
            client
                .for_url(url, ctx)
                .await
                .unwrap_or_else(|e| VaasVerdict::error(url.as_str(), e.to_string()))
        }))
        .await
    };

    vaas.close().await.context("Failed to close connection")?;
    Ok(cli.targets.iter().cloned().zip(verdicts).collect())
}

async fn run_http(
    cli: &Cli,
    credentials: &Credentials,
    ctx: &RequestContext,
) -> Result<Vec<(String, VaasVerdict)>> {
    let base = credentials.vaas_url.as_deref().unwrap_or(DEFAULT_HTTP_URL);
    let authenticator = OidcAuthenticator::new(credentials.grant()?, credentials.token_url())?;
    let client = VaasHttp::new(base, Arc::new(authenticator), cli.options())
        .context("Failed to set up HTTP client")?;

    let hashes = if cli.sha256 {
        Some(parse_hashes(&cli.targets)?)
    } else {
        None
    };

    let verdicts = join_all(cli.targets.iter().enumerate().map(|(index, target)| {
        let client = &client;
        let hashes = &hashes;
        async move {
            let result = match hashes {
                Some(hashes) => client.for_sha256(&hashes[index], ctx).await,
                None if cli.file => client.for_file(target, ctx).await,
                None => client.for_url(target, ctx).await,
            };
            result.unwrap_or_else(|e| VaasVerdict::error(target.as_str(), e.to_string()))
        }
    }))
    .await;

    Ok(cli.targets.iter().cloned().zip(verdicts).collect())
}

fn parse_hashes(targets: &[String]) -> Result<Vec<Sha256>> {
    targets
        .iter()
        .map(|target| {
            target
                .parse::<Sha256>()
                .with_context(|| format!("Invalid SHA-256: {}", target))
        })
        .collect()
}

/// Print one line per target. Exit 2 if anything is malicious, 1 if any
/// target failed, 0 otherwise.
fn report(verdicts: &[(String, VaasVerdict)]) -> ExitCode {
    let mut malicious = 0usize;
    let mut failed = 0usize;

    for (target, verdict) in verdicts {
        let label = match verdict.verdict {
            Verdict::Clean => verdict.verdict.as_str().green(),
            Verdict::Malicious => verdict.verdict.as_str().red().bold(),
            Verdict::Pup => verdict.verdict.as_str().yellow(),
            Verdict::Unknown => verdict.verdict.as_str().normal(),
            Verdict::Error => verdict.verdict.as_str().red(),
        };
        match (&verdict.detection, &verdict.error_message) {
            (_, Some(message)) => println!("{} {} ({})", target, label, message),
            (Some(detection), None) => println!("{} {} {}", target, label, detection.dimmed()),
            (None, None) => println!("{} {}", target, label),
        }

        match verdict.verdict {
            Verdict::Malicious => malicious += 1,
            Verdict::Error => failed += 1,
            _ => {}
        }
    }

    if malicious > 0 {
        ExitCode::from(2)
    } else if failed > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
