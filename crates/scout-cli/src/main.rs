use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use scout_core::{Bounds, DiscoveryRequest, GeoPoint, ProgressSink, ProviderId};
use scout_discovery::{write_session_report, ScoutConfig, SessionPhase};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "scout")]
#[command(about = "Event venue discovery across reservation and search providers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one discovery session, streaming progress events as JSON lines.
    Discover(DiscoverArgs),
    /// List known neighborhoods, for one city or all of them.
    Neighborhoods {
        #[arg(long)]
        city: Option<String>,
    },
    /// Look up the best event-inquiry email for a domain.
    Email {
        #[arg(long)]
        domain: String,
    },
}

#[derive(Debug, Args)]
struct DiscoverArgs {
    #[arg(long)]
    city: String,
    /// Repeatable or comma separated.
    #[arg(long = "neighborhood", value_delimiter = ',')]
    neighborhoods: Vec<String>,
    /// `sw_lat,sw_lng,ne_lat,ne_lng`; replaces any neighborhoods.
    #[arg(long, value_parser = parse_bounds)]
    bounds: Option<Bounds>,
    #[arg(long)]
    cuisine: Option<String>,
    #[arg(long, default_value_t = 2)]
    party_size: u32,
    /// Defaults to every provider.
    #[arg(long, value_delimiter = ',')]
    sources: Vec<ProviderId>,
    #[arg(long, default_value_t = 25)]
    limit: usize,
    /// Also write reports/<session_id>/ under the workspace root.
    #[arg(long)]
    report: bool,
}

impl DiscoverArgs {
    fn to_request(&self) -> DiscoveryRequest {
        let sources = if self.sources.is_empty() {
            ProviderId::ALL.to_vec()
        } else {
            self.sources.clone()
        };
        let mut request = DiscoveryRequest::new(self.city.clone(), sources, self.limit);
        request.neighborhoods = self.neighborhoods.clone();
        request.bounds = self.bounds;
        request.cuisine = self.cuisine.clone();
        request.party_size = self.party_size;
        request
    }
}

fn parse_bounds(raw: &str) -> Result<Bounds, String> {
    let values: Vec<f64> = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|err| format!("invalid coordinate: {err}"))?;
    let [sw_lat, sw_lng, ne_lat, ne_lng] = values[..] else {
        return Err("expected sw_lat,sw_lng,ne_lat,ne_lng".to_string());
    };
    if sw_lat >= ne_lat || sw_lng >= ne_lng {
        return Err("southwest corner must lie south and west of the northeast corner".to_string());
    }
    Ok(Bounds {
        southwest: GeoPoint::new(sw_lat, sw_lng),
        northeast: GeoPoint::new(ne_lat, ne_lng),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scout=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = ScoutConfig::from_env();

    match cli.command {
        Commands::Discover(args) => discover(&config, &args).await,
        Commands::Neighborhoods { city } => list_neighborhoods(&config, city.as_deref()),
        Commands::Email { domain } => find_email(&config, &domain).await,
    }
}

async fn discover(config: &ScoutConfig, args: &DiscoverArgs) -> Result<()> {
    let (sink, mut events) = ProgressSink::channel();
    let mut request = args.to_request();
    request.progress = Some(sink);

    let cancel = CancellationToken::new();
    let session = config
        .build_session(request)
        .context("building discovery session")?
        .with_cancellation(cancel.clone());
    info!(session_id = %session.id(), city = %args.city, "starting discovery session");

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling session");
            interrupt.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(error = %err, "could not encode progress event"),
            }
        }
    });

    let outcome = session.run().await;
    printer.await.context("progress printer task failed")?;

    if args.report {
        let dir = write_session_report(&config.workspace_root, &outcome).await?;
        info!(path = %dir.display(), "session report written");
    }

    match &outcome.phase {
        SessionPhase::Failed { message } => bail!("discovery failed: {message}"),
        SessionPhase::Cancelled => warn!(session_id = %outcome.session_id, "discovery cancelled"),
        _ => info!(
            session_id = %outcome.session_id,
            venues = outcome.entities.len(),
            private_dining = outcome.summary.with_private_dining,
            with_email = outcome.summary.with_email,
            "discovery complete"
        ),
    }
    Ok(())
}

fn list_neighborhoods(config: &ScoutConfig, city: Option<&str>) -> Result<()> {
    let geo = config.load_geo_index()?;
    match city {
        Some(name) => {
            let city = geo.city(name).ok_or_else(|| anyhow!("unknown city `{name}`"))?;
            for neighborhood in &city.neighborhoods {
                println!("{}", neighborhood.name);
            }
        }
        None => {
            for city in geo.cities() {
                let names: Vec<_> = city.neighborhoods.iter().map(|n| n.name.as_str()).collect();
                println!("{}: {}", city.name, names.join(", "));
            }
        }
    }
    Ok(())
}

async fn find_email(config: &ScoutConfig, domain: &str) -> Result<()> {
    let http = config.build_http()?;
    let finder = config
        .build_email_finder(&http)
        .context("HUNTER_API_KEY is not set")?;
    match finder.find_email(domain).await? {
        Some(found) => println!("{}", serde_json::to_string_pretty(&found)?),
        None => println!("no email found for {domain}"),
    }
    Ok(())
}
