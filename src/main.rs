mod cli;

use clap::Parser;
use cli::{Cli, Commands, PlanArgs};
use geobatch::batch::GeometryPackage;
use geobatch::config::Config;
use geobatch::planner::{AoiSource, AreaOfInterest, plan};
use geobatch::regions::RegionCatalog;
use tracing_subscriber::EnvFilter;

type AnyError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Server(args) => {
            if let Some(address) = args.address {
                config.server.bind_addr = address;
            }
            geobatch::api::run(config).await?
        }
        Commands::Plan(args) => run_plan(&config, args)?,
    }

    Ok(())
}

fn run_plan(config: &Config, args: PlanArgs) -> Result<(), AnyError> {
    let source = match (args.area.bbox, args.area.region) {
        (Some(values), _) => {
            let bbox: [f64; 4] = values
                .as_slice()
                .try_into()
                .map_err(|_| "--bbox takes exactly four values")?;
            AoiSource::Bbox(bbox)
        }
        (None, Some(code)) => AoiSource::Region(code),
        (None, None) => return Err("either --bbox or --region is required".into()),
    };

    let regions = match (&source, &config.regions.path) {
        (AoiSource::Region(_), Some(path)) => {
            RegionCatalog::load(path, &config.regions.code_property)?
        }
        _ => RegionCatalog::default(),
    };

    let aoi = AreaOfInterest::resolve(&source, &regions)?;
    let crs = args.crs.as_deref().unwrap_or(&config.planner.target_crs);
    let tiles = plan(&aoi, crs, &config.planner.constraints(args.resolution))?;

    let package = GeometryPackage::from_tiles("plan", &tiles);
    println!(
        "{}",
        serde_json::to_string_pretty(&package.to_feature_collection())?
    );
    Ok(())
}
