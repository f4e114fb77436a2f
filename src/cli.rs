use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "geobatch")]
#[command(about = "Bulk geospatial download orchestrator", long_about = None)]
pub struct Cli {
    /// Configuration file, overrides GEOBATCH_CONFIG
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP server
    Server(ServerArgs),
    /// Plan tiles for an area offline and print them as GeoJSON
    Plan(PlanArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServerArgs {
    /// Address to bind, overrides server.bind_addr
    #[arg(long)]
    pub address: Option<SocketAddr>,
}

#[derive(clap::Args, Debug)]
#[group(required = true, multiple = false, id = "area")]
pub struct AreaArgs {
    /// min_lon,min_lat,max_lon,max_lat in degrees
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    pub bbox: Option<Vec<f64>>,

    /// Region code from the configured region catalog
    #[arg(long)]
    pub region: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub area: AreaArgs,

    /// Target CRS, defaults to planner.target_crs
    #[arg(long)]
    pub crs: Option<String>,

    /// Ground resolution, defaults to planner.resolution_meters
    #[arg(long)]
    pub resolution: Option<f64>,
}
