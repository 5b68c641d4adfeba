//! this binary starts the atmo aggregation server
//! to see the list of arguments, type: `atmo-server --help`

use atmo::server::DEFAULT_PORT;
use atmo::{AggregationServer, Result, ServerConfig};
use clap::{crate_version, App, Arg};
use std::net::SocketAddr;
use std::process::exit;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn main() {
    // set up a tracing subscriber to log to STDERR
    subscriber_config();

    let matches = App::new("atmo-server")
        .version(crate_version!())
        .about("weather-data aggregation server")
        .arg(
            Arg::with_name("PORT")
                .help("the port to listen on")
                .index(1),
        )
        .get_matches();

    let port = match matches.value_of("PORT").map(str::parse::<u16>) {
        None => DEFAULT_PORT,
        Some(Ok(port)) => port,
        Some(Err(_)) => {
            eprintln!("Invalid port number. Using default port {}", DEFAULT_PORT);
            DEFAULT_PORT
        }
    };

    if let Err(e) = run(port) {
        eprintln!("{:?}", e);
        exit(1);
    }
}

fn run(port: u16) -> Result<()> {
    info!("atmo-server {}", env!("CARGO_PKG_VERSION"));
    info!("Listening on port {}", port);

    let config = ServerConfig {
        addr: SocketAddr::from(([0, 0, 0, 0], port)),
        ..ServerConfig::default()
    };
    let server = AggregationServer::new(config)?;
    server.start()?.join()
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        // all spans/events with a level higher than INFO will be logged
        .with_max_level(Level::INFO)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        // completes the builder.
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
