//! The atmo-client executable queries an aggregation server and
//! pretty-prints the observations it returns:
//!
//! `atmo-client <SERVER_URL> [STATION_ID]`
//!
//!     SERVER_URL is the aggregation server, either http://host:port or host:port.
//!     With a STATION_ID only that station's observation is fetched,
//!     otherwise all live observations are listed.
//!     Prints an error and returns a non-zero exit code on argument errors
//!     or when the server cannot be reached.

use atmo::{QueryClient, Result};
use clap::{crate_version, App, Arg};
use std::process::exit;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn main() {
    // configure a subscriber that will log messages to STDERR
    subscriber_config();

    let matches = App::new("atmo-client")
        .version(crate_version!())
        .about("queries a weather-data aggregation server")
        .arg(
            Arg::with_name("SERVER_URL")
                .help("the aggregation server, e.g. http://localhost:4567")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("STATION_ID")
                .help("fetch only this station's observation")
                .index(2),
        )
        .get_matches();

    // clap guarantees the URL is present
    let server_url = matches.value_of("SERVER_URL").unwrap();
    let station = matches.value_of("STATION_ID");

    if let Err(e) = run(server_url, station) {
        eprintln!("{:?}", e);
        exit(1);
    }
}

fn run(server_url: &str, station: Option<&str>) -> Result<()> {
    let client = QueryClient::new(server_url)?;
    client.run(station)
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
