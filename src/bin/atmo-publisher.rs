//! The atmo-publisher executable periodically uploads one station's feed
//! file to an aggregation server:
//!
//! `atmo-publisher <SERVER_URL> <FILE>`
//!
//!     SERVER_URL is the aggregation server, either http://host:port or host:port.
//!     FILE is a line-oriented key:value feed file that must contain an `id` line.
//!     Prints an error and returns a non-zero exit code on argument errors.

use atmo::{ContentPublisher, Result};
use clap::{crate_version, App, Arg};
use std::process::exit;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn main() {
    // configure a subscriber that will log messages to STDERR
    subscriber_config();

    let matches = App::new("atmo-publisher")
        .version(crate_version!())
        .about("periodically publishes a station feed file to an aggregation server")
        .arg(
            Arg::with_name("SERVER_URL")
                .help("the aggregation server, e.g. http://localhost:4567")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("FILE")
                .help("path of the station feed file to publish")
                .required(true)
                .index(2),
        )
        .get_matches();

    // clap guarantees both arguments are present
    let server_url = matches.value_of("SERVER_URL").unwrap();
    let feed_path = matches.value_of("FILE").unwrap();

    if let Err(e) = run(server_url, feed_path) {
        eprintln!("{:?}", e);
        exit(1);
    }
}

fn run(server_url: &str, feed_path: &str) -> Result<()> {
    let publisher = ContentPublisher::new(server_url, feed_path)?;
    publisher.run();
    Ok(())
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
