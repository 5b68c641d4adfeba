use crate::clock::LamportClock;
use crate::http::{self, Reply, WEATHER_ENDPOINT};
use crate::{AtmoError, Result};
use serde_json::{Map, Value};
use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A query client: issues one GET against the aggregation server and
/// pretty-prints whatever comes back, carrying its own Lamport clock.
///
/// Transport-level failures are retried up to three times, 3 s apart, each
/// on a fresh connection; any other failure surfaces immediately.
pub struct QueryClient {
    authority: String,
    clock: LamportClock,
}

impl QueryClient {
    /// creates a client for the given server URL
    ///
    /// # Errors
    /// returns [`AtmoError::Parsing`] if the URL has no usable `host:port`
    pub fn new(server_url: &str) -> Result<Self> {
        Ok(QueryClient {
            authority: http::server_authority(server_url)?,
            clock: LamportClock::new(),
        })
    }

    /// Fetches all observations, or a single station's when `station` is
    /// given, retrying transport failures.
    ///
    /// # Errors
    /// returns the last transport error once the retries are exhausted
    pub fn fetch(&self, station: Option<&str>) -> Result<Reply> {
        let target = match station {
            Some(id) => format!("{}?id={}", WEATHER_ENDPOINT, id),
            None => WEATHER_ENDPOINT.to_string(),
        };

        let mut retries = 0;
        loop {
            match self.exchange(&target) {
                Ok(reply) => return Ok(reply),
                // only transport failures are worth another attempt
                Err(e @ AtmoError::Io { .. }) => {
                    warn!(retries, "request failed: {}", e);
                    if retries >= MAX_RETRIES {
                        return Err(e);
                    }
                    retries += 1;
                    thread::sleep(RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// runs one query and prints the outcome: the rendered observations on
    /// 200, an error line for any other status
    ///
    /// # Errors
    /// returns the fetch error when even retries could not reach the server
    pub fn run(&self, station: Option<&str>) -> Result<()> {
        let reply = self.fetch(station)?;
        if reply.status == 200 {
            self.clock.tick(); // local event: process the response
            println!("{}", render(&reply.body));
        } else {
            println!("Error: Server returned status code {}", reply.status);
        }
        Ok(())
    }

    fn exchange(&self, target: &str) -> Result<Reply> {
        let stream = TcpStream::connect(&self.authority)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let mut writer = BufWriter::new(stream.try_clone()?);

        let lamport = self.clock.tick(); // local event: message send
        http::write_request(&mut writer, "GET", target, lamport, "")?;

        let mut reader = BufReader::new(stream);
        let reply = http::read_reply(&mut reader)?;
        match reply.lamport {
            Some(v) => self.clock.observe(v),
            None => self.clock.tick(),
        };
        debug!(status = reply.status, "received response");
        Ok(reply)
    }
}

/// Renders a response body for display: a JSON array becomes one
/// `key: value` block per element with blank lines between, a single object
/// becomes one block, and anything else an error line.
pub fn render(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => items
            .iter()
            .map(render_element)
            .collect::<Vec<_>>()
            .join("\n\n"),
        Ok(Value::Object(fields)) => render_fields(&fields),
        _ => "Error: Invalid JSON data".to_string(),
    }
}

fn render_element(element: &Value) -> String {
    match element {
        Value::Object(fields) => render_fields(fields),
        _ => "Error: Invalid JSON data".to_string(),
    }
}

fn render_fields(fields: &Map<String, Value>) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{}: {}", key, render_scalar(value)))
        .collect::<Vec<_>>()
        .join("\n")
}

// strings print bare, numbers and anything else via their JSON form
fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
