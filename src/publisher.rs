use crate::clock::LamportClock;
use crate::http::{self, Reply, WEATHER_ENDPOINT};
use crate::observation::Observation;
use crate::{AtmoError, Result};
use serde_json::Value;
use std::fs;
use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(3);
const UPDATE_INTERVAL: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

// response codes that count as an accepted upload
const ACCEPTED: [u16; 3] = [200, 201, 204];

/// Parses a station feed file into an [`Observation`].
///
/// The format is line-oriented `key:value` with the first colon as the
/// separator; keys and values are trimmed and blank lines are skipped.
/// Values that look like integers or floats become JSON numbers (except
/// `id`, which is always a station token), everything else stays a string.
///
/// # Errors
/// returns [`AtmoError::InvalidFormat`] for a line without a colon or with an
/// empty key/value, and [`AtmoError::MissingId`] when no `id` field is present
pub fn parse_feed(text: &str) -> Result<Observation> {
    let mut record = Observation::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let idx = line.find(':').ok_or_else(|| {
            AtmoError::InvalidFormat(format!("line has no key:value separator: {:?}", line))
        })?;
        let key = line[..idx].trim();
        let value = line[idx + 1..].trim();
        if key.is_empty() || value.is_empty() {
            return Err(AtmoError::InvalidFormat(format!(
                "empty key or value: {:?}",
                line
            )));
        }
        let coerced = if key == "id" {
            Value::String(value.to_string())
        } else {
            coerce_value(value)
        };
        record.insert(key, coerced);
    }
    if record.station_id().is_none() {
        return Err(AtmoError::MissingId);
    }
    Ok(record)
}

fn coerce_value(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(n) = raw.parse::<f64>() {
        if n.is_finite() {
            return Value::from(n);
        }
    }
    Value::String(raw.to_string())
}

/// A content publisher: owns one station feed file and pushes it to the
/// aggregation server every update interval, carrying its own Lamport clock.
///
/// Each upload is attempted up to three times with a 3 s pause between
/// attempts; an entirely failed cycle is logged and the next period tries
/// again from scratch. After a successful upload the record is read back and
/// compared field by field; a mismatch is reported but left for the next
/// periodic upload to repair.
pub struct ContentPublisher {
    authority: String,
    feed_path: PathBuf,
    clock: LamportClock,
    running: AtomicBool,
}

impl ContentPublisher {
    /// creates a publisher for the given server URL and feed file
    ///
    /// # Errors
    /// returns [`AtmoError::Parsing`] if the URL has no usable `host:port`
    pub fn new(server_url: &str, feed_path: impl Into<PathBuf>) -> Result<Self> {
        Ok(ContentPublisher {
            authority: http::server_authority(server_url)?,
            feed_path: feed_path.into(),
            clock: LamportClock::new(),
            running: AtomicBool::new(true),
        })
    }

    /// Runs one full upload cycle: read the feed file, parse it, serialize
    /// it, and PUT it with retries.
    ///
    /// # Errors
    /// returns the file read or parse error, or the last transport/status
    /// error once the retries are exhausted
    pub fn upload_once(&self) -> Result<()> {
        self.clock.tick(); // local event: begin upload

        let content = fs::read_to_string(&self.feed_path)?;
        if content.trim().is_empty() {
            // a blank feed still announces itself; the server answers 204
            info!(feed = %self.feed_path.display(), "feed file is empty, sending an empty update");
            let reply = self.exchange("PUT", WEATHER_ENDPOINT, "")?;
            return accepted(reply.status);
        }

        self.clock.tick(); // local event: parse
        let record = parse_feed(&content)?;
        self.clock.tick(); // local event: serialize
        let body = record.to_json();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.exchange("PUT", WEATHER_ENDPOINT, &body).and_then(|reply| accepted(reply.status)) {
                Ok(()) => {
                    debug!(attempt, "upload accepted");
                    self.verify(&record);
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, "upload attempt failed: {}", e);
                    if attempt >= MAX_RETRIES {
                        return Err(e);
                    }
                    thread::sleep(RETRY_DELAY);
                }
            }
        }
    }

    /// publishes every update interval until [`stop`](Self::stop) is called;
    /// a failed cycle is logged and skipped, never fatal
    pub fn run(&self) {
        info!(feed = %self.feed_path.display(), server = %self.authority, "publisher started");
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.upload_once() {
                warn!("periodic upload failed: {:?}", e);
            }
            thread::sleep(UPDATE_INTERVAL);
        }
        info!("publisher stopped");
    }

    /// asks the periodic loop to exit after the current cycle
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    // reads the published record back and compares it to what was sent; any
    // problem is reported but the next periodic upload re-publishes anyway
    fn verify(&self, sent: &Observation) {
        self.clock.tick(); // local event: begin verification
        let station = match sent.station_id() {
            Some(station) => station.to_string(),
            None => return,
        };
        let target = format!("{}?id={}", WEATHER_ENDPOINT, station);
        match self.exchange("GET", &target, "") {
            Ok(reply) if reply.status == 200 => match Observation::from_json(&reply.body) {
                Ok(retrieved) if &retrieved == sent => {
                    debug!(station = %station, "verified published record");
                }
                Ok(retrieved) => {
                    let differing: Vec<&str> = sent
                        .fields()
                        .filter(|&(key, value)| retrieved.field(key) != Some(value))
                        .map(|(key, _)| key.as_str())
                        .collect();
                    warn!(station = %station, ?differing, "retrieved record does not match the published record");
                }
                Err(e) => warn!(station = %station, "could not parse verification response: {}", e),
            },
            Ok(reply) => warn!(station = %station, status = reply.status, "verification read failed"),
            Err(e) => warn!(station = %station, "verification request failed: {}", e),
        }
    }

    // one request/response on a fresh connection, with the clock ticked for
    // the send and merged (or ticked) for the receive
    fn exchange(&self, method: &str, target: &str, body: &str) -> Result<Reply> {
        let stream = TcpStream::connect(&self.authority)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let mut writer = BufWriter::new(stream.try_clone()?);

        let lamport = self.clock.tick(); // local event: message send
        http::write_request(&mut writer, method, target, lamport, body)?;

        let mut reader = BufReader::new(stream);
        let reply = http::read_reply(&mut reader)?;
        match reply.lamport {
            Some(v) => self.clock.observe(v),
            None => self.clock.tick(),
        };
        Ok(reply)
    }
}

fn accepted(status: u16) -> Result<()> {
    if ACCEPTED.contains(&status) {
        Ok(())
    } else {
        Err(AtmoError::Status(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_feed_file() {
        let feed = "id:IDS60901\nname:Adelaide\nair_temp:13.3\nwind_spd_kmh:15\n";
        let record = parse_feed(feed).unwrap();
        assert_eq!(record.station_id(), Some("IDS60901"));
        assert_eq!(record.field("name"), Some(&json!("Adelaide")));
        assert_eq!(record.field("air_temp"), Some(&json!(13.3)));
        assert_eq!(record.field("wind_spd_kmh"), Some(&json!(15)));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let feed = "\nid:IDS60901\n\n\nname:Adelaide\n";
        let record = parse_feed(feed).unwrap();
        assert_eq!(record.len(), 2);
    }

    #[test]
    fn only_the_first_colon_separates() {
        let record = parse_feed("id:IDS60901\nlocal_date_time:15/04:00pm\n").unwrap();
        assert_eq!(record.field("local_date_time"), Some(&json!("15/04:00pm")));
    }

    #[test]
    fn values_are_trimmed() {
        let record = parse_feed("id :  IDS60901  \nstate:\tSA\n").unwrap();
        assert_eq!(record.station_id(), Some("IDS60901"));
        assert_eq!(record.field("state"), Some(&json!("SA")));
    }

    #[test]
    fn id_is_never_coerced_to_a_number() {
        let record = parse_feed("id:60901\nrel_hum:60\n").unwrap();
        assert_eq!(record.station_id(), Some("60901"));
        assert_eq!(record.field("rel_hum"), Some(&json!(60)));
    }

    #[test]
    fn rejects_a_line_without_a_separator() {
        assert!(matches!(
            parse_feed("id:IDS60901\njust some text\n"),
            Err(AtmoError::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_empty_keys_and_values() {
        assert!(matches!(
            parse_feed("id:IDS60901\n:13.3\n"),
            Err(AtmoError::InvalidFormat(_))
        ));
        assert!(matches!(
            parse_feed("id:IDS60901\nair_temp:\n"),
            Err(AtmoError::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_a_feed_without_an_id() {
        assert!(matches!(
            parse_feed("name:Adelaide\nair_temp:13.3\n"),
            Err(AtmoError::MissingId)
        ));
    }

    #[test]
    fn negative_and_float_values_become_numbers() {
        let record = parse_feed("id:IDS60901\nlat:-34.9\ndewpt:5.7\n").unwrap();
        assert_eq!(record.field("lat"), Some(&json!(-34.9)));
        assert_eq!(record.field("dewpt"), Some(&json!(5.7)));
    }
}
