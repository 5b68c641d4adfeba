use crate::clock::{now_ms, LamportClock};
use crate::http::{self, Request, Response, Status, WEATHER_ENDPOINT};
use crate::observation::Observation;
use crate::store::{ObservationStore, PutOutcome};
use crate::thread_pool::{SharedQueueThreadPool, ThreadPool};
use crate::{AtmoError, Result};
use crossbeam::channel::{bounded, tick, Sender};
use crossbeam::select;
use std::io::{self, BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// default TCP port of the aggregation server
pub const DEFAULT_PORT: u16 = 4567;
/// default snapshot file, relative to the server's working directory
pub const DEFAULT_SNAPSHOT_FILE: &str = "weatherInfo.json";

// service constants; ServerConfig carries them so tests can tighten the timings
const MAX_STATIONS: usize = 20;
const ENTRY_TTL: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const WORKER_THREADS: u32 = 5;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

// how often the accept loop polls the running flag while no client connects
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Settings for an [`AggregationServer`]. `Default` matches the service
/// constants: port 4567, at most 20 stations, 30 s TTL, 5 s sweep interval,
/// 5 workers, 5 s socket read timeout.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// address the listener binds; port 0 picks an ephemeral port
    pub addr: SocketAddr,
    /// where the store snapshot lives
    pub snapshot_path: PathBuf,
    /// capacity bound K of the observation store
    pub max_stations: usize,
    /// lifetime T of an entry since its last accepted PUT
    pub entry_ttl: Duration,
    /// period of the background eviction sweeper
    pub sweep_interval: Duration,
    /// number of connection-handling worker threads
    pub workers: u32,
    /// per-socket read timeout
    pub read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_FILE),
            max_stations: MAX_STATIONS,
            entry_ttl: ENTRY_TTL,
            sweep_interval: SWEEP_INTERVAL,
            workers: WORKER_THREADS,
            read_timeout: READ_TIMEOUT,
        }
    }
}

// state shared between the accept loop, the workers and the sweeper
struct Inner {
    clock: LamportClock,
    store: Mutex<ObservationStore>,
    running: AtomicBool,
}

impl Inner {
    fn store(&self) -> Result<MutexGuard<'_, ObservationStore>> {
        self.store
            .lock()
            .map_err(|_| AtmoError::Locking("observation store mutex poisoned".to_string()))
    }
}

/// The aggregation server: one TCP listener whose connections are dispatched
/// to a fixed worker pool, a single bounded observation store, and a
/// background sweeper that evicts expired entries every sweep interval.
///
/// A server value starts out created-but-idle; [`start`](Self::start) binds
/// the listener, spawns the accept and sweeper threads and hands back a
/// [`ServerHandle`] for the running phase. It owns its store and snapshot
/// file exclusively.
pub struct AggregationServer {
    config: ServerConfig,
    inner: Arc<Inner>,
}

impl AggregationServer {
    /// creates a server with the given config, restoring the store from the
    /// snapshot file if one exists
    ///
    /// # Errors
    /// returns [`AtmoError::Io`] if an existing snapshot file is unreadable
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store = ObservationStore::open(
            &config.snapshot_path,
            config.max_stations,
            config.entry_ttl.as_millis() as u64,
        )?;
        Ok(AggregationServer {
            config,
            inner: Arc::new(Inner {
                clock: LamportClock::new(),
                store: Mutex::new(store),
                running: AtomicBool::new(false),
            }),
        })
    }

    /// Binds the listener and starts serving.
    ///
    /// The listener is bound before this returns, so the returned handle is
    /// the readiness signal: a caller holding a [`ServerHandle`] can connect
    /// immediately (tests use [`ServerHandle::addr`] for the bound port).
    ///
    /// # Errors
    /// returns [`AtmoError::Io`] if the address cannot be bound or the worker
    /// threads cannot be created
    pub fn start(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(self.config.addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let pool = SharedQueueThreadPool::new(self.config.workers)?;
        self.inner.running.store(true, Ordering::SeqCst);
        info!(%addr, "server started");

        let accept_inner = Arc::clone(&self.inner);
        let read_timeout = self.config.read_timeout;
        let accept_thread = thread::Builder::new()
            .name("atmo-accept".to_string())
            .spawn(move || accept_loop(listener, pool, accept_inner, read_timeout))?;

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let sweeper_inner = Arc::clone(&self.inner);
        let sweep_interval = self.config.sweep_interval;
        let sweeper_thread = thread::Builder::new()
            .name("atmo-sweeper".to_string())
            .spawn(move || {
                let ticker = tick(sweep_interval);
                loop {
                    select! {
                        recv(ticker) -> _ => sweep(&sweeper_inner),
                        recv(shutdown_rx) -> _ => {
                            debug!("sweeper exiting");
                            break;
                        }
                    }
                }
            })?;

        Ok(ServerHandle {
            addr,
            inner: self.inner,
            shutdown_tx,
            accept_thread: Some(accept_thread),
            sweeper_thread: Some(sweeper_thread),
        })
    }
}

/// Handle to a running [`AggregationServer`].
///
/// Dropping the handle leaves the server running detached;
/// [`stop`](Self::stop) shuts it down cooperatively and flushes the snapshot
/// one final time.
pub struct ServerHandle {
    addr: SocketAddr,
    inner: Arc<Inner>,
    shutdown_tx: Sender<()>,
    accept_thread: Option<JoinHandle<()>>,
    sweeper_thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// the address the listener is bound to
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// true while the accept loop is serving
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stops the server: closes the listener, drains the worker pool, stops
    /// the sweeper, then takes a final eviction pass and snapshot flush.
    ///
    /// # Errors
    /// returns [`AtmoError::Io`] if the final snapshot flush fails
    pub fn stop(mut self) -> Result<()> {
        info!("stopping server");
        self.inner.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.sweeper_thread.take() {
            let _ = handle.join();
        }

        let mut store = self.inner.store()?;
        store.expire(now_ms());
        store.flush()?;
        info!("server stopped");
        Ok(())
    }

    /// blocks the calling thread until the accept loop exits; used by the
    /// server binary to run until the process is killed
    pub fn join(mut self) -> Result<()> {
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

// one TTL pass under the store lock; evictions are made durable immediately
fn sweep(inner: &Inner) {
    match inner.store() {
        Ok(mut store) => {
            let evicted = store.expire(now_ms());
            if !evicted.is_empty() {
                if let Err(e) = store.flush() {
                    error!("failed to flush snapshot after sweep: {:?}", e);
                }
            }
        }
        Err(e) => error!("sweeper could not lock the store: {:?}", e),
    }
}

// polls the non-blocking listener while the running flag is set, handing each
// accepted connection to the worker pool
fn accept_loop(
    listener: TcpListener,
    pool: SharedQueueThreadPool,
    inner: Arc<Inner>,
    read_timeout: Duration,
) {
    while inner.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                if let Err(e) = prepare_stream(&stream, read_timeout) {
                    warn!(%peer, "could not configure connection: {}", e);
                    continue;
                }
                let inner = Arc::clone(&inner);
                pool.spawn(move || handle_connection(&inner, stream));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                if inner.running.load(Ordering::SeqCst) {
                    warn!("error accepting connection: {}", e);
                }
            }
        }
    }
    debug!("accept loop exiting");
}

fn prepare_stream(stream: &TcpStream, read_timeout: Duration) -> io::Result<()> {
    // accepted sockets inherit the listener's non-blocking mode on some platforms
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(read_timeout))?;
    Ok(())
}

// a failure here never crosses the connection boundary: protocol problems
// become status codes and transport problems just drop the connection
fn handle_connection(inner: &Inner, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    if let Err(e) = serve(inner, stream) {
        warn!(peer = %peer, "error handling connection: {:?}", e);
    }
}

fn serve(inner: &Inner, stream: TcpStream) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    let response = match http::read_request(&mut reader) {
        Ok(request) => {
            debug!(method = %request.method, target = %request.target, "received request");
            match dispatch(inner, &request) {
                Ok(response) => response,
                Err(e) => {
                    error!("error processing request: {:?}", e);
                    build_response(
                        inner,
                        Status::InternalServerError,
                        format!("Error processing request: {}", e),
                    )
                }
            }
        }
        Err(e @ AtmoError::Protocol(_)) | Err(e @ AtmoError::Utf8(_)) => {
            warn!("bad request: {}", e);
            build_response(inner, Status::BadRequest, "Invalid request format".to_string())
        }
        // transport failure before a full request arrived, nothing to answer
        Err(e) => return Err(e),
    };

    response.write(&mut writer)
}

fn dispatch(inner: &Inner, request: &Request) -> Result<Response> {
    match request.method.as_str() {
        "GET" if request.target.starts_with(WEATHER_ENDPOINT) => {
            handle_get(inner, &request.target)
        }
        "PUT" if request.target == WEATHER_ENDPOINT => handle_put(inner, request),
        _ => {
            warn!(method = %request.method, target = %request.target, "rejecting request");
            Ok(build_response(
                inner,
                Status::BadRequest,
                "Invalid request".to_string(),
            ))
        }
    }
}

fn handle_get(inner: &Inner, target: &str) -> Result<Response> {
    inner.clock.tick(); // local event: begin handling
    let now = now_ms();

    let mut store = inner.store()?;
    let evicted = store.expire(now);
    if !evicted.is_empty() {
        store.flush()?;
    }

    let response = match target.splitn(2, "?id=").nth(1) {
        Some(station) => match store.get_one(station, now) {
            Some(observation) => build_response(inner, Status::Ok, observation.to_json()),
            None => build_response(
                inner,
                Status::NotFound,
                format!("No weather data available for station: {}", station),
            ),
        },
        None => {
            let live = store.get_all(now);
            if live.is_empty() {
                build_response(inner, Status::NotFound, String::new())
            } else {
                build_response(inner, Status::Ok, serde_json::to_string(&live)?)
            }
        }
    };
    Ok(response)
}

fn handle_put(inner: &Inner, request: &Request) -> Result<Response> {
    let body = request.body.trim();
    if body.is_empty() {
        // an empty PUT is a local event only: no observe, no store mutation,
        // no snapshot flush; the response tick is the increment
        debug!("no content in PUT request");
        return Ok(build_response(inner, Status::NoContent, String::new()));
    }

    inner.clock.observe(request.lamport.unwrap_or(0));

    let observation = match Observation::from_json(body) {
        Ok(observation) => observation,
        Err(e) => {
            warn!("unparsable PUT body: {}", e);
            return Ok(build_response(
                inner,
                Status::InternalServerError,
                format!("Error processing request: {}", e),
            ));
        }
    };
    if observation.station_id().is_none() {
        warn!("PUT body has no usable station id");
        return Ok(build_response(
            inner,
            Status::BadRequest,
            "Missing required field: id".to_string(),
        ));
    }

    let mut store = inner.store()?;
    let outcome = store.put_or_replace(observation, now_ms())?;
    // snapshot-before-ack: durable before the publisher sees success
    store.flush()?;

    let response = match outcome {
        PutOutcome::Created { evicted } => {
            if let Some(station) = evicted {
                debug!(%station, "evicted oldest station to admit a new one");
            }
            build_response(inner, Status::Created, "Data created successfully".to_string())
        }
        PutOutcome::Updated => {
            build_response(inner, Status::Ok, "Data updated successfully".to_string())
        }
    };
    Ok(response)
}

// every response is stamped from a fresh tick taken while assembling it
fn build_response(inner: &Inner, status: Status, body: String) -> Response {
    Response {
        status,
        lamport: inner.clock.tick(),
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_inner(dir: &tempfile::TempDir) -> Inner {
        let store = ObservationStore::open(dir.path().join("weatherInfo.json"), 20, 30_000)
            .unwrap();
        Inner {
            clock: LamportClock::new(),
            store: Mutex::new(store),
            running: AtomicBool::new(true),
        }
    }

    fn put_request(body: &str, lamport: Option<u64>) -> Request {
        Request {
            method: "PUT".to_string(),
            target: WEATHER_ENDPOINT.to_string(),
            lamport,
            body: body.to_string(),
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let inner = test_inner(&dir);

        let body = r#"{"air_temp":13.3,"id":"IDS60901","name":"Adelaide"}"#;
        let put = handle_put(&inner, &put_request(body, Some(0))).unwrap();
        assert_eq!(put.status, Status::Created);

        let get = handle_get(&inner, "/weatherInfo.json?id=IDS60901").unwrap();
        assert_eq!(get.status, Status::Ok);
        assert_eq!(get.body, body);
    }

    #[test]
    fn second_put_for_a_station_is_an_update() {
        let dir = tempfile::tempdir().unwrap();
        let inner = test_inner(&dir);

        let first = handle_put(&inner, &put_request(r#"{"id":"IDS60901"}"#, None)).unwrap();
        let second =
            handle_put(&inner, &put_request(r#"{"id":"IDS60901","air_temp":9.5}"#, None))
                .unwrap();
        assert_eq!(first.status, Status::Created);
        assert_eq!(second.status, Status::Ok);

        let get = handle_get(&inner, "/weatherInfo.json?id=IDS60901").unwrap();
        assert!(get.body.contains("9.5"));
    }

    #[test]
    fn put_observes_the_client_clock() {
        let dir = tempfile::tempdir().unwrap();
        let inner = test_inner(&dir);

        // observe(100) then one response tick
        let response = handle_put(&inner, &put_request(r#"{"id":"IDS60901"}"#, Some(100)))
            .unwrap();
        assert_eq!(response.lamport, 102);
    }

    #[test]
    fn empty_put_is_a_single_local_event() {
        let dir = tempfile::tempdir().unwrap();
        let inner = test_inner(&dir);

        let response = handle_put(&inner, &put_request("   ", Some(500))).unwrap();
        assert_eq!(response.status, Status::NoContent);
        // the remote clock was not observed
        assert_eq!(response.lamport, 1);
        assert!(inner.store().unwrap().is_empty());
    }

    #[test]
    fn missing_id_is_a_semantic_failure() {
        let dir = tempfile::tempdir().unwrap();
        let inner = test_inner(&dir);

        let response = handle_put(&inner, &put_request(r#"{"air_temp":13.3}"#, None)).unwrap();
        assert_eq!(response.status, Status::BadRequest);
        assert!(inner.store().unwrap().is_empty());
    }

    #[test]
    fn malformed_body_is_a_parse_failure() {
        let dir = tempfile::tempdir().unwrap();
        let inner = test_inner(&dir);

        let response =
            handle_put(&inner, &put_request(r#"{"id":"IDS60901","air_temp":}"#, None)).unwrap();
        assert_eq!(response.status, Status::InternalServerError);

        let response = handle_put(&inner, &put_request("[1,2,3]", None)).unwrap();
        assert_eq!(response.status, Status::InternalServerError);
        assert!(inner.store().unwrap().is_empty());
    }

    #[test]
    fn get_on_empty_store_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let inner = test_inner(&dir);

        let response = handle_get(&inner, "/weatherInfo.json").unwrap();
        assert_eq!(response.status, Status::NotFound);
        assert!(response.body.is_empty());
    }

    #[test]
    fn get_unknown_station_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let inner = test_inner(&dir);
        handle_put(&inner, &put_request(r#"{"id":"IDS60901"}"#, None)).unwrap();

        let response = handle_get(&inner, "/weatherInfo.json?id=NOPE").unwrap();
        assert_eq!(response.status, Status::NotFound);
    }

    #[test]
    fn unknown_method_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let inner = test_inner(&dir);

        let request = Request {
            method: "POST".to_string(),
            target: WEATHER_ENDPOINT.to_string(),
            lamport: None,
            body: String::new(),
        };
        let response = dispatch(&inner, &request).unwrap();
        assert_eq!(response.status, Status::BadRequest);
    }

    #[test]
    fn get_returns_an_array_of_all_live_observations() {
        let dir = tempfile::tempdir().unwrap();
        let inner = test_inner(&dir);
        handle_put(&inner, &put_request(r#"{"id":"IDS60901"}"#, None)).unwrap();
        handle_put(&inner, &put_request(r#"{"id":"IDS60902"}"#, None)).unwrap();

        let response = handle_get(&inner, "/weatherInfo.json").unwrap();
        assert_eq!(response.status, Status::Ok);
        let parsed: Vec<Observation> = serde_json::from_str(&response.body).unwrap();
        assert_eq!(parsed.len(), 2);
    }
}
