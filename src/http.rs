// src/http.rs

use crate::adapter::{
    AdapterEvents, ByteCounter, DeltaReporter, ReportPolicy, TerminalOutcome, TransferAdapter, TransferStart,
};
use crate::error::TransferError;
use crate::models::TransferRequest;
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{header, Body, Client, StatusCode};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tuning for the streaming adapter.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Transient failures retried before the transfer errors out.
    pub retry_budget: usize,
    /// Base delay between retries; attempt `n` waits `n * retry_backoff`.
    pub retry_backoff: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub report: ReportPolicy,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            retry_backoff: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            user_agent: concat!("http-transfers/", env!("CARGO_PKG_VERSION")).into(),
            report: ReportPolicy::default(),
        }
    }
}

const RUN: u8 = 0;
const PAUSE: u8 = 1;
const CANCEL: u8 = 2;

/// Why a worker stopped before finishing.
enum Exit {
    Paused,
    Canceled,
    Failed(TransferError),
}

impl From<TransferError> for Exit {
    fn from(e: TransferError) -> Self {
        Exit::Failed(e)
    }
}

impl From<reqwest::Error> for Exit {
    fn from(e: reqwest::Error) -> Self {
        Exit::Failed(TransferError::Network(e))
    }
}

impl From<std::io::Error> for Exit {
    fn from(e: std::io::Error) -> Self {
        Exit::Failed(TransferError::Io(e))
    }
}

struct Task {
    request: TransferRequest,
    events: AdapterEvents,
    /// Bytes committed so far: written to disk, or handed to the upload body.
    offset: Arc<AtomicU64>,
    /// Set while a worker is running.
    worker: Option<Worker>,
    /// A resume arrived while the paused worker was still winding down.
    resume_pending: bool,
    generation: u64,
}

#[derive(Clone)]
struct Worker {
    token: CancellationToken,
    signal: Arc<AtomicU8>,
}

/// Streams transfers directly over HTTP with `reqwest`.
///
/// Downloads are written to `<path>.part` and renamed on completion, so a
/// paused or restored download resumes with a `Range` request. Uploads cannot
/// resume mid-body and restart from byte 0.
#[derive(Clone)]
pub struct HttpAdapter {
    client: Client,
    options: HttpOptions,
    tasks: Arc<Mutex<HashMap<String, Task>>>,
    next_generation: Arc<AtomicU64>,
}

impl HttpAdapter {
    pub fn new(options: HttpOptions) -> Result<Self, TransferError> {
        let client = Client::builder()
            .user_agent(options.user_agent.clone())
            .connect_timeout(options.connect_timeout)
            .build()?;
        Ok(Self {
            client,
            options,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(1)),
        })
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a worker for a registered task that has none.
    fn spawn_worker(&self, identifier: &str) {
        let mut tasks = self.tasks();
        let Some(task) = tasks.get_mut(identifier) else {
            return;
        };
        if let Some(worker) = &task.worker {
            if worker.signal.load(Ordering::SeqCst) == PAUSE {
                task.resume_pending = true;
            }
            return;
        }
        let worker = Worker {
            token: CancellationToken::new(),
            signal: Arc::new(AtomicU8::new(RUN)),
        };
        task.generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        task.worker = Some(worker.clone());

        let run = WorkerRun {
            adapter: self.clone(),
            request: task.request.clone(),
            events: task.events.clone(),
            offset: task.offset.clone(),
            worker,
            generation: task.generation,
        };
        tokio::spawn(run.run());
    }

    fn stop_worker(&self, identifier: &str, signal: u8) -> bool {
        let mut tasks = self.tasks();
        let Some(task) = tasks.get_mut(identifier) else {
            return false;
        };
        task.resume_pending = false;
        match &task.worker {
            Some(worker) => {
                // A pause never downgrades a cancel already in flight.
                if worker.signal.load(Ordering::SeqCst) != CANCEL {
                    worker.signal.store(signal, Ordering::SeqCst);
                }
                worker.token.cancel();
                true
            }
            None => false,
        }
    }
}

impl TransferAdapter for HttpAdapter {
    fn begin(&self, start: TransferStart, events: AdapterEvents) -> Result<(), TransferError> {
        let identifier = start.request.identifier.clone();
        {
            let mut tasks = self.tasks();
            if tasks.contains_key(&identifier) {
                return Err(TransferError::Adapter(format!("transfer {identifier} already running")));
            }
            tasks.insert(
                identifier.clone(),
                Task {
                    request: start.request,
                    events,
                    offset: Arc::new(AtomicU64::new(start.offset)),
                    worker: None,
                    resume_pending: false,
                    generation: 0,
                },
            );
        }
        self.spawn_worker(&identifier);
        Ok(())
    }

    fn pause(&self, identifier: &str) {
        if self.stop_worker(identifier, PAUSE) {
            debug!(identifier, "pausing http worker");
        }
    }

    fn resume(&self, identifier: &str) {
        self.spawn_worker(identifier);
    }

    fn cancel(&self, identifier: &str) {
        if self.stop_worker(identifier, CANCEL) {
            debug!(identifier, "canceling http worker");
            return;
        }
        // Paused or unknown: nothing is running, acknowledge right away.
        let Some(task) = self.tasks().remove(identifier) else {
            return;
        };
        if !task.request.is_upload() {
            let _ = std::fs::remove_file(temporary_path(&task.request.local_file_path));
        }
        task.events.finish(TerminalOutcome::Stopped);
    }
}

/// Everything one worker task owns.
struct WorkerRun {
    adapter: HttpAdapter,
    request: TransferRequest,
    events: AdapterEvents,
    offset: Arc<AtomicU64>,
    worker: Worker,
    generation: u64,
}

impl WorkerRun {
    async fn run(self) {
        let identifier = self.request.identifier.clone();
        let counter = ByteCounter::default();
        let reporter_stop = CancellationToken::new();
        let reporter = DeltaReporter::new(counter.clone(), self.events.clone(), self.adapter.options.report);
        let reporter_task = tokio::spawn(reporter.run(reporter_stop.clone()));

        let result = self.run_with_retries(&counter).await;

        reporter_stop.cancel();
        let _ = reporter_task.await;

        let finished = !matches!(result, Err(Exit::Paused));
        let mut restart = false;
        {
            let mut tasks = self.adapter.tasks();
            let current = tasks
                .get(&identifier)
                .is_some_and(|task| task.generation == self.generation);
            if current && finished {
                tasks.remove(&identifier);
            } else if let Some(task) = tasks.get_mut(&identifier).filter(|_| current) {
                task.worker = None;
                restart = std::mem::take(&mut task.resume_pending);
            }
        }
        if restart {
            self.adapter.spawn_worker(&identifier);
        }

        match result {
            Ok(()) => {
                info!(identifier = %identifier, "http transfer finished");
                self.events.finish(TerminalOutcome::Completed);
            }
            Err(Exit::Paused) => debug!(identifier = %identifier, "http worker paused"),
            Err(Exit::Canceled) => {
                if !self.request.is_upload() {
                    let _ = tokio::fs::remove_file(temporary_path(&self.request.local_file_path)).await;
                }
                self.events.finish(TerminalOutcome::Stopped);
            }
            Err(Exit::Failed(e)) => {
                warn!(identifier = %identifier, error = %e, "http transfer failed");
                self.events.finish(TerminalOutcome::Failed(e));
            }
        }
    }

    async fn run_with_retries(&self, counter: &ByteCounter) -> Result<(), Exit> {
        let mut attempts = 0;
        loop {
            let result = if self.request.is_upload() {
                self.upload_once(counter).await
            } else {
                self.download_once(counter).await
            };
            match result {
                Err(Exit::Failed(e)) if e.is_transient() && attempts < self.adapter.options.retry_budget => {
                    attempts += 1;
                    let delay = self.adapter.options.retry_backoff * attempts as u32;
                    warn!(
                        identifier = %self.request.identifier,
                        attempt = attempts,
                        error = %e,
                        "transient failure, retrying in {:?}",
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.worker.token.cancelled() => return Err(self.stop_reason()),
                    }
                }
                other => return other,
            }
        }
    }

    fn stop_reason(&self) -> Exit {
        match self.worker.signal.load(Ordering::SeqCst) {
            PAUSE => Exit::Paused,
            _ => Exit::Canceled,
        }
    }

    fn request_builder(&self) -> Result<reqwest::RequestBuilder, TransferError> {
        let mut builder = self.adapter.client.request(self.request.http_method()?, &self.request.uri);
        for (name, value) in &self.request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        Ok(builder)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, Exit> {
        tokio::select! {
            response = builder.send() => Ok(response?),
            _ = self.worker.token.cancelled() => Err(self.stop_reason()),
        }
    }

    async fn download_once(&self, counter: &ByteCounter) -> Result<(), Exit> {
        let destination = &self.request.local_file_path;
        let part_path = temporary_path(destination);
        let on_disk = match tokio::fs::metadata(&part_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let offset = self.offset.load(Ordering::SeqCst).min(on_disk);

        let mut builder = self.request_builder()?;
        if let Some(content) = &self.request.http_content {
            builder = builder
                .header(header::CONTENT_TYPE, content.mime())
                .body(content.content.clone());
        }
        if offset > 0 {
            builder = builder.header(header::RANGE, format!("bytes={offset}-"));
        }

        let response = self.send(builder).await?;
        let status = response.status();
        if offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
            // Everything was already on disk.
            tokio::fs::rename(&part_path, destination).await?;
            return Ok(());
        }
        if !status.is_success() {
            return Err(TransferError::HttpStatus(status.as_u16()).into());
        }

        let resuming = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let start = if resuming { offset } else { 0 };
        if offset > 0 && !resuming {
            debug!(identifier = %self.request.identifier, "server ignored range, restarting");
            counter.restart();
        }
        self.offset.store(start, Ordering::SeqCst);
        if let Some(remaining) = response.content_length() {
            counter.announce_total(start + remaining);
        }

        if let Some(parent) = part_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = if resuming {
            // The part file may hold bytes past the last reported offset.
            let mut file = OpenOptions::new().write(true).open(&part_path).await?;
            file.set_len(start).await?;
            file.seek(SeekFrom::Start(start)).await?;
            file
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&part_path)
                .await?
        };

        // The latest chunk is reported only once the next one arrives, so the
        // count never reaches the total before the file is in place.
        let mut held = 0u64;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = self.worker.token.cancelled() => {
                    file.flush().await?;
                    counter.add(held);
                    return Err(self.stop_reason());
                }
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk?;
            file.write_all(&bytes).await?;
            self.offset.fetch_add(bytes.len() as u64, Ordering::SeqCst);
            counter.add(held);
            held = bytes.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&part_path, destination).await?;
        counter.add(held);
        Ok(())
    }

    async fn upload_once(&self, counter: &ByteCounter) -> Result<(), Exit> {
        if self.offset.swap(0, Ordering::SeqCst) > 0 {
            counter.restart();
        }

        let path = &self.request.local_file_path;
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        counter.announce_total(length);

        // The last byte is reported only after the server accepts the upload.
        let cap = length.saturating_sub(1);
        let body_counter = counter.clone();
        let offset = self.offset.clone();
        let stream = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                let before = offset.fetch_add(bytes.len() as u64, Ordering::SeqCst);
                let after = before + bytes.len() as u64;
                body_counter.add(after.min(cap) - before.min(cap));
            }
            chunk
        });

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".into());
        let mut form = Form::new();
        if let Some(content) = &self.request.http_content {
            form = form.part("value", Part::text(content.content.clone()).mime_str(&content.mime())?);
        }
        form = form.part(
            "file",
            Part::stream_with_length(Body::wrap_stream(stream), length).file_name(file_name),
        );

        let response = self.send(self.request_builder()?.multipart(form)).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::HttpStatus(status.as_u16()).into());
        }
        let reported = self.offset.load(Ordering::SeqCst).min(cap);
        counter.add(length.saturating_sub(reported));
        Ok(())
    }
}

/// Where a download lives until it completes, e.g. `file.zip.part`.
pub fn temporary_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterEvent, StateHint};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// A status line, a body and any extra header lines.
    type Reply = (&'static str, Vec<u8>, String);

    /// Serves one canned HTTP response per connection, after reading the
    /// whole request.
    async fn serve(status_line: &'static str, body: Vec<u8>) -> String {
        serve_with(move |_| (status_line, body.clone(), String::new())).await
    }

    /// Answers `Range: bytes=N-` requests the way a resuming server does.
    async fn serve_ranged(body: Vec<u8>) -> String {
        serve_with(move |head| {
            let from = head
                .lines()
                .find_map(|line| line.strip_prefix("range: bytes="))
                .and_then(|range| range.trim().trim_end_matches('-').parse::<usize>().ok());
            match from {
                None => ("200 OK", body.clone(), String::new()),
                Some(from) if from >= body.len() => (
                    "416 Range Not Satisfiable",
                    Vec::new(),
                    format!("Content-Range: bytes */{}\r\n", body.len()),
                ),
                Some(from) => (
                    "206 Partial Content",
                    body[from..].to_vec(),
                    format!("Content-Range: bytes {from}-{}/{}\r\n", body.len() - 1, body.len()),
                ),
            }
        })
        .await
    }

    /// Serves the reply `respond` builds from the lowercased request head.
    async fn serve_with<F>(respond: F) -> String
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let respond = Arc::new(respond);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let respond = Arc::clone(&respond);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let mut seen = Vec::new();
                    let head_end = loop {
                        if let Some(pos) = seen.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        seen.extend_from_slice(&buf[..n]);
                    };
                    let head = String::from_utf8_lossy(&seen[..head_end]).to_ascii_lowercase();
                    let content_length = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok());
                    let chunked = head.contains("transfer-encoding: chunked");
                    loop {
                        let received = &seen[head_end..];
                        let done = match content_length {
                            Some(len) => received.len() >= len,
                            None if chunked => received.ends_with(b"0\r\n\r\n"),
                            None => true,
                        };
                        if done {
                            break;
                        }
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        seen.extend_from_slice(&buf[..n]);
                    }

                    let (status_line, body, extra) = respond(&head);
                    let reply = format!(
                        "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\n{extra}Connection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(reply.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/file.bin")
    }

    async fn collect(rx: mpsc::UnboundedReceiver<AdapterEvent>) -> (u64, Option<u64>, TerminalOutcome) {
        let (_, moved, total, outcome) = collect_hints(rx).await;
        (moved, total, outcome)
    }

    /// Like `collect`, keeping the hints. A restart zeroes the moved count.
    async fn collect_hints(
        mut rx: mpsc::UnboundedReceiver<AdapterEvent>,
    ) -> (Vec<StateHint>, u64, Option<u64>, TerminalOutcome) {
        let mut hints = Vec::new();
        let mut moved = 0;
        let mut total = None;
        while let Some(event) = rx.recv().await {
            match event {
                AdapterEvent::BytesDelta { bytes, total: t } => {
                    moved += bytes;
                    total = t.or(total);
                }
                AdapterEvent::StateHint(hint) => {
                    if hint == StateHint::Restarted {
                        moved = 0;
                    }
                    hints.push(hint);
                }
                AdapterEvent::Handle(_) => {}
                AdapterEvent::Terminal(outcome) => return (hints, moved, total, outcome),
            }
        }
        panic!("event stream ended without a terminal outcome");
    }

    fn payload() -> Vec<u8> {
        (0..1_000u32).map(|i| (i % 251) as u8).collect()
    }

    fn fast_options() -> HttpOptions {
        HttpOptions {
            retry_budget: 0,
            report: ReportPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
            ..HttpOptions::default()
        }
    }

    #[tokio::test]
    async fn downloads_to_destination() {
        let body: Vec<u8> = (0..1_000u32).map(|i| (i % 251) as u8).collect();
        let uri = serve("200 OK", body.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");

        let adapter = HttpAdapter::new(fast_options()).unwrap();
        let (events, rx) = AdapterEvents::channel();
        let request = TransferRequest::download("dl", uri, &dest);
        adapter.begin(TransferStart::new(request, 0), events).unwrap();

        let (moved, total, outcome) = collect(rx).await;
        assert!(matches!(outcome, TerminalOutcome::Completed));
        assert_eq!(moved, 1_000);
        assert_eq!(total, Some(1_000));
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
        assert!(!temporary_path(&dest).exists());
    }

    #[tokio::test]
    async fn resumes_from_the_reported_offset() {
        let body = payload();
        let uri = serve_ranged(body.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("resume.bin");
        // Bytes past the reported offset were written but never counted.
        let mut partial = body[..600].to_vec();
        partial.extend_from_slice(&[0xAA; 100]);
        tokio::fs::write(temporary_path(&dest), &partial).await.unwrap();

        let adapter = HttpAdapter::new(fast_options()).unwrap();
        let (events, rx) = AdapterEvents::channel();
        let request = TransferRequest::download("resume", uri, &dest);
        adapter.begin(TransferStart::new(request, 600), events).unwrap();

        let (hints, moved, total, outcome) = collect_hints(rx).await;
        assert!(matches!(outcome, TerminalOutcome::Completed));
        assert!(!hints.contains(&StateHint::Restarted));
        assert_eq!(moved, 400);
        assert_eq!(total, Some(1_000));
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
        assert!(!temporary_path(&dest).exists());
    }

    #[tokio::test]
    async fn unsatisfiable_range_means_already_complete() {
        let body = payload();
        let uri = serve_ranged(body.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("whole.bin");
        tokio::fs::write(temporary_path(&dest), &body).await.unwrap();

        let adapter = HttpAdapter::new(fast_options()).unwrap();
        let (events, rx) = AdapterEvents::channel();
        let request = TransferRequest::download("whole", uri, &dest);
        adapter.begin(TransferStart::new(request, 1_000), events).unwrap();

        let (moved, _, outcome) = collect(rx).await;
        assert!(matches!(outcome, TerminalOutcome::Completed));
        assert_eq!(moved, 0);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
        assert!(!temporary_path(&dest).exists());
    }

    #[tokio::test]
    async fn ignored_range_restarts_from_zero() {
        let body = payload();
        let uri = serve("200 OK", body.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("again.bin");
        tokio::fs::write(temporary_path(&dest), &body[..600]).await.unwrap();

        let adapter = HttpAdapter::new(fast_options()).unwrap();
        let (events, rx) = AdapterEvents::channel();
        let request = TransferRequest::download("again", uri, &dest);
        adapter.begin(TransferStart::new(request, 600), events).unwrap();

        let (hints, moved, total, outcome) = collect_hints(rx).await;
        assert!(matches!(outcome, TerminalOutcome::Completed));
        assert!(hints.contains(&StateHint::Restarted));
        assert_eq!(moved, 1_000);
        assert_eq!(total, Some(1_000));
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
    }

    #[tokio::test]
    async fn server_error_status_fails_without_retry() {
        let uri = serve("404 Not Found", b"missing".to_vec()).await;
        let dir = tempfile::tempdir().unwrap();

        let adapter = HttpAdapter::new(HttpOptions { retry_budget: 5, ..fast_options() }).unwrap();
        let (events, rx) = AdapterEvents::channel();
        let request = TransferRequest::download("nf", uri, dir.path().join("nf.bin"));
        adapter.begin(TransferStart::new(request, 0), events).unwrap();

        let (_, _, outcome) = collect(rx).await;
        assert!(matches!(outcome, TerminalOutcome::Failed(TransferError::HttpStatus(404))));
    }

    #[tokio::test]
    async fn uploads_file_as_multipart() {
        let uri = serve("200 OK", b"ok".to_vec()).await;
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("up.txt");
        tokio::fs::write(&src, vec![7u8; 4_096]).await.unwrap();

        let adapter = HttpAdapter::new(fast_options()).unwrap();
        let (events, rx) = AdapterEvents::channel();
        let request = TransferRequest::upload("up", uri, &src).with_content(crate::models::TransferHttpContent::new("meta"));
        adapter.begin(TransferStart::new(request, 0), events).unwrap();

        let (moved, total, outcome) = collect(rx).await;
        assert!(matches!(outcome, TerminalOutcome::Completed));
        assert_eq!(total, Some(4_096));
        assert_eq!(moved, 4_096);
    }

    #[tokio::test]
    async fn missing_upload_file_is_an_io_failure() {
        let adapter = HttpAdapter::new(fast_options()).unwrap();
        let (events, rx) = AdapterEvents::channel();
        let request = TransferRequest::upload("gone", "http://127.0.0.1:9/upload", "/definitely/not/here.bin");
        adapter.begin(TransferStart::new(request, 0), events).unwrap();

        let (_, _, outcome) = collect(rx).await;
        assert!(matches!(outcome, TerminalOutcome::Failed(TransferError::Io(_))));
    }

    #[tokio::test]
    async fn cancel_of_paused_transfer_acknowledges_immediately() {
        let adapter = HttpAdapter::new(fast_options()).unwrap();
        let (events, mut rx) = AdapterEvents::channel();
        adapter.tasks().insert(
            "idle".into(),
            Task {
                request: TransferRequest::download("idle", "http://127.0.0.1:9/x", "/tmp/x"),
                events,
                offset: Arc::new(AtomicU64::new(0)),
                worker: None,
                resume_pending: false,
                generation: 0,
            },
        );

        adapter.cancel("idle");
        assert!(matches!(rx.recv().await, Some(AdapterEvent::Terminal(TerminalOutcome::Stopped))));
        assert!(adapter.tasks().is_empty());
    }

    #[test]
    fn temporary_path_appends_suffix() {
        assert_eq!(temporary_path(Path::new("/d/file.zip")), PathBuf::from("/d/file.zip.part"));
    }
}
