use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::entry::{CacheEntry, ENTRY_BODY, ENTRY_COUNT, ENTRY_METADATA};
use crate::fs::{FileSystem, StdFileSystem};
use crate::http::{self, Body, Headers, Method, Protocol, Request, Response};
use crate::key;
use crate::policy::{self, Verdict};
use crate::log_debug;
use crate::store::{DiskStore, Editor, EditorSink, Snapshots};
use crate::time;
use crate::Result;

/// Bumped when the on-disk entry layout changes; a mismatch discards the
/// whole cache on the next open.
const SCHEMA_VERSION: u32 = 1;

/// How long to keep draining an abandoned network body into the cache
/// before giving up on the entry.
const DISCARD_STREAM_TIMEOUT: Duration = Duration::from_millis(100);

/// The transport this cache sits in front of. Implementors perform the
/// actual network call; the cache decides when one is needed.
pub trait Backend {
    fn execute(&self, request: &Request) -> Result<Response>;
}

#[derive(Clone, Copy, Debug, Default)]
struct Stats {
    request_count: u64,
    network_count: u64,
    hit_count: u64,
    write_success_count: u64,
    write_abort_count: u64,
}

/// Caches HTTP and HTTPS responses to the filesystem so they can be reused.
///
/// Three statistics measure effectiveness: the number of requests seen, the
/// number that needed the network, and the number answered by the cache. A
/// conditional revalidation answered with 304 counts towards both network
/// and hits.
///
/// To force a network response add the `no-cache` request directive; to
/// restrict a request to the cache add `only-if-cached` (see
/// [`crate::control::CacheControl::force_network`] and
/// [`crate::control::CacheControl::force_cache`]). A cache malfunction is
/// never surfaced: every failure path degrades to a miss or a refused
/// write.
pub struct HttpCache {
    store: DiskStore,
    stats: Arc<Mutex<Stats>>,
}

impl HttpCache {
    pub fn new<P: AsRef<Path>>(directory: P, max_size: u64) -> Self {
        Self::with_file_system(Arc::new(StdFileSystem), directory, max_size)
    }

    pub fn with_file_system<P: AsRef<Path>>(
        fs: Arc<dyn FileSystem>,
        directory: P,
        max_size: u64,
    ) -> Self {
        HttpCache {
            store: DiskStore::create(fs, directory, SCHEMA_VERSION, ENTRY_COUNT, max_size),
            stats: Arc::new(Mutex::new(Stats::default())),
        }
    }

    /// The stored response for `request`, if one exists, decodes, and its
    /// vary headers still match. Anything else is a miss.
    pub fn get(&self, request: &Request) -> Option<Response> {
        let cache_key = key::cache_key(request.url());
        let mut snapshot = match self.store.get(&cache_key) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(err) => {
                log_debug!("cache read failed for {}: {err}", request.url());
                return None;
            }
        };
        let metadata = snapshot.take_source(ENTRY_METADATA)?;
        let entry = match CacheEntry::read(metadata) {
            Ok(entry) => entry,
            Err(err) => {
                log_debug!("dropping undecodable cache entry: {err}");
                return None;
            }
        };
        if !entry.matches(request) {
            return None;
        }
        entry.into_response(snapshot).ok()
    }

    /// Start storing `response`. Returns a writer for the body bytes, or
    /// None when the response is not cacheable here: the method invalidates
    /// (which also evicts the stored entry), is not GET, or the response
    /// varies on everything.
    pub fn put(&self, response: &Response) -> Option<CacheWriter> {
        let request = response.request();

        if request.method().invalidates_cache() {
            let _ = self.remove(request);
            return None;
        }
        if request.method() != Method::GET {
            // Technically HEAD and some POST responses are cacheable too,
            // but the complexity is high and the benefit low.
            return None;
        }
        if http::has_vary_all(response.headers()) {
            return None;
        }

        let entry = CacheEntry::from_response(response);
        let mut editor = match self.store.edit(&key::cache_key(request.url())) {
            Ok(Some(editor)) => editor,
            _ => return None,
        };
        let written = editor
            .new_sink(ENTRY_METADATA)
            .and_then(|sink| entry.write_to(sink));
        if written.is_err() {
            editor.abort_unless_committed();
            return None;
        }
        let body_sink = match editor.new_sink(ENTRY_BODY) {
            Ok(sink) => sink,
            Err(_) => {
                editor.abort_unless_committed();
                return None;
            }
        };
        Some(CacheWriter {
            editor,
            body: Some(io::BufWriter::new(body_sink)),
            stats: Arc::clone(&self.stats),
            done: false,
        })
    }

    pub fn remove(&self, request: &Request) -> Result<bool> {
        self.store.remove(&key::cache_key(request.url()))
    }

    /// After a conditional hit, merge the 304's headers into the stored
    /// metadata and rewrite only the metadata slot. The edit is pinned to
    /// the snapshot `cached` was served from, so a concurrent writer is
    /// never clobbered. Failures leave the old entry in place.
    pub fn update(&self, cached: &Response, network: &Response) {
        let Some(sequence) = cached.snapshot_sequence() else {
            return;
        };
        let mut merged = cached.strip_body();
        merged.set_headers(combine(cached.headers(), network.headers()));
        merged.set_sent_request_at(network.sent_request_at());
        merged.set_received_response_at(network.received_response_at());
        let entry = CacheEntry::from_response(&merged);

        let cache_key = key::cache_key(cached.request().url());
        let mut editor = match self.store.edit_at(&cache_key, Some(sequence)) {
            Ok(Some(editor)) => editor,
            _ => return,
        };
        let result = editor
            .new_sink(ENTRY_METADATA)
            .and_then(|sink| entry.write_to(sink))
            .and_then(|_| editor.commit());
        if let Err(err) = result {
            log_debug!("cache update failed: {err}");
            editor.abort_unless_committed();
        }
    }

    /// Serve `request` through the cache: straight from disk when fresh,
    /// revalidating or fetching over `backend` otherwise, and streaming any
    /// cacheable network body into the store as the caller reads it. A
    /// forbidden network (`only-if-cached`) with an insufficient cache
    /// yields a synthetic 504.
    pub fn intercept<B: Backend>(&self, request: &Request, backend: &B) -> Result<Response> {
        let cache_candidate = self.get(request);
        let now = time::now_epoch_milliseconds();
        let verdict = policy::evaluate(now, request, cache_candidate);
        self.track_response(&verdict);
        let Verdict {
            network_request,
            cache_response,
        } = verdict;

        let Some(network_request) = network_request else {
            return match cache_response {
                Some(response) => Ok(response),
                None => Ok(Response::builder()
                    .request(request.clone())
                    .protocol(Protocol::Http11)
                    .status(504)
                    .message("Unsatisfiable Request (only-if-cached)")
                    .body(Body::empty())
                    .received_response_at(time::now_epoch_milliseconds())
                    .build()?),
            };
        };

        let network_response = backend.execute(&network_request)?;

        if let Some(cached) = cache_response {
            if network_response.status() == 304 {
                let merged_headers = combine(cached.headers(), network_response.headers());
                self.track_conditional_cache_hit();
                self.update(&cached, &network_response);
                let mut merged = cached;
                merged.set_headers(merged_headers);
                merged.set_sent_request_at(network_response.sent_request_at());
                merged.set_received_response_at(network_response.received_response_at());
                return Ok(merged);
            }
            // The candidate lost the race; dropping it closes its snapshot.
        }

        if network_response.has_body() && policy::is_cacheable(&network_response, &network_request)
        {
            let writer = self.put(&network_response);
            return Ok(cache_writing_response(writer, network_response));
        }

        if network_request.method().invalidates_cache() {
            let _ = self.remove(&network_request);
        }

        Ok(network_response)
    }

    /// Iterator over the URLs currently stored. Supports removal through
    /// [`Urls::remove_current`] to evict selected responses.
    pub fn urls(&self) -> Result<Urls> {
        Ok(Urls {
            snapshots: self.store.snapshots()?,
        })
    }

    pub fn initialize(&self) -> Result<()> {
        self.store.initialize()
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.store.close()
    }

    /// Close and delete everything in the cache directory.
    pub fn delete(&self) -> Result<()> {
        self.store.delete()
    }

    pub fn evict_all(&self) -> Result<()> {
        self.store.evict_all()
    }

    pub fn size(&self) -> Result<u64> {
        self.store.size()
    }

    pub fn max_size(&self) -> u64 {
        self.store.max_size()
    }

    pub fn directory(&self) -> &Path {
        self.store.directory()
    }

    pub fn is_closed(&self) -> bool {
        self.store.is_closed()
    }

    pub fn track_response(&self, verdict: &Verdict) {
        let mut stats = self.stats.lock().unwrap();
        stats.request_count += 1;
        if verdict.network_request.is_some() {
            // A conditional request bumps the hit count if/when the 304
            // lands.
            stats.network_count += 1;
        } else if verdict.cache_response.is_some() {
            stats.hit_count += 1;
        }
    }

    pub fn track_conditional_cache_hit(&self) {
        self.stats.lock().unwrap().hit_count += 1;
    }

    pub fn request_count(&self) -> u64 {
        self.stats.lock().unwrap().request_count
    }

    pub fn network_count(&self) -> u64 {
        self.stats.lock().unwrap().network_count
    }

    pub fn hit_count(&self) -> u64 {
        self.stats.lock().unwrap().hit_count
    }

    pub fn write_success_count(&self) -> u64 {
        self.stats.lock().unwrap().write_success_count
    }

    pub fn write_abort_count(&self) -> u64 {
        self.stats.lock().unwrap().write_abort_count
    }
}

/// Combine cached and network headers per the 304 rules: 100-level warnings
/// are dropped, content-specific headers always come from the cached copy,
/// and other end-to-end headers prefer the network's newer values.
fn combine(cached: &Headers, network: &Headers) -> Headers {
    let mut result = Headers::new();
    for (name, value) in cached.iter() {
        if name.eq_ignore_ascii_case("Warning") && value.starts_with('1') {
            continue;
        }
        if is_content_specific(name) || !is_end_to_end(name) || network.get(name).is_none() {
            result.add(name.clone(), value.clone());
        }
    }
    for (name, value) in network.iter() {
        if !is_content_specific(name) && is_end_to_end(name) {
            result.add(name.clone(), value.clone());
        }
    }
    result
}

fn is_end_to_end(name: &str) -> bool {
    const HOP_BY_HOP: [&str; 9] = [
        "Connection",
        "Keep-Alive",
        "Proxy-Authenticate",
        "Proxy-Authorization",
        "TE",
        "Trailer",
        "Trailers",
        "Transfer-Encoding",
        "Upgrade",
    ];
    !HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

fn is_content_specific(name: &str) -> bool {
    name.eq_ignore_ascii_case("Content-Length")
        || name.eq_ignore_ascii_case("Content-Encoding")
        || name.eq_ignore_ascii_case("Content-Type")
}

/// Replace the response body with a tee that copies every chunk into the
/// cache writer as the caller consumes it.
fn cache_writing_response(writer: Option<CacheWriter>, mut response: Response) -> Response {
    let Some(writer) = writer else {
        return response;
    };
    let source = response.take_body().unwrap_or_default();
    let content_length = source.content_length();
    let tee = CacheWritingBody {
        source,
        writer: Some(writer),
    };
    response.set_body(Body::from_reader(Box::new(tee), content_length));
    response
}

/// Open write handle for one entry's body, produced by [`HttpCache::put`].
/// Either [`CacheWriter::commit`] or [`CacheWriter::abort`] finishes it;
/// dropping an unfinished writer aborts.
pub struct CacheWriter {
    editor: Editor,
    body: Option<io::BufWriter<EditorSink>>,
    stats: Arc<Mutex<Stats>>,
    done: bool,
}

impl CacheWriter {
    pub fn commit(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        if let Ok(mut stats) = self.stats.lock() {
            stats.write_success_count += 1;
        }
        if let Some(mut body) = self.body.take() {
            body.flush()?;
        }
        self.editor.commit()
    }

    pub fn abort(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Ok(mut stats) = self.stats.lock() {
            stats.write_abort_count += 1;
        }
        self.body = None;
        self.editor.abort_unless_committed();
    }
}

impl Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.body.as_mut() {
            Some(body) => body.write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "cache writer is finished",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.body.as_mut() {
            Some(body) => body.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Tees a network body into the cache as it is read. End of stream commits
/// the entry; an upstream error aborts it. A cache-side write failure only
/// aborts the entry, never the caller's read. If the caller drops the body
/// before draining it, the remainder is pulled through for a bounded time
/// so a nearly-complete entry can still be committed.
struct CacheWritingBody {
    source: Body,
    writer: Option<CacheWriter>,
}

impl Read for CacheWritingBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match self.source.read(buf) {
            Ok(n) => n,
            Err(err) => {
                if let Some(mut writer) = self.writer.take() {
                    // The full response never arrived.
                    writer.abort();
                }
                return Err(err);
            }
        };
        if n == 0 {
            if let Some(mut writer) = self.writer.take() {
                if let Err(err) = writer.commit() {
                    log_debug!("cache body commit failed: {err}");
                }
            }
            return Ok(0);
        }
        if let Some(writer) = self.writer.as_mut() {
            if writer.write_all(&buf[..n]).is_err() {
                if let Some(mut writer) = self.writer.take() {
                    writer.abort();
                }
            }
        }
        Ok(n)
    }
}

impl Drop for CacheWritingBody {
    fn drop(&mut self) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        let deadline = Instant::now() + DISCARD_STREAM_TIMEOUT;
        let mut scratch = [0u8; 8192];
        loop {
            match self.source.read(&mut scratch) {
                Ok(0) => {
                    if let Err(err) = writer.commit() {
                        log_debug!("cache body commit failed: {err}");
                    }
                    return;
                }
                Ok(n) => {
                    if writer.write_all(&scratch[..n]).is_err() || Instant::now() > deadline {
                        writer.abort();
                        return;
                    }
                }
                Err(_) => {
                    writer.abort();
                    return;
                }
            }
        }
    }
}

/// See [`HttpCache::urls`].
pub struct Urls {
    snapshots: Snapshots,
}

impl Urls {
    /// Evict the entry behind the most recently returned URL.
    pub fn remove_current(&mut self) {
        self.snapshots.remove_current();
    }
}

impl Iterator for Urls {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut snapshot = self.snapshots.next()?;
            let Some(metadata) = snapshot.take_source(ENTRY_METADATA) else {
                continue;
            };
            let mut reader = BufReader::new(metadata);
            let mut url = String::new();
            // Unreadable metadata: skip the entry, same as a decode miss.
            match reader.read_line(&mut url) {
                Ok(n) if n > 0 && url.ends_with('\n') => {
                    url.pop();
                    return Some(url);
                }
                _ => continue,
            }
        }
    }
}
