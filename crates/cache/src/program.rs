//! Compile-once program cache.

use convforge_backend_gpu::{CompiledProgram, DeviceHandle, ProgramRequest};
use convforge_problem::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Trims leading whitespace and prefixes exactly one space; empty stays empty.
pub fn normalize_options(options: &str) -> String {
    let trimmed = options.trim_start();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(" {trimmed}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub source_id: String,
    pub options: String,
}

impl ProgramKey {
    pub fn new(source_id: impl Into<String>, options: &str) -> Self {
        Self {
            source_id: source_id.into(),
            options: normalize_options(options),
        }
    }
}

struct ProgramInner {
    key: ProgramKey,
    compiled: Box<dyn CompiledProgram>,
}

/// Shared handle to a compiled program. Clones refer to the same artifact.
#[derive(Clone)]
pub struct Program {
    inner: Arc<ProgramInner>,
}

impl Program {
    fn new(key: ProgramKey, compiled: Box<dyn CompiledProgram>) -> Self {
        Self {
            inner: Arc::new(ProgramInner { key, compiled }),
        }
    }

    pub fn key(&self) -> &ProgramKey {
        &self.inner.key
    }

    pub fn source_id(&self) -> &str {
        &self.inner.key.source_id
    }

    pub fn options(&self) -> &str {
        &self.inner.key.options
    }

    pub fn compiled(&self) -> &dyn CompiledProgram {
        self.inner.compiled.as_ref()
    }

    pub fn ptr_eq(&self, other: &Program) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("source_id", &self.inner.key.source_id)
            .field("options", &self.inner.key.options)
            .finish()
    }
}

type Slot = Arc<Mutex<Option<Program>>>;

/// Programs keyed by (source identifier, normalized options).
///
/// Each key owns a slot mutex held for the duration of its compile, so
/// concurrent requests for one key wait for the first compile instead of
/// starting their own. Failed compiles leave the slot empty.
#[derive(Default)]
pub struct ProgramCache {
    slots: Mutex<HashMap<ProgramKey, Slot>>,
    compile_timeout: Option<Duration>,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compile_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.compile_timeout = timeout;
        self
    }

    pub fn compile_timeout(&self) -> Option<Duration> {
        self.compile_timeout
    }

    /// Returns the cached program for the request, compiling it on first use.
    pub fn get_or_compile(&self, device: &DeviceHandle, request: &ProgramRequest) -> Result<Program> {
        let key = ProgramKey::new(request.source_id.clone(), &request.options);
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(program) = slot.as_ref() {
            debug!(source = %short_source(&key.source_id), options = %key.options, "program cache hit");
            return Ok(program.clone());
        }

        debug!(source = %short_source(&key.source_id), options = %key.options, "compiling program");
        let normalized = ProgramRequest {
            source_id: key.source_id.clone(),
            options: key.options.clone(),
            inline_source: request.inline_source,
        };
        let compiled = self.compile(device, normalized)?;
        let program = Program::new(key, compiled);
        *slot = Some(program.clone());
        Ok(program)
    }

    /// Cached program for the key, without compiling.
    pub fn get(&self, source_id: &str, options: &str) -> Option<Program> {
        let key = ProgramKey::new(source_id, options);
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.get(&key).cloned()
        }?;
        let program = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
        program
    }

    /// Number of successfully compiled programs.
    pub fn len(&self) -> usize {
        let slots: Vec<Slot> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots
            .iter()
            .filter(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn compile(&self, device: &DeviceHandle, request: ProgramRequest) -> Result<Box<dyn CompiledProgram>> {
        let Some(limit) = self.compile_timeout else {
            return device.build_program(&request);
        };

        let (tx, rx) = mpsc::channel();
        let worker_device = Arc::clone(device);
        let worker_request = request.clone();
        thread::Builder::new()
            .name("convforge-compile".into())
            .spawn(move || {
                // The receiver is gone if the caller already timed out.
                let _ = tx.send(worker_device.build_program(&worker_request));
            })
            .map_err(|err| Error::compilation(request.source_id.clone(), request.options.clone(), err.to_string()))?;

        match rx.recv_timeout(limit) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(source = %short_source(&request.source_id), ?limit, "compile timed out");
                Err(Error::Timeout {
                    what: format!("compile of `{}`", short_source(&request.source_id)),
                    limit,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::compilation(
                request.source_id,
                request.options,
                "compile worker exited without a result",
            )),
        }
    }
}

impl fmt::Debug for ProgramCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramCache")
            .field("programs", &self.len())
            .field("compile_timeout", &self.compile_timeout)
            .finish()
    }
}

/// Inline sources can be whole programs; keep log lines readable.
fn short_source(source_id: &str) -> &str {
    let line = source_id.lines().next().unwrap_or_default();
    match line.char_indices().nth(48) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convforge_backend_gpu::testing::FakeDevice;
    use std::sync::Barrier;

    fn request(source: &str, options: &str) -> ProgramRequest {
        ProgramRequest {
            source_id: source.into(),
            options: options.into(),
            inline_source: false,
        }
    }

    #[test]
    fn options_are_normalized_to_one_leading_space() {
        assert_eq!(normalize_options("-DA=1"), " -DA=1");
        assert_eq!(normalize_options("    -DA=1 -DB=2"), " -DA=1 -DB=2");
        assert_eq!(normalize_options(""), "");
        assert_eq!(normalize_options("   "), "");
    }

    #[test]
    fn equal_keys_share_one_program() {
        let fake = Arc::new(FakeDevice::new("fake", 4));
        let device: DeviceHandle = fake.clone();
        let cache = ProgramCache::new();

        let a = cache.get_or_compile(&device, &request("conv.cl", "-DX=1")).unwrap();
        let b = cache.get_or_compile(&device, &request("conv.cl", "   -DX=1")).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(a.options(), " -DX=1");
        assert_eq!(fake.compile_count(), 1);

        cache.get_or_compile(&device, &request("conv.cl", "-DX=2")).unwrap();
        assert_eq!(fake.compile_count(), 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("conv.cl", "-DX=1").is_some());
    }

    #[test]
    fn concurrent_requests_compile_once() {
        const THREADS: usize = 8;
        let fake = Arc::new(FakeDevice::new("fake", 4).with_compile_delay(Duration::from_millis(20)));
        let device: DeviceHandle = fake.clone();
        let cache = Arc::new(ProgramCache::new());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let device = Arc::clone(&device);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_compile(&device, &request("shared.cl", " -DN=4")).unwrap()
                })
            })
            .collect();
        let programs: Vec<Program> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(fake.compile_count(), 1);
        assert!(programs.windows(2).all(|pair| pair[0].ptr_eq(&pair[1])));
    }

    #[test]
    fn failed_compile_is_retried() {
        let fake = Arc::new(FakeDevice::new("fake", 4));
        let device: DeviceHandle = fake.clone();
        let cache = ProgramCache::new();
        fake.fail_source("broken.cl");

        let err = cache.get_or_compile(&device, &request("broken.cl", "")).unwrap_err();
        assert!(matches!(err, Error::Compilation { .. }));
        assert!(cache.is_empty());

        fake.heal_source("broken.cl");
        cache.get_or_compile(&device, &request("broken.cl", "")).unwrap();
        assert_eq!(fake.compile_count(), 2);
    }

    #[test]
    fn slow_compile_times_out_and_is_not_cached() {
        let fake = Arc::new(FakeDevice::new("fake", 4).with_compile_delay(Duration::from_millis(200)));
        let device: DeviceHandle = fake.clone();
        let cache = ProgramCache::new().with_compile_timeout(Some(Duration::from_millis(10)));

        let err = cache.get_or_compile(&device, &request("slow.cl", "")).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(cache.get("slow.cl", "").is_none());
    }

    #[test]
    fn log_source_is_truncated_to_first_line() {
        assert_eq!(short_source("kernel.cl"), "kernel.cl");
        assert_eq!(short_source("fn main() {}\nmore"), "fn main() {}");
        assert_eq!(short_source(&"x".repeat(100)).len(), 48);
    }
}
