//! In-process device double for tests across the workspace.

use crate::device::{CompiledProgram, Device, DeviceIdentity, PlatformInfo, ProgramRequest};
use convforge_problem::{Error, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug)]
pub struct FakeProgram {
    pub source_id: String,
    pub options: String,
}

impl CompiledProgram for FakeProgram {
    fn source_id(&self) -> &str {
        &self.source_id
    }
}

/// Counts builds and platform queries; compile failures are opt-in per source.
#[derive(Debug)]
pub struct FakeDevice {
    identity: DeviceIdentity,
    platform: Option<PlatformInfo>,
    assembler: bool,
    metadata_bug: bool,
    compile_delay: Option<Duration>,
    failing_sources: Mutex<HashSet<String>>,
    compiles: AtomicUsize,
    platform_queries: AtomicUsize,
}

impl FakeDevice {
    pub fn new(name: &str, compute_units: usize) -> Self {
        Self {
            identity: DeviceIdentity::new(name, compute_units),
            platform: None,
            assembler: false,
            metadata_bug: true,
            compile_delay: None,
            failing_sources: Mutex::new(HashSet::new()),
            compiles: AtomicUsize::new(0),
            platform_queries: AtomicUsize::new(0),
        }
    }

    pub fn with_platform(mut self, info: PlatformInfo) -> Self {
        self.platform = Some(info);
        self
    }

    pub fn with_assembler(mut self, available: bool) -> Self {
        self.assembler = available;
        self
    }

    pub fn with_metadata_bug(mut self, bug: bool) -> Self {
        self.metadata_bug = bug;
        self
    }

    pub fn with_compile_delay(mut self, delay: Duration) -> Self {
        self.compile_delay = Some(delay);
        self
    }

    pub fn fail_source(&self, source_id: &str) {
        if let Ok(mut failing) = self.failing_sources.lock() {
            failing.insert(source_id.to_string());
        }
    }

    pub fn heal_source(&self, source_id: &str) {
        if let Ok(mut failing) = self.failing_sources.lock() {
            failing.remove(source_id);
        }
    }

    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn platform_queries(&self) -> usize {
        self.platform_queries.load(Ordering::SeqCst)
    }
}

impl Device for FakeDevice {
    fn identity(&self) -> DeviceIdentity {
        self.identity.clone()
    }

    fn platform_info(&self) -> Option<PlatformInfo> {
        self.platform_queries.fetch_add(1, Ordering::SeqCst);
        self.platform.clone()
    }

    fn assembler_available(&self) -> bool {
        self.assembler
    }

    fn assembler_has_metadata_bug(&self) -> bool {
        self.metadata_bug
    }

    fn build_program(&self, request: &ProgramRequest) -> Result<Box<dyn CompiledProgram>> {
        if let Some(delay) = self.compile_delay {
            std::thread::sleep(delay);
        }
        self.compiles.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_sources
            .lock()
            .map(|set| set.contains(&request.source_id))
            .unwrap_or(false);
        if failing {
            return Err(Error::compilation(
                request.source_id.clone(),
                request.options.clone(),
                "rejected by fake device",
            ));
        }

        Ok(Box::new(FakeProgram {
            source_id: request.source_id.clone(),
            options: request.options.clone(),
        }))
    }
}
