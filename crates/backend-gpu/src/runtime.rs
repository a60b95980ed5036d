//! wgpu-backed device.
//!
//! wgpu hides the platform layer, so this device takes the alternate-backend
//! path during capability detection. Programs are WGSL modules: named sources
//! are registered up front, inline sources are passed as the identifier itself.
//! `-DNAME=VALUE` compile options become module-scope constants.

use crate::device::{CompiledProgram, Device, DeviceIdentity, PlatformInfo, ProgramRequest};
use convforge_problem::{Error, Result};
use pollster::block_on;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

/// Information about the GPU adapter.
#[derive(Debug, Clone)]
pub struct GpuDeviceInfo {
    pub name: String,
    pub backend: String,
    pub vendor_id: u32,
    pub driver: String,
    pub supports_timestamps: bool,
}

#[derive(Debug)]
pub struct WgslProgram {
    source_id: String,
    module: wgpu::ShaderModule,
}

impl WgslProgram {
    pub fn module(&self) -> &wgpu::ShaderModule {
        &self.module
    }
}

impl CompiledProgram for WgslProgram {
    fn source_id(&self) -> &str {
        &self.source_id
    }
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: GpuDeviceInfo,
    compute_units: usize,
    sources: RwLock<HashMap<String, String>>,
}

impl WgpuDevice {
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| Error::configuration("no suitable GPU adapter found"))?;

        let adapter_info = adapter.get_info();
        let supports_timestamps = adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY);

        let (device, queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("convforge device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
            },
            None,
        ))
        .map_err(|err| Error::configuration(format!("failed to open GPU device: {err}")))?;

        let info = GpuDeviceInfo {
            name: adapter_info.name.clone(),
            backend: format!("{:?}", adapter_info.backend),
            vendor_id: adapter_info.vendor,
            driver: adapter_info.driver_info.clone(),
            supports_timestamps,
        };
        info!(name = %info.name, backend = %info.backend, "wgpu device opened");

        Ok(Self {
            device,
            queue,
            info,
            // wgpu does not report compute unit counts.
            compute_units: 0,
            sources: RwLock::new(HashMap::new()),
        })
    }

    /// Sets the compute-unit count used in the device identity.
    pub fn with_compute_units(mut self, compute_units: usize) -> Self {
        self.compute_units = compute_units;
        self
    }

    pub fn register_source(&self, source_id: impl Into<String>, wgsl: impl Into<String>) {
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source_id.into(), wgsl.into());
    }

    pub fn info(&self) -> &GpuDeviceInfo {
        &self.info
    }

    pub fn wgpu_device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn resolve_source(&self, request: &ProgramRequest) -> Result<String> {
        if request.inline_source {
            return Ok(request.source_id.clone());
        }
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.source_id)
            .cloned()
            .ok_or_else(|| {
                Error::compilation(
                    request.source_id.clone(),
                    request.options.clone(),
                    "no source registered under this name",
                )
            })
    }
}

impl Device for WgpuDevice {
    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.info.name.clone(), self.compute_units)
    }

    fn platform_info(&self) -> Option<PlatformInfo> {
        None
    }

    fn assembler_available(&self) -> bool {
        false
    }

    fn build_program(&self, request: &ProgramRequest) -> Result<Box<dyn CompiledProgram>> {
        let body = self.resolve_source(request)?;
        let source = format!("{}{}", defines_prelude(&request.options), body);

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&request.source_id),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(Error::compilation(
                request.source_id.clone(),
                request.options.clone(),
                err.to_string(),
            ));
        }

        Ok(Box::new(WgslProgram {
            source_id: request.source_id.clone(),
            module,
        }))
    }
}

/// Translates `-DNAME=VALUE` options into WGSL constant declarations.
pub fn defines_prelude(options: &str) -> String {
    let mut prelude = String::new();
    let mut tokens = options.split_whitespace();
    while let Some(token) = tokens.next() {
        let define = match token {
            "-D" => match tokens.next() {
                Some(next) => next,
                None => break,
            },
            other => match other.strip_prefix("-D") {
                Some(rest) => rest,
                None => {
                    debug!(option = other, "ignoring non-define compile option");
                    continue;
                }
            },
        };

        let (name, value) = define.split_once('=').unwrap_or((define, "1"));
        if value.parse::<i32>().is_ok() {
            prelude.push_str(&format!("const {name}: i32 = {value};\n"));
        } else if value.parse::<f32>().is_ok() {
            prelude.push_str(&format!("const {name}: f32 = {value};\n"));
        } else {
            debug!(name, value, "ignoring non-numeric define");
        }
    }
    prelude
}
