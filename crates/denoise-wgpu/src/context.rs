//! Run-scoped GPU context
//!
//! [`GpuContext`] bundles the adapter, device and queue that every other component
//! borrows. It also watches for device loss and uncaptured device errors so that
//! in-flight waits can turn them into [`Error::DeviceLost`].

use crate::error::{Error, Result};
use std::sync::{Arc, Mutex};

/// Options controlling adapter and device selection
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Adapter power preference
    pub power_preference: wgpu::PowerPreference,
    /// Force the software fallback adapter
    pub force_fallback_adapter: bool,
    /// Request timestamp query features when the adapter offers them
    pub request_timestamps: bool,
    /// Request `MAPPABLE_PRIMARY_BUFFERS` so compute buffers may be host-visible
    pub request_mappable_compute: bool,
    /// Restrict the backends tried; `None` tries the platform preference order
    pub backends: Option<wgpu::Backends>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            request_timestamps: true,
            request_mappable_compute: false,
            backends: None,
        }
    }
}

impl ContextOptions {
    /// Sets the adapter power preference
    pub fn with_power_preference(mut self, power_preference: wgpu::PowerPreference) -> Self {
        self.power_preference = power_preference;
        self
    }

    /// Forces (or stops forcing) the fallback adapter
    pub fn with_fallback_adapter(mut self, force: bool) -> Self {
        self.force_fallback_adapter = force;
        self
    }

    /// Enables or disables timestamp queries
    pub fn with_timestamps(mut self, request: bool) -> Self {
        self.request_timestamps = request;
        self
    }

    /// Enables or disables host-visible compute buffers
    pub fn with_mappable_compute(mut self, request: bool) -> Self {
        self.request_mappable_compute = request;
        self
    }

    /// Restricts the backends tried
    pub fn with_backends(mut self, backends: wgpu::Backends) -> Self {
        self.backends = Some(backends);
        self
    }

    fn backend_candidates(&self) -> Vec<wgpu::Backends> {
        if let Some(backends) = self.backends {
            return vec![backends];
        }
        #[cfg(vulkan)]
        {
            vec![wgpu::Backends::VULKAN, wgpu::Backends::all()]
        }
        #[cfg(not(vulkan))]
        {
            vec![wgpu::Backends::all()]
        }
    }
}

/// Device faults reported asynchronously by wgpu callbacks
#[derive(Debug, Default)]
struct DeviceFaults {
    lost: Mutex<Option<String>>,
    uncaptured: Mutex<Option<String>>,
}

impl DeviceFaults {
    fn record(slot: &Mutex<Option<String>>, message: String) {
        if let Ok(mut slot) = slot.lock() {
            slot.get_or_insert(message);
        }
    }

    fn peek(slot: &Mutex<Option<String>>) -> Option<String> {
        slot.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Adapter, device and queue shared by one or more runs
#[derive(Debug)]
pub struct GpuContext {
    adapter_info: wgpu::AdapterInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    faults: Arc<DeviceFaults>,
}

impl GpuContext {
    /// Acquires an adapter and device
    ///
    /// Backends are tried in preference order (Vulkan first where it exists). The
    /// returned context enables timestamp queries and mappable compute buffers only
    /// if requested and supported.
    ///
    /// # Arguments
    /// * `options` - Adapter and feature selection
    ///
    /// # Returns
    /// The context, or `AdapterUnavailable` if no adapter or device could be acquired
    pub async fn new(options: &ContextOptions) -> Result<Self> {
        let mut last_error = String::from("no backend tried");
        for backends in options.backend_candidates() {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends,
                ..Default::default()
            });
            let adapter = match instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: options.power_preference,
                    compatible_surface: None,
                    force_fallback_adapter: options.force_fallback_adapter,
                })
                .await
            {
                Ok(adapter) => adapter,
                Err(e) => {
                    tracing::debug!(?backends, "no adapter: {e}");
                    last_error = e.to_string();
                    continue;
                }
            };

            let available = adapter.features();
            let mut required_features = wgpu::Features::empty();
            if options.request_timestamps {
                required_features |= available & (wgpu::Features::TIMESTAMP_QUERY | wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS);
            }
            if options.request_mappable_compute {
                required_features |= available & wgpu::Features::MAPPABLE_PRIMARY_BUFFERS;
            }

            let (device, queue) = adapter
                .request_device(&wgpu::DeviceDescriptor {
                    label: Some("denoise-wgpu"),
                    required_features,
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                    trace: Default::default(),
                })
                .await
                .map_err(|e| Error::AdapterUnavailable(e.to_string()))?;

            let adapter_info = adapter.get_info();
            tracing::info!(adapter = %adapter_info.name, backend = ?adapter_info.backend, features = ?required_features, "GPU context created");

            return Ok(Self::from_parts(adapter_info, device, queue));
        }
        Err(Error::AdapterUnavailable(last_error))
    }

    /// Blocking version of [`GpuContext::new`]
    pub fn new_blocking(options: &ContextOptions) -> Result<Self> {
        pollster::block_on(Self::new(options))
    }

    /// Wraps an existing device and queue
    ///
    /// Installs the device-lost and uncaptured-error handlers this crate relies on.
    pub fn from_parts(adapter_info: wgpu::AdapterInfo, device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let faults = Arc::new(DeviceFaults::default());

        let lost = Arc::clone(&faults);
        device.set_device_lost_callback(move |reason, message| {
            if reason == wgpu::DeviceLostReason::Destroyed {
                tracing::debug!("device destroyed");
                return;
            }
            tracing::error!(?reason, "device lost: {message}");
            DeviceFaults::record(&lost.lost, format!("{reason:?}: {message}"));
        });

        let uncaptured = Arc::clone(&faults);
        device.on_uncaptured_error(Box::new(move |error| {
            tracing::error!("uncaptured device error: {error}");
            DeviceFaults::record(&uncaptured.uncaptured, error.to_string());
        }));

        Self { adapter_info, device, queue, faults }
    }

    /// The wgpu device
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// The wgpu queue
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Information about the selected adapter
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Features enabled on the device
    pub fn features(&self) -> wgpu::Features {
        self.device.features()
    }

    /// Limits of the device
    pub fn limits(&self) -> wgpu::Limits {
        self.device.limits()
    }

    /// Whether compute passes can write device timestamps
    pub fn supports_timestamps(&self) -> bool {
        self.features().contains(wgpu::Features::TIMESTAMP_QUERY)
    }

    /// Whether timestamps can also be written between encoder commands
    pub fn supports_encoder_timestamps(&self) -> bool {
        self.features().contains(wgpu::Features::TIMESTAMP_QUERY | wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS)
    }

    /// Fails with `DeviceLost` if the device was lost or reported an uncaptured error
    pub fn check_device(&self) -> Result<()> {
        if let Some(message) = DeviceFaults::peek(&self.faults.lost) {
            return Err(Error::DeviceLost(message));
        }
        if let Some(message) = DeviceFaults::peek(&self.faults.uncaptured) {
            return Err(Error::DeviceLost(format!("uncaptured device error: {message}")));
        }
        Ok(())
    }
}
