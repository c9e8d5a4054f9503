//! Device & capability probe (C1).
//!
//! Wraps a `wgpu::Adapter`/`Device` pair and reduces their `Features`/`Limits`
//! down to the handful of facts the resolver and buffer pool actually branch
//! on — a small typed summary derived from a richer upstream handle, rather
//! than threading raw `wgpu` types through the crate.

use thiserror::Error;

/// Capability summary the kernel-path resolver and buffer pool read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceCaps {
    pub has_f16: bool,
    pub has_subgroups: bool,
    pub subgroup_size: u32,
    pub max_workgroup_size: u32,
    pub max_heap_bytes: u64,
    pub buffer_alignment: u32,
}

impl DeviceCaps {
    /// Derive a capability summary from a live adapter/device pair.
    pub fn probe(adapter: &wgpu::Adapter, device: &wgpu::Device) -> Self {
        let features = device.features();
        let limits = device.limits();
        let adapter_limits = adapter.limits();

        Self {
            has_f16: features.contains(wgpu::Features::SHADER_F16),
            has_subgroups: features.contains(wgpu::Features::SUBGROUP),
            subgroup_size: 32,
            max_workgroup_size: limits.max_compute_workgroup_size_x,
            max_heap_bytes: limits.max_buffer_size,
            buffer_alignment: adapter_limits.min_storage_buffer_offset_alignment,
        }
    }

    /// Construct a capability summary without a live device, for tests and
    /// for resolver scenarios that only need to reason about a hypothetical
    /// device.
    pub fn synthetic(
        has_f16: bool,
        has_subgroups: bool,
        subgroup_size: u32,
        max_heap_bytes: u64,
    ) -> Self {
        Self {
            has_f16,
            has_subgroups,
            subgroup_size,
            max_workgroup_size: 256,
            max_heap_bytes,
            buffer_alignment: 256,
        }
    }
}

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("no compatible GPU adapter found")]
    NoAdapter,

    #[error("device request failed: {0}")]
    RequestDevice(String),

    #[error("device reports max heap of {reported} bytes, below the minimum of {required} bytes required to load any curated manifest")]
    HeapTooSmall { reported: u64, required: u64 },
}

/// Request an adapter + device from a `wgpu::Instance` and probe its
/// capabilities. Surfaces a typed error instead of defaulting silently on
/// an undersized device, since that's fatal for every curated manifest
/// rather than just one tier's budget.
pub async fn probe_device(
    instance: &wgpu::Instance,
    minimum_heap_bytes: u64,
) -> Result<(wgpu::Adapter, wgpu::Device, wgpu::Queue, DeviceCaps), CapabilityError> {
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
        .ok_or(CapabilityError::NoAdapter)?;

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("doppler-device"),
                required_features: adapter.features() & wgpu::Features::SHADER_F16,
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        )
        .await
        .map_err(|e| CapabilityError::RequestDevice(e.to_string()))?;

    let caps = DeviceCaps::probe(&adapter, &device);
    if caps.max_heap_bytes < minimum_heap_bytes {
        return Err(CapabilityError::HeapTooSmall {
            reported: caps.max_heap_bytes,
            required: minimum_heap_bytes,
        });
    }

    tracing::info!(
        has_f16 = caps.has_f16,
        has_subgroups = caps.has_subgroups,
        max_heap_bytes = caps.max_heap_bytes,
        "device capabilities probed"
    );

    Ok((adapter, device, queue, caps))
}
