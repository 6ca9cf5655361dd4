//! GPU resource core for a hybrid raster + hardware ray tracing demo.
//!
//! Provides the device bring-up, the chunked device memory arena, the
//! growable staging buffer, the tracked resource registry, and the
//! bottom/top-level acceleration structure build pipeline with per-frame
//! top-level rebuilds. Windowing, pipelines, and the present loop belong to
//! the renderer layer on top.
//!
//! Everything here assumes a single driving thread and a single hardware
//! queue; native failures are unrecoverable and surface as `Err(String)`.

pub mod accel;
pub mod context;
pub mod memory;
pub mod registry;
pub mod staging;
pub mod timing;

pub use accel::{BlasEntry, MeshGeometry, SceneAccel};
pub use context::RenderContext;
pub use memory::{Allocation, DedicatedAllocation, DeviceArena};
pub use registry::ResourceRegistry;
pub use staging::StagingArena;
pub use timing::TimestampRing;
