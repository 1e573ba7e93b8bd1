//! Encoder selection for transcodes
//!
//! Inspects the host, picks an acceleration path and codecs, and turns the
//! choice into the encoder's argument vector.

pub mod args;
pub mod host;
pub mod selector;

pub use args::{build_override_args, build_transcode_args, resolution_dimensions, software_threads};
pub use host::{classify_gpu, GpuVendor, HostCapabilities, HwSupport, SystemHost};
pub use selector::{
    default_codecs, detect_hardware_flag, generic_hwaccel, select_plan, AccelPath, EncodePlan,
};
