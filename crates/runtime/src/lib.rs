//! Execution substrate shared by the gems kernels.
//!
//! Kernels in this workspace are written as tiled "device functions": a kernel
//! body runs once per cell of a launch [`Grid`](grid::Grid), cells never
//! communicate except through atomic accumulation buffers, and every input is
//! read through an explicit strided view so callers can hand over permuted or
//! offset layouts without materialising copies.
//!
//! The crate also carries the pieces that are not tied to a single kernel
//! family: the counter-based Philox generator and its shared offset state, the
//! block reduction primitive, the configuration-selection hook and the TOML
//! settings loaded by the host façade.

pub mod atomic;
pub mod device;
pub mod error;
pub mod grid;
pub mod host;
pub mod philox;
pub mod reduce;
pub mod settings;
pub mod tuning;
pub mod view;

pub use atomic::AtomicF32Buffer;
pub use device::DeviceProfile;
pub use error::{Result, RuntimeError};
pub use grid::{cdiv, launch, round_multiple, try_launch, Grid, ProgramId};
pub use host::HostTensor;
pub use philox::{PhiloxReservation, PhiloxState};
pub use settings::{KernelSettings, SplitKvPolicy};
pub use tuning::{ConfigStrategy, ConfigTable};
pub use view::StridedView;
