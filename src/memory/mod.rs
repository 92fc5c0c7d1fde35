//! Memory primitives shared by the kernel backends and buffer objects.
//!
//! - [`CpuMapping`]: RAII `MAP_SHARED` view of a kernel memory object

mod mapping;

pub use mapping::CpuMapping;
