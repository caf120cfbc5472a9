//! Diffusion-MRI tractography dataset preparation.
//!
//! Four sequential stages, each stage's output the next one's read-only
//! input: `organize` standardizes per-subject imaging data, `package`
//! builds one HDF5 archive from it, `check` validates the archive, and
//! `train` hands it to an external trainer.

pub mod archive;
pub mod check;
pub mod cli;
pub mod config;
pub mod layout;
pub mod organize;
pub mod package;
pub mod sampler;
pub mod staging;
pub mod streamlines;
pub mod subjects;
pub mod train;
pub mod util;
pub mod volume;
