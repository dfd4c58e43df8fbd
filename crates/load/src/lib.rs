//! Load shaping for Meridian: per-endpoint credit accounting that throttles
//! or disconnects misbehaving peers, and the adaptive fee multiplier that
//! responds to observed load.

pub mod accountant;
pub mod fees;

pub use accountant::{
    LoadAccountant, LoadConfig, LoadKind, SourceFlags, LC_CPU, LC_DISK, LC_NETWORK,
};
pub use fees::{FeeStatus, FeeTracker, FEE_MAX, NORMAL_FEE};
