pub mod alarm_event;
pub mod bitfield;
pub mod catalog;
pub mod code_band;
pub mod journal;
pub mod monitor;
pub mod open_pipe;
pub mod read_config;
pub mod subscription;
pub mod util;
pub mod word_source;

#[cfg(feature = "systemd")]
mod systemd;

#[cfg(not(feature = "systemd"))]
mod no_systemd;

pub mod daemon {
    #[cfg(feature = "systemd")]
    pub use crate::systemd::{add_args, exiting, ready, start};
    #[cfg(not(feature = "systemd"))]
    pub use crate::no_systemd::{add_args, exiting, ready, start};
}
