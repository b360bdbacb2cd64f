//! Packet DMA pipeline for PCIe switch ASICs.
//!
//! Frames diverted to the CPU arrive on per-channel descriptor rings, are reassembled,
//! classified by a priority-ordered profile table and dispatched to the host stack, netlink
//! listeners, the user-space SDK queue or the IFA fast-forward path. The transmit side builds
//! the device header and pushes frames back onto TX rings.
//!
//! Entry point: [`KnetBuilder`].

pub mod api;
pub mod config;
pub mod dispatch;
pub mod dma;
mod idmap;
pub mod knet;
pub mod netif;
pub mod netlink;
pub mod profile;
pub mod runtime;
pub mod rx;
pub mod sdk_queue;
pub mod tx;

pub use api::{BoxError, Errno, Error, Result};
pub use config::{ChipGeometry, DriverConfig};
pub use knet::{ChannelInfo, Knet, KnetBuilder};
