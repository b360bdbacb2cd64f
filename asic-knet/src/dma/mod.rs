//! DMA layer: packet buffers, descriptor rings and the channel arena.

pub mod buffer;
pub mod channel;
pub mod ring;

pub use buffer::{AllocError, BufferPool, BufferPoolConfig, DmaBuffer, DmaError};
pub use channel::{Channel, ChannelArena, ChannelCounters, ChannelCountersSnapshot, RxState};
pub use ring::{ChannelState, RingChannel, RingFull};
