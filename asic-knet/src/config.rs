//! Device geometry and driver configuration.

use std::time::Duration;

use crate::rx::SopPolicy;

/// Length of the EMAC prefix in front of the packet-processing header.
pub const EMAC_HDR_LEN: usize = 12;
/// Length of the packet-processing header (PPH).
pub const PPH_LEN: usize = 40;
/// Device header prepended to every frame crossing the CPU port.
pub const DMA_HDR_LEN: usize = EMAC_HDR_LEN + PPH_LEN;
/// Integrity trailer appended by (and for) the ASIC.
pub const FCS_LEN: usize = 4;
/// Minimum Ethernet frame without FCS.
pub const ETH_ZLEN: usize = 60;
/// Ethernet header without VLAN tags.
pub const ETH_HLEN: usize = 14;
/// Interface and netlink name capacity, including the terminator.
pub const NAME_LEN: usize = 16;
/// Size of the classification reason space.
pub const REASON_MAX: usize = 512;

/// Fixed per-family constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipGeometry {
    /// RX channels occupy ids `0..rx_channels`.
    pub rx_channels: u32,
    /// TX channels follow the RX channels.
    pub tx_channels: u32,
    /// Total interrupt-capable channels. Ids past RX and TX are general channels.
    pub total_channels: u32,
    /// Descriptors per ring.
    pub ring_size: u32,
    /// Bytes per RX fragment buffer.
    pub frag_size: usize,
    /// Source index the ASIC expects for CPU-originated frames.
    pub cpu_port: u32,
    pub slices: u32,
    pub ports_per_slice: u32,
    /// Exclusive upper bound of logical port ids.
    pub port_di_max: u32,
    /// Largest frame accepted for transmit.
    pub max_pkt_len: usize,
    /// Device addressing width.
    pub dma_bits: u32,
}

impl ChipGeometry {
    /// Geometry of the NB family.
    pub fn nb() -> Self {
        Self {
            rx_channels: 4,
            tx_channels: 4,
            total_channels: 20,
            ring_size: 1024,
            frag_size: 4096,
            cpu_port: 256,
            slices: 8,
            ports_per_slice: 40,
            port_di_max: 288,
            max_pkt_len: 10200,
            dma_bits: 48,
        }
    }

    #[inline]
    pub fn first_tx_channel(&self) -> u32 {
        self.rx_channels
    }

    #[inline]
    pub fn dma_channels(&self) -> u32 {
        self.rx_channels + self.tx_channels
    }
}

impl Default for ChipGeometry {
    fn default() -> Self {
        Self::nb()
    }
}

/// Configuration for a [`Knet`](crate::Knet) instance.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub geometry: ChipGeometry,
    /// Bound of the user-space SDK queue.
    pub sdk_queue_capacity: usize,
    /// Default wait of [`Knet::sdk_receive`](crate::Knet::sdk_receive).
    pub sdk_wait: Duration,
    /// TX channel used by interface transmit and fast-forward.
    pub netif_tx_channel: u32,
    /// Sleep between allocation retries in the recovery task.
    pub recovery_backoff: Duration,
    /// Reaction to a start-of-packet fragment arriving mid-packet.
    pub sop_policy: SopPolicy,
    /// Upper bound of outstanding DMA buffers (None = unbounded).
    pub buffer_limit: Option<usize>,
    pub max_netifs: u32,
    pub max_profiles: u32,
    pub max_netlinks: u32,
    /// Maximum netlink message size (header attributes plus payload attribute).
    pub netlink_msg_max: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        let geometry = ChipGeometry::nb();
        Self {
            netif_tx_channel: geometry.first_tx_channel(),
            geometry,
            sdk_queue_capacity: 10240,
            sdk_wait: Duration::from_millis(3000),
            recovery_backoff: Duration::from_millis(10),
            sop_policy: SopPolicy::default(),
            buffer_limit: None,
            max_netifs: 288,
            max_profiles: 288,
            max_netlinks: 288,
            netlink_msg_max: 10200,
        }
    }
}

impl DriverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the geometry. Resets the netif TX channel to the first TX channel.
    pub fn geometry(mut self, geometry: ChipGeometry) -> Self {
        self.netif_tx_channel = geometry.first_tx_channel();
        self.geometry = geometry;
        self
    }

    /// Set descriptors per ring. Must be at least 2.
    pub fn ring_size(mut self, n: u32) -> Self {
        self.geometry.ring_size = n;
        self
    }

    pub fn frag_size(mut self, n: usize) -> Self {
        self.geometry.frag_size = n;
        self
    }

    pub fn sdk_queue_capacity(mut self, n: usize) -> Self {
        self.sdk_queue_capacity = n;
        self
    }

    pub fn sdk_wait(mut self, wait: Duration) -> Self {
        self.sdk_wait = wait;
        self
    }

    pub fn netif_tx_channel(mut self, ch: u32) -> Self {
        self.netif_tx_channel = ch;
        self
    }

    pub fn recovery_backoff(mut self, backoff: Duration) -> Self {
        self.recovery_backoff = backoff;
        self
    }

    pub fn sop_policy(mut self, policy: SopPolicy) -> Self {
        self.sop_policy = policy;
        self
    }

    /// Cap the number of DMA buffers alive at once.
    pub fn buffer_limit(mut self, limit: usize) -> Self {
        self.buffer_limit = Some(limit);
        self
    }

    pub fn table_limits(mut self, netifs: u32, profiles: u32, netlinks: u32) -> Self {
        self.max_netifs = netifs;
        self.max_profiles = profiles;
        self.max_netlinks = netlinks;
        self
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        let g = &self.geometry;
        if g.ring_size < 2 {
            return Err(crate::Error::InvalidArgument("ring size below 2"));
        }
        if g.frag_size <= DMA_HDR_LEN || g.frag_size > u16::MAX as usize {
            return Err(crate::Error::InvalidArgument("fragment size"));
        }
        if g.dma_channels() > g.total_channels || g.total_channels > 64 {
            return Err(crate::Error::InvalidArgument("channel layout"));
        }
        // Attribute lengths are 16-bit.
        if self.netlink_msg_max > u16::MAX as usize {
            return Err(crate::Error::InvalidArgument("netlink message size"));
        }
        let tx = g.first_tx_channel()..g.dma_channels();
        if !tx.contains(&self.netif_tx_channel) {
            return Err(crate::Error::InvalidChannel(self.netif_tx_channel));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = DriverConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.netif_tx_channel, 4);
        assert_eq!(DMA_HDR_LEN, 52);
    }

    #[test]
    fn test_rejects_rx_channel_for_netif_tx() {
        let cfg = DriverConfig::new().netif_tx_channel(0);
        assert!(matches!(cfg.validate(), Err(crate::Error::InvalidChannel(0))));
    }

    #[test]
    fn test_netlink_msg_max_fits_attr_len() {
        let mut cfg = DriverConfig::new();
        cfg.netlink_msg_max = u16::MAX as usize;
        assert!(cfg.validate().is_ok());
        cfg.netlink_msg_max = 70_000;
        assert!(matches!(
            cfg.validate(),
            Err(crate::Error::InvalidArgument("netlink message size"))
        ));
    }

    #[test]
    fn test_rejects_tiny_ring() {
        let cfg = DriverConfig::new().ring_size(1);
        assert!(cfg.validate().is_err());
    }
}
