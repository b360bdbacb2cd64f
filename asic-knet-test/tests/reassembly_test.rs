//! Multi-fragment reassembly on the RX path.
//!
//! Fragment buffers are 128 bytes here, so ordinary frames span several descriptors.

use asic_knet::DriverConfig;
use asic_knet::dma::ChannelState;
use asic_knet::rx::SopPolicy;
use asic_knet_test::frame::{HOST_MAC, PEER_MAC, RxHeader, device_frame, eth_frame};
use asic_knet_test::{Harness, tiny_geometry};

use serial_test::serial;

const FRAG: usize = 128;

fn harness(policy: SopPolicy) -> (Harness, u32) {
    let h = Harness::with_config(
        DriverConfig::new()
            .geometry(tiny_geometry())
            .frag_size(FRAG)
            .sop_policy(policy),
    );
    let id = h.knet.create_netif("swp3", 3, HOST_MAC).unwrap();
    h.knet.start_rx().unwrap();
    (h, id)
}

#[test]
#[serial]
fn three_fragments_make_one_packet() {
    let (h, id) = harness(SopPolicy::Restart);
    let l2 = eth_frame(HOST_MAC, PEER_MAC, 0x0800, 300);
    let frame = device_frame(&RxHeader::new(3, 7), &l2);
    assert_eq!(frame.len(), 356);

    assert_eq!(h.dev.inject_rx(0, &frame), Ok(3));
    h.service();

    let got = h.stack.take_received();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, h.knet.netif(id).unwrap().ifindex);
    assert_eq!(&got[0].1[..], &l2[..]);

    let c = h.knet.channel_counters(0).unwrap();
    assert_eq!(c.packets, 1);
    assert_eq!(c.bytes, 356);
    assert_eq!(c.assembly_errors, 0);
    let n = h.knet.netif_counters(id).unwrap();
    assert_eq!(n.rx_packets, 1);
    assert_eq!(n.rx_bytes, 300);
    assert_eq!(h.knet.buffers_outstanding(), 8);
}

#[test]
#[serial]
fn fragment_without_start_is_dropped() {
    let (h, _) = harness(SopPolicy::Restart);
    h.dev.inject_rx_fragment(0, &[0u8; 64], false, true, false).unwrap();
    h.service();

    let c = h.knet.channel_counters(0).unwrap();
    assert_eq!(c.assembly_errors, 1);
    assert_eq!(c.packets, 0);
    assert!(h.stack.take_received().is_empty());
    assert_eq!(h.knet.buffers_outstanding(), 8);
}

#[test]
#[serial]
fn oversized_descriptor_is_dropped() {
    let (h, id) = harness(SopPolicy::Restart);
    let l2 = eth_frame(HOST_MAC, PEER_MAC, 0x0800, 300);
    let frame = device_frame(&RxHeader::new(3, 7), &l2);

    // An open packet is discarded along with the bad fragment.
    h.dev.inject_rx_fragment(0, &frame[..FRAG], true, false, false).unwrap();
    h.dev.inject_rx_bad_size(0, 4096).unwrap();
    h.service();

    let c = h.knet.channel_counters(0).unwrap();
    assert_eq!((c.packets, c.dropped, c.assembly_errors), (0, 1, 1));
    assert!(h.stack.take_received().is_empty());
    assert_eq!(h.knet.buffers_outstanding(), 8);
    assert_eq!(h.knet.channel_info(0).unwrap().state, Some(ChannelState::Armed));
    assert!(!h.dev.irq_masked(0));

    h.receive(0, &frame);
    let got = h.stack.take_received();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, h.knet.netif(id).unwrap().ifindex);
    assert_eq!(&got[0].1[..], &l2[..]);
}

#[test]
#[serial]
fn restart_on_unexpected_start() {
    let (h, _) = harness(SopPolicy::Restart);
    let frame = device_frame(
        &RxHeader::new(3, 7),
        &eth_frame(HOST_MAC, PEER_MAC, 0x0800, 300),
    );

    // Head of a packet whose tail never arrives.
    h.dev.inject_rx_fragment(0, &frame[..FRAG], true, false, false).unwrap();
    h.dev.inject_rx(0, &frame).unwrap();
    h.service();

    let c = h.knet.channel_counters(0).unwrap();
    assert_eq!(c.assembly_errors, 1);
    assert_eq!(c.packets, 1);
    assert_eq!(h.stack.take_received().len(), 1);
}

#[test]
#[serial]
fn strict_policy_skips_to_next_end() {
    let (h, _) = harness(SopPolicy::Strict);
    let frame = device_frame(
        &RxHeader::new(3, 7),
        &eth_frame(HOST_MAC, PEER_MAC, 0x0800, 300),
    );

    h.dev.inject_rx_fragment(0, &frame[..FRAG], true, false, false).unwrap();
    h.dev.inject_rx(0, &frame).unwrap();
    h.service();
    // The partial packet and the frame that interrupted it are both gone.
    assert_eq!(h.knet.channel_counters(0).unwrap().packets, 0);
    assert_eq!(h.knet.channel_counters(0).unwrap().assembly_errors, 1);

    h.receive(0, &frame);
    assert_eq!(h.knet.channel_counters(0).unwrap().packets, 1);
    assert_eq!(h.stack.take_received().len(), 1);
}

#[test]
#[serial]
fn packet_wraps_the_ring() {
    let (h, _) = harness(SopPolicy::Restart);
    let frame = device_frame(
        &RxHeader::new(3, 7),
        &eth_frame(HOST_MAC, PEER_MAC, 0x0800, 300),
    );
    // Three descriptors per frame on an 8-slot ring: the fourth frame crosses slot 7.
    for _ in 0..4 {
        h.receive(0, &frame);
    }
    assert_eq!(h.knet.channel_counters(0).unwrap().packets, 4);
    assert_eq!(h.stack.take_received().len(), 4);
    let info = h.knet.channel_info(0).unwrap();
    assert_eq!(info.pop_idx, 12 % 8);
}
