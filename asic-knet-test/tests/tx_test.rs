//! Interface transmit through the simulated device.

use asic_knet::tx::TxError;
use asic_knet::{Errno, Error};
use asic_knet_test::Harness;
use asic_knet_test::frame::{HOST_MAC, PEER_MAC, eth_frame, split_tx};

use serial_test::serial;

#[test]
#[serial]
fn header_carries_class_and_port() {
    let h = Harness::new();
    let id = h.knet.create_netif("swp5", 5, HOST_MAC).unwrap();
    h.knet.set_netif_attrs(id, |a| a.tc = 3).unwrap();

    let short = eth_frame(PEER_MAC, HOST_MAC, 0x0800, 20);
    h.knet.netif_transmit(id, &short).unwrap();
    let sent = h.flush_tx(1);
    assert_eq!(sent.len(), 1);

    let f = &sent[0];
    assert_eq!(f.len(), 52 + 60 + 4);
    let (pph, l2) = split_tx(f);
    assert_eq!(pph.tc(), 3);
    assert_eq!(pph.dst_idx(), 5);
    assert_eq!(pph.src_idx(), 256);
    assert_eq!(pph.skip_ipp(), 1);
    assert_eq!(pph.skip_epp(), 1);
    assert!(l2.len() >= 60);
    assert_eq!(&l2[..20], &short[..]);
    assert!(l2[20..].iter().all(|b| *b == 0));

    let n = h.knet.netif_counters(id).unwrap();
    assert_eq!((n.tx_packets, n.tx_bytes), (1, 20));
    assert_eq!(h.knet.channel_counters(1).unwrap().packets, 1);
    assert_eq!(h.knet.buffers_outstanding(), 8);
}

#[test]
#[serial]
fn full_ring_reports_busy() {
    let h = Harness::new();
    let id = h.knet.create_netif("swp5", 5, HOST_MAC).unwrap();
    let frame = eth_frame(PEER_MAC, HOST_MAC, 0x0800, 64);

    for _ in 0..7 {
        h.knet.netif_transmit(id, &frame).unwrap();
    }
    let err = h.knet.netif_transmit(id, &frame).unwrap_err();
    assert!(matches!(err, Error::Tx(TxError::Busy)));
    assert_eq!(err.errno(), Errno::EBUSY);
    let n = h.knet.netif_counters(id).unwrap();
    assert_eq!((n.tx_packets, n.tx_fifo_errors, n.tx_dropped), (7, 1, 1));
    assert_eq!(h.knet.channel_info(1).unwrap().in_flight, 7);

    assert_eq!(h.flush_tx(1).len(), 7);
    assert_eq!(h.knet.channel_info(1).unwrap().in_flight, 0);
    h.knet.netif_transmit(id, &frame).unwrap();

    h.knet.clear_netif_counters(id).unwrap();
    assert_eq!(h.knet.netif_counters(id).unwrap().tx_packets, 0);
}

#[test]
#[serial]
fn oversized_frame_is_rejected() {
    let h = Harness::new();
    let id = h.knet.create_netif("swp5", 5, HOST_MAC).unwrap();
    let big = vec![0u8; 10200];
    let err = h.knet.netif_transmit(id, &big).unwrap_err();
    assert!(matches!(err, Error::Tx(TxError::TooLong { .. })));
    assert_eq!(h.knet.netif_counters(id).unwrap().tx_errors, 1);
    assert!(matches!(
        h.knet.netif_transmit(99, &big),
        Err(Error::NotFound)
    ));
}
