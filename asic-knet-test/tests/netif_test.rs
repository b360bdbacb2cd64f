//! Interface table and delivery to the host stack.

use asic_knet::netif::VlanPolicy;
use asic_knet::{Errno, Error};
use asic_knet_test::Harness;
use asic_knet_test::frame::{HOST_MAC, PEER_MAC, RxHeader, STP_MAC, device_frame, eth_frame, tagged};

use serial_test::serial;

#[test]
#[serial]
fn create_and_destroy() {
    let h = Harness::new();
    let a = h.knet.create_netif("swp1", 1, HOST_MAC).unwrap();
    let b = h.knet.create_netif("swp2", 2, PEER_MAC).unwrap();
    assert_eq!((a, b), (0, 1));

    let reg = h.stack.registered();
    assert_eq!(reg.len(), 2);
    assert_eq!(reg[0], (100, "swp1".to_string(), HOST_MAC));
    let info = h.knet.netif(b).unwrap();
    assert_eq!((info.ifindex, info.port_di, info.mac), (101, 2, PEER_MAC));

    assert!(matches!(h.knet.create_netif("swp1", 3, HOST_MAC), Err(Error::Exists)));
    assert!(matches!(h.knet.create_netif("swp3", 2, HOST_MAC), Err(Error::Exists)));
    assert!(matches!(h.knet.create_netif("swp3", 288, HOST_MAC), Err(Error::InvalidPort(288))));
    let err = h.knet.create_netif("a-very-long-name", 3, HOST_MAC).unwrap_err();
    assert!(matches!(err, Error::NameTooLong));
    assert_eq!(err.errno(), Errno::ENAMETOOLONG);
    assert!(matches!(h.knet.create_netif("", 3, HOST_MAC), Err(Error::InvalidArgument(_))));

    h.knet.destroy_netif(a).unwrap();
    assert_eq!(h.stack.registered().len(), 1);
    assert!(matches!(h.knet.netif(a), Err(Error::NotFound)));
    assert!(matches!(h.knet.destroy_netif(a), Err(Error::NotFound)));

    // The freed id is handed out again.
    assert_eq!(h.knet.create_netif("swp9", 9, HOST_MAC).unwrap(), 0);
    let names: Vec<_> = h.knet.netifs().into_iter().map(|n| n.name).collect();
    assert_eq!(names, vec!["swp9", "swp2"]);
}

#[test]
#[serial]
fn moved_interface_follows_its_port() {
    let h = Harness::new();
    let id = h.knet.create_netif("swp1", 1, HOST_MAC).unwrap();
    h.knet.create_netif("swp2", 2, HOST_MAC).unwrap();
    h.knet.start_rx().unwrap();

    assert!(matches!(h.knet.set_netif(id, None, Some(2)), Err(Error::Exists)));
    h.knet.set_netif(id, Some(PEER_MAC), Some(4)).unwrap();
    let info = h.knet.netif(id).unwrap();
    assert_eq!((info.port_di, info.mac), (4, PEER_MAC));

    let l2 = eth_frame(HOST_MAC, PEER_MAC, 0x0800, 64);
    h.receive(0, &device_frame(&RxHeader::new(4, 1), &l2));
    h.receive(0, &device_frame(&RxHeader::new(1, 1), &l2));
    let got = h.stack.take_received();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, info.ifindex);
    assert_eq!(h.knet.channel_counters(0).unwrap().netdev_miss, 1);
}

#[test]
#[serial]
fn vlan_policies() {
    let h = Harness::new();
    let id = h.knet.create_netif("swp1", 1, HOST_MAC).unwrap();
    h.knet.start_rx().unwrap();
    let l2 = eth_frame(HOST_MAC, PEER_MAC, 0x0800, 64);
    let hdr = RxHeader {
        vlan: 100,
        vlan_pop: 1,
        ..RxHeader::new(1, 1)
    };

    // Strip: the reported tag is popped.
    h.receive(0, &device_frame(&hdr, &tagged(&l2, 100)));
    let got = h.stack.take_received();
    assert_eq!(&got[0].1[..], &l2[..]);

    // Keep: untagged frames get the ingress VLAN.
    h.knet.set_netif_attrs(id, |a| a.vlan_policy = VlanPolicy::Keep).unwrap();
    h.receive(0, &device_frame(&hdr, &l2));
    let got = h.stack.take_received();
    assert_eq!(&got[0].1[..], &tagged(&l2, 100)[..]);

    // Original: delivered as received.
    h.knet.set_netif_attrs(id, |a| a.vlan_policy = VlanPolicy::Original).unwrap();
    h.receive(0, &device_frame(&hdr, &tagged(&l2, 100)));
    let got = h.stack.take_received();
    assert_eq!(&got[0].1[..], &tagged(&l2, 100)[..]);

    // BPDUs are always tagged.
    h.knet.set_netif_attrs(id, |a| a.vlan_policy = VlanPolicy::Strip).unwrap();
    let bpdu = eth_frame(STP_MAC, PEER_MAC, 0x0026, 64);
    h.receive(0, &device_frame(&hdr, &bpdu));
    let got = h.stack.take_received();
    assert_eq!(&got[0].1[..], &tagged(&bpdu, 100)[..]);

    let n = h.knet.netif_counters(id).unwrap();
    assert_eq!(n.rx_packets, 4);
    assert_eq!(n.rx_bytes, 64 + 68 + 64 + 68);
}

#[test]
#[serial]
fn reason_counters_per_interface() {
    let h = Harness::new();
    let a = h.knet.create_netif("swp1", 1, HOST_MAC).unwrap();
    let b = h.knet.create_netif("swp2", 2, HOST_MAC).unwrap();
    h.knet.start_rx().unwrap();

    let l2 = eth_frame(HOST_MAC, PEER_MAC, 0x0800, 100);
    h.receive(0, &device_frame(&RxHeader::new(1, 40), &l2));
    h.receive(0, &device_frame(&RxHeader::new(1, 40), &l2));
    h.receive(0, &device_frame(&RxHeader::new(2, 41), &l2));

    assert_eq!(h.knet.netif_reason_counters(a).unwrap(), vec![(40, 2, 200)]);
    assert_eq!(h.knet.netif_reason_counters(b).unwrap(), vec![(41, 1, 100)]);
    // Global counters include the trailer.
    assert_eq!(h.knet.reason_counters(40).unwrap(), (2, 2 * 104));
    assert_eq!(
        h.knet.reason_counters_all(),
        vec![(40, 2, 208), (41, 1, 104)]
    );

    h.knet.clear_netif_reason_counters(a).unwrap();
    assert!(h.knet.netif_reason_counters(a).unwrap().is_empty());
    h.knet.clear_reason_counters();
    assert!(h.knet.reason_counters_all().is_empty());
    assert!(matches!(h.knet.reason_counters(4096), Err(Error::InvalidArgument(_))));
}
