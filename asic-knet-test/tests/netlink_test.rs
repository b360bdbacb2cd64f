//! Netlink forwarding: sample and mirror-on-drop messages.

use asic_knet::netlink::{attrs, mod_attr, sample_attr};
use asic_knet::profile::{Action, NetlinkTarget, ProfileSpec, ReasonMatch};
use asic_knet::rx::{MOD_DEFAULT_DMAC, reason};
use asic_knet::Error;
use asic_knet_test::Harness;
use asic_knet_test::frame::{HOST_MAC, PEER_MAC, RxHeader, device_frame, eth_frame};

use serial_test::serial;

fn attr<'a>(msg: &'a [u8], ty: u16) -> &'a [u8] {
    attrs(msg)
        .find(|(t, _)| *t == ty)
        .map(|(_, v)| v)
        .unwrap_or_else(|| panic!("attribute {ty} missing"))
}

fn u32_attr(msg: &[u8], ty: u16) -> u32 {
    u32::from_ne_bytes(attr(msg, ty).try_into().unwrap())
}

fn u16_attr(msg: &[u8], ty: u16) -> u16 {
    u16::from_ne_bytes(attr(msg, ty).try_into().unwrap())
}

struct Setup {
    h: Harness,
    swp1: u32,
    swp2: u32,
}

fn setup() -> Setup {
    let h = Harness::new();
    let id = h.knet.create_netlink("psample", &["packets", "drops"]).unwrap();
    assert_eq!(h.knet.netlink(id).unwrap().groups, vec!["packets", "drops"]);
    assert_eq!(h.sink.families(), vec!["psample".to_string()]);

    let swp1 = h.knet.create_netif("swp1", 1, HOST_MAC).unwrap();
    let swp2 = h.knet.create_netif("swp2", 2, HOST_MAC).unwrap();
    h.knet
        .set_netif_attrs(swp1, |a| {
            a.igr_sample_rate = 4096;
            a.egr_sample_rate = 512;
        })
        .unwrap();
    h.knet
        .create_profile(
            ProfileSpec::new("sample", 0, Action::Netlink(NetlinkTarget::new("psample", "packets")))
                .reason(ReasonMatch::only(&[reason::INGRESS_SAMPLE, reason::EGRESS_SAMPLE])),
        )
        .unwrap();
    h.knet
        .create_profile(
            ProfileSpec::new("mod", 1, Action::Netlink(NetlinkTarget::new("psample", "drops")))
                .reason(ReasonMatch::only(&[reason::MOD])),
        )
        .unwrap();
    h.knet.start_rx().unwrap();
    Setup { h, swp1, swp2 }
}

#[test]
#[serial]
fn ingress_and_egress_samples() {
    let Setup { h, swp1, swp2 } = setup();
    let l2 = eth_frame(HOST_MAC, PEER_MAC, 0x0800, 64);
    let hdr = RxHeader {
        dst_idx: 2,
        ..RxHeader::new(1, reason::INGRESS_SAMPLE)
    };
    h.receive(0, &device_frame(&hdr, &l2));
    h.receive(0, &device_frame(&hdr, &l2));
    let egress = RxHeader {
        dst_idx: 2,
        ..RxHeader::new(1, reason::EGRESS_SAMPLE)
    };
    h.receive(0, &device_frame(&egress, &l2));

    let sent = h.sink.take_sent();
    assert_eq!(sent.len(), 3);
    let if1 = h.knet.netif(swp1).unwrap().ifindex as u16;
    let if2 = h.knet.netif(swp2).unwrap().ifindex as u16;
    for (i, (family, group, msg)) in sent.iter().enumerate() {
        assert_eq!(family, "psample");
        assert_eq!(group, "packets");
        assert_eq!(u16_attr(msg, sample_attr::IIFINDEX), if1);
        assert_eq!(u16_attr(msg, sample_attr::OIFINDEX), if2);
        assert_eq!(u32_attr(msg, sample_attr::ORIGSIZE), 64);
        assert_eq!(attr(msg, sample_attr::DATA), &l2[..]);
        if i < 2 {
            assert_eq!(u32_attr(msg, sample_attr::SAMPLE_GROUP), 1);
            assert_eq!(u32_attr(msg, sample_attr::GROUP_SEQ), i as u32);
            assert_eq!(u32_attr(msg, sample_attr::SAMPLE_RATE), 4096);
        }
    }
    let msg = &sent[2].2;
    assert_eq!(u32_attr(msg, sample_attr::SAMPLE_GROUP), 2);
    assert_eq!(u32_attr(msg, sample_attr::GROUP_SEQ), 0);
    assert_eq!(u32_attr(msg, sample_attr::SAMPLE_RATE), 512);

    assert_eq!(h.knet.netlink_counters().sent, 3);
    assert_eq!(h.knet.dispatch_counters().netlink, 3);
}

#[test]
#[serial]
fn unknown_egress_falls_back_to_ingress() {
    let Setup { h, swp1, .. } = setup();
    let hdr = RxHeader {
        dst_idx: 200,
        ..RxHeader::new(1, reason::INGRESS_SAMPLE)
    };
    h.receive(0, &device_frame(&hdr, &eth_frame(HOST_MAC, PEER_MAC, 0x0800, 64)));
    let sent = h.sink.take_sent();
    let if1 = h.knet.netif(swp1).unwrap().ifindex as u16;
    assert_eq!(u16_attr(&sent[0].2, sample_attr::OIFINDEX), if1);
}

#[test]
#[serial]
fn mirror_on_drop_copy() {
    let Setup { h, .. } = setup();
    let l2 = eth_frame(MOD_DEFAULT_DMAC, PEER_MAC, 0x0800, 64);
    h.receive(0, &device_frame(&RxHeader::new(2, 3), &l2));

    let sent = h.sink.take_sent();
    assert_eq!(sent.len(), 1);
    let (_, group, msg) = &sent[0];
    assert_eq!(group, "drops");
    assert_eq!(u32_attr(msg, mod_attr::IGR_PORT), 2);
    assert_eq!(attr(msg, mod_attr::DATA), &l2[..]);
    assert_eq!(h.knet.reason_counters(reason::MOD).unwrap().0, 1);

    // A configured MOD address replaces the stamped one.
    let mac = [0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE];
    h.knet.set_mod_dmac(mac);
    assert_eq!(h.knet.mod_dmac(), mac);
    h.receive(0, &device_frame(&RxHeader::new(2, 3), &l2));
    let sent = h.sink.take_sent();
    assert_eq!(&attr(&sent[0].2, mod_attr::DATA)[..6], &mac[..]);

    h.knet.set_mod_dmac(MOD_DEFAULT_DMAC);
    assert_eq!(h.knet.mod_dmac(), MOD_DEFAULT_DMAC);
}

#[test]
#[serial]
fn missing_target_and_sink_failures_are_counted() {
    let Setup { h, .. } = setup();
    h.knet
        .create_profile(
            ProfileSpec::new("lost", 0, Action::Netlink(NetlinkTarget::new("nosuch", "x")))
                .reason(ReasonMatch::only(&[9])),
        )
        .unwrap();
    h.receive(0, &device_frame(&RxHeader::new(1, 9), &eth_frame(HOST_MAC, PEER_MAC, 0x0800, 64)));
    assert_eq!(h.knet.netlink_counters().no_target, 1);

    h.sink.set_failing(true);
    let hdr = RxHeader::new(1, reason::INGRESS_SAMPLE);
    h.receive(0, &device_frame(&hdr, &eth_frame(HOST_MAC, PEER_MAC, 0x0800, 64)));
    assert_eq!(h.knet.netlink_counters().send_errors, 1);
    assert!(h.sink.take_sent().is_empty());
    assert_eq!(h.knet.buffers_outstanding(), 8);
}

#[test]
#[serial]
fn family_lifecycle() {
    let h = Harness::new();
    let id = h.knet.create_netlink("psample", &["packets"]).unwrap();
    assert!(matches!(
        h.knet.create_netlink("psample", &["other"]),
        Err(Error::Exists)
    ));
    assert!(h.knet.create_netlink("nogroups", &[]).is_err());
    assert_eq!(h.knet.netlinks().len(), 1);

    h.knet.destroy_netlink(id).unwrap();
    assert!(h.sink.families().is_empty());
    assert!(matches!(h.knet.netlink(id), Err(Error::NotFound)));
}
