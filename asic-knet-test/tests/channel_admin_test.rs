//! Channel faults, administrative reset, general channels and teardown.

use std::time::Duration;

use asic_knet::dma::ChannelState;
use asic_knet::profile::{Action, ProfileSpec, ReasonMatch};
use asic_knet::tx::TxError;
use asic_knet::{DriverConfig, Error};
use asic_knet_test::{Harness, tiny_geometry};
use asic_knet_test::frame::{HOST_MAC, PEER_MAC, RxHeader, device_frame, eth_frame};

use serial_test::serial;

fn frame() -> Vec<u8> {
    device_frame(&RxHeader::new(1, 9), &eth_frame(HOST_MAC, PEER_MAC, 0x0800, 64))
}

#[test]
#[serial]
fn error_interrupt_faults_until_reset() {
    let h = Harness::new();
    h.knet.create_netif("swp1", 1, HOST_MAC).unwrap();
    h.knet.start_rx().unwrap();

    h.dev.raise_error(0);
    let status = h.knet.handle_irq();
    assert_eq!(status.errors, 1);
    assert_eq!(status.scheduled, 0);
    assert!(h.dev.irq_masked(0));
    assert!(h.dev.error_masked(0));
    let info = h.knet.channel_info(0).unwrap();
    assert_eq!(info.state, Some(ChannelState::Faulted));
    assert_eq!(h.knet.channel_counters(0).unwrap().error_interrupts, 1);

    // Completions on a faulted channel stay unserviced.
    h.dev.inject_rx(0, &frame()).unwrap();
    assert_eq!(h.knet.handle_irq().scheduled, 0);
    assert!(h.stack.take_received().is_empty());

    h.knet.reset_channel(0).unwrap();
    let info = h.knet.channel_info(0).unwrap();
    assert_eq!(info.state, Some(ChannelState::Armed));
    assert_eq!((info.work_idx, info.pop_idx, info.in_flight), (7, 0, 7));
    assert_eq!(h.knet.buffers_outstanding(), 8);
    assert!(!h.dev.irq_masked(0));
    assert!(!h.dev.error_masked(0));

    h.receive(0, &frame());
    assert_eq!(h.stack.take_received().len(), 1);
}

#[test]
#[serial]
fn error_descriptor_faults_channel() {
    let h = Harness::new();
    h.knet.start_rx().unwrap();

    h.dev.inject_rx_fragment(0, &frame(), true, true, true).unwrap();
    h.service();
    let info = h.knet.channel_info(0).unwrap();
    assert_eq!(info.state, Some(ChannelState::Faulted));
    assert!(h.dev.irq_masked(0));
    let c = h.knet.channel_counters(0).unwrap();
    assert_eq!((c.dropped, c.packets), (1, 0));
    assert_eq!(h.knet.buffers_outstanding(), 8);

    h.knet.reset_channel(0).unwrap();
    assert_eq!(h.knet.channel_info(0).unwrap().state, Some(ChannelState::Armed));
}

#[test]
#[serial]
fn refill_failure_on_faulted_channel_stays_masked() {
    let h = Harness::with_config(DriverConfig::new().geometry(tiny_geometry()).buffer_limit(8));
    h.knet.create_netif("swp1", 1, HOST_MAC).unwrap();
    h.knet.start_rx().unwrap();

    h.dev.inject_rx(0, &frame()).unwrap();
    assert_eq!(h.knet.handle_irq().scheduled, 1);
    h.dev.raise_error(0);
    assert_eq!(h.knet.handle_irq().errors, 1);
    // The posted unit drains onto a faulted ring and cannot refill.
    h.exec.run_pending();

    let info = h.knet.channel_info(0).unwrap();
    assert_eq!(info.state, Some(ChannelState::Faulted));
    assert!(!info.recovering);
    assert!(h.dev.irq_masked(0));
    assert_eq!(h.exec.queued(), 0);
    let c = h.knet.channel_counters(0).unwrap();
    assert_eq!((c.no_memory, c.err_recover, c.recovery_retries), (1, 0, 0));

    h.stack.take_received();
    h.knet.reset_channel(0).unwrap();
    assert_eq!(h.knet.channel_info(0).unwrap().state, Some(ChannelState::Armed));
    assert!(!h.dev.irq_masked(0));
    h.receive(0, &frame());
    assert_eq!(h.stack.take_received().len(), 1);
}

#[test]
#[serial]
fn reset_while_stopped_keeps_rx_disabled() {
    let h = Harness::new();
    h.knet.reset_channel(0).unwrap();
    let info = h.knet.channel_info(0).unwrap();
    assert_eq!(info.state, Some(ChannelState::Disabled));
    assert_eq!(info.in_flight, 7);
    assert!(!h.dev.is_enabled(0));
    assert_eq!(h.knet.buffers_outstanding(), 8);
}

#[test]
#[serial]
fn faulted_tx_channel_is_down() {
    let h = Harness::new();
    let id = h.knet.create_netif("swp1", 1, HOST_MAC).unwrap();
    let l2 = eth_frame(PEER_MAC, HOST_MAC, 0x0800, 64);

    h.dev.raise_error(1);
    let status = h.knet.handle_irq();
    assert_eq!(status.errors, 1 << 1);
    assert_eq!(h.knet.channel_info(1).unwrap().state, Some(ChannelState::Faulted));
    assert!(matches!(
        h.knet.netif_transmit(id, &l2),
        Err(Error::Tx(TxError::Down))
    ));
    assert_eq!(h.knet.netif_counters(id).unwrap().tx_errors, 1);

    h.knet.reset_channel(1).unwrap();
    h.knet.netif_transmit(id, &l2).unwrap();
    assert_eq!(h.flush_tx(1).len(), 1);
}

#[test]
#[serial]
fn general_channels() {
    let h = Harness::new();
    assert!(matches!(h.knet.reset_channel(2), Err(Error::InvalidChannel(2))));
    assert!(matches!(h.knet.reset_channel(9), Err(Error::InvalidChannel(9))));
    assert!(matches!(h.knet.channel_counters(9), Err(Error::InvalidChannel(9))));
    assert_eq!(h.knet.channel_info(3).unwrap().state, None);

    h.dev.raise_irq(2);
    assert!(h.dev.irq_line());
    let status = h.knet.handle_irq();
    assert_eq!(status.general, 1 << 2);
    assert_eq!(status.scheduled, 0);
    assert!(!h.dev.irq_line());
    assert_eq!(h.knet.channel_counters(2).unwrap().interrupts, 1);

    h.knet.clear_channel_counters(2).unwrap();
    assert_eq!(h.knet.channel_counters(2).unwrap().interrupts, 0);
}

#[test]
#[serial]
fn shutdown_frees_everything() {
    let h = Harness::new();
    let id = h.knet.create_netif("swp1", 1, HOST_MAC).unwrap();
    h.knet
        .create_profile(
            ProfileSpec::new("sdk", 0, Action::SdkQueue).reason(ReasonMatch::only(&[9])),
        )
        .unwrap();
    h.knet.start_rx().unwrap();

    h.receive(0, &frame());
    h.receive(0, &frame());
    let l2 = eth_frame(PEER_MAC, HOST_MAC, 0x0800, 64);
    h.knet.netif_transmit(id, &l2).unwrap();
    h.knet.netif_transmit(id, &l2).unwrap();
    assert_eq!(h.knet.buffers_outstanding(), 8 + 2 + 2);

    h.knet.shutdown();
    assert_eq!(h.knet.buffers_outstanding(), 0);
    assert!(!h.knet.is_rx_started());
    assert!(!h.dev.is_enabled(0));
    assert!(matches!(
        h.knet.sdk_receive(Some(Duration::ZERO)),
        Err(Error::TimedOut)
    ));
    assert!(matches!(
        h.knet.netif_transmit(id, &l2),
        Err(Error::Tx(TxError::Down))
    ));
    assert_eq!(h.knet.channel_info(0).unwrap().state, None);

    // A second teardown is a no-op.
    h.knet.shutdown();
    assert_eq!(h.knet.buffers_outstanding(), 0);
}
