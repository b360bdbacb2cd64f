//! Test support for `asic-knet`: a simulated ASIC and recording host collaborators.

pub mod frame;
pub mod host;
pub mod sim;

use std::sync::Arc;

use asic_knet::runtime::Executor;
use asic_knet::{ChipGeometry, DriverConfig, Knet, KnetBuilder};

pub use host::{ManualExecutor, RecordingSink, RecordingStack};
pub use sim::{SimAsic, SimError};

/// Small geometry: one RX and one TX channel with 8-slot rings.
pub fn tiny_geometry() -> ChipGeometry {
    ChipGeometry {
        rx_channels: 1,
        tx_channels: 1,
        total_channels: 4,
        ring_size: 8,
        frag_size: 2048,
        ..ChipGeometry::nb()
    }
}

/// Install a fmt subscriber honoring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_test_writer()
        .try_init();
}

/// A driver instance wired to simulated hardware.
pub struct Harness {
    pub knet: Knet,
    pub dev: Arc<SimAsic>,
    pub exec: Arc<ManualExecutor>,
    pub stack: Arc<RecordingStack>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    /// Build over [`tiny_geometry`] with defaults otherwise.
    pub fn new() -> Self {
        Self::with_config(DriverConfig::new().geometry(tiny_geometry()))
    }

    pub fn with_config(config: DriverConfig) -> Self {
        init_tracing();
        let exec = Arc::new(ManualExecutor::new());
        let (knet, dev, stack, sink) = build(config, exec.clone());
        Self {
            knet,
            dev,
            exec,
            stack,
            sink,
        }
    }

    /// Take one interrupt and run every deferred unit it caused.
    pub fn service(&self) -> usize {
        self.knet.handle_irq();
        self.exec.run_pending()
    }

    /// Receive `frame` on `ch` and process it to completion.
    pub fn receive(&self, ch: u32, frame: &[u8]) {
        self.dev.inject_rx(ch, frame).expect("inject rx");
        self.service();
    }

    /// Complete every queued transmit on `ch` and reclaim it.
    pub fn flush_tx(&self, ch: u32) -> Vec<Vec<u8>> {
        self.dev.complete_tx(ch);
        self.service();
        self.dev.take_tx().into_iter().map(|(_, f)| f).collect()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a driver over a fresh [`SimAsic`] with `exec`.
pub fn build(
    config: DriverConfig,
    exec: Arc<dyn Executor>,
) -> (Knet, Arc<SimAsic>, Arc<RecordingStack>, Arc<RecordingSink>) {
    let dev = Arc::new(SimAsic::new(config.geometry.clone()));
    let stack = Arc::new(RecordingStack::new());
    let sink = Arc::new(RecordingSink::new());
    let knet = KnetBuilder::new()
        .config(config)
        .device(dev.clone())
        .net_stack(stack.clone())
        .broadcast_sink(sink.clone())
        .executor(exec)
        .build()
        .expect("build knet");
    (knet, dev, stack, sink)
}
