//! knet simulator
//!
//! Pushes synthetic traffic through the full receive pipeline over a simulated switch ASIC:
//! descriptor rings, interrupt top half, deferred bottom halves, classification and dispatch.
//! At the end it prints channel, interface and dispatch counters.
//!
//! # Usage
//!
//! ```bash
//! # 100k frames to the host stack on four interfaces, two worker threads
//! knet-sim --packets 100000 --ports 4
//!
//! # Park everything in the SDK queue, consumed inline without worker threads
//! knet-sim --preset sdk --workers 0
//!
//! # Sample to a netlink group, and echo stack deliveries back out
//! knet-sim --preset sample --echo
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use asic_knet::profile::{Action, NetlinkTarget, ProfileSpec, ReasonMatch};
use asic_knet::runtime::{Executor, TokioExecutor};
use asic_knet::rx::reason;
use asic_knet::{DriverConfig, Knet};
use asic_knet_test::frame::{HOST_MAC, PEER_MAC, RxHeader, device_frame, eth_frame};
use asic_knet_test::{ManualExecutor, RecordingSink, RecordingStack, SimAsic, SimError, build, tiny_geometry};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Consecutive refused injections before the run is declared stalled.
const STALL_LIMIT: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Preset {
    /// No rules: everything goes to the host stack
    Netdev,
    /// Catch-all rule into the SDK queue
    Sdk,
    /// Ingress samples to a netlink group
    Sample,
    /// Catch-all drop rule
    Drop,
}

#[derive(Parser, Debug)]
#[command(name = "knet-sim")]
#[command(about = "Drive the knet pipeline over a simulated switch ASIC")]
struct Args {
    /// Rule set to install
    #[arg(short = 'P', long, value_enum, default_value = "netdev")]
    preset: Preset,

    /// Number of frames to inject
    #[arg(short, long, default_value = "10000")]
    packets: u64,

    /// Ethernet frame length (without device header and trailer)
    #[arg(short, long, default_value = "256")]
    size: usize,

    /// Descriptors per ring
    #[arg(long, default_value = "64")]
    ring_size: u32,

    /// Receive buffer size
    #[arg(long, default_value = "2048")]
    frag_size: usize,

    /// Interfaces to create, one per logical port
    #[arg(long, default_value = "4")]
    ports: u32,

    /// Worker threads for deferred work; 0 runs it inline
    #[arg(short, long, default_value = "2")]
    workers: usize,

    /// Transmit every frame the host stack receives back out of its interface
    #[arg(long)]
    echo: bool,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,
}

struct Sim {
    knet: Knet,
    dev: Arc<SimAsic>,
    stack: Arc<RecordingStack>,
    sink: Arc<RecordingSink>,
    inline: Option<Arc<ManualExecutor>>,
    /// Host interface index to interface id.
    ifindex: HashMap<u32, u32>,
    echo: bool,
    tx_channel: u32,
}

#[derive(Debug, Default)]
struct Consumed {
    stack: u64,
    sdk: u64,
    netlink: u64,
    echoed: u64,
    echo_busy: u64,
}

impl Sim {
    /// Run the top half while the line is raised, then any inline deferred work.
    fn service(&self) {
        while self.dev.irq_line() {
            self.knet.handle_irq();
        }
        if let Some(exec) = &self.inline {
            exec.run_pending();
        }
    }

    /// Empty every consumer queue so buffers flow back to the pool.
    fn consume(&self, out: &mut Consumed) {
        for (ifindex, frame) in self.stack.take_received() {
            out.stack += 1;
            if !self.echo {
                continue;
            }
            let Some(&id) = self.ifindex.get(&ifindex) else {
                continue;
            };
            match self.knet.netif_transmit(id, &frame) {
                Ok(()) => out.echoed += 1,
                Err(_) => out.echo_busy += 1,
            }
        }
        while self.knet.sdk_queue_len() > 0 {
            if self.knet.sdk_receive(Some(Duration::ZERO)).is_err() {
                break;
            }
            out.sdk += 1;
        }
        out.netlink += self.sink.take_sent().len() as u64;
        if self.dev.complete_tx(self.tx_channel) > 0 {
            self.dev.take_tx();
        }
    }
}

fn install(knet: &Knet, preset: Preset) -> u16 {
    match preset {
        Preset::Netdev => 1,
        Preset::Sdk => {
            knet.create_profile(ProfileSpec::new("sdk", 0, Action::SdkQueue))
                .expect("create sdk rule");
            1
        }
        Preset::Sample => {
            knet.create_netlink("psample", &["packets"])
                .expect("register netlink family");
            knet.create_profile(
                ProfileSpec::new(
                    "sample",
                    0,
                    Action::Netlink(NetlinkTarget::new("psample", "packets")),
                )
                .reason(ReasonMatch::only(&[reason::INGRESS_SAMPLE])),
            )
            .expect("create sample rule");
            reason::INGRESS_SAMPLE
        }
        Preset::Drop => {
            knet.create_profile(ProfileSpec::new("drop", 0, Action::Drop))
                .expect("create drop rule");
            1
        }
    }
}

fn main() {
    let args = Args::parse();

    // Initialize tracing - respects RUST_LOG, defaults to info (debug with -v) if not set
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_ansi(false)
        .init();

    info!(?args, "starting");

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        warn!("Received Ctrl+C, stopping injection");
        stop_clone.store(true, Ordering::Relaxed);
    })
    .expect("Failed to set Ctrl+C handler");

    let config = DriverConfig::new()
        .geometry(tiny_geometry())
        .ring_size(args.ring_size)
        .frag_size(args.frag_size);
    let tx_channel = config.netif_tx_channel;

    let inline = (args.workers == 0).then(|| Arc::new(ManualExecutor::new()));
    let exec: Arc<dyn Executor> = match &inline {
        Some(m) => m.clone(),
        None => Arc::new(TokioExecutor::new(args.workers).expect("start tokio executor")),
    };
    let (knet, dev, stack, sink) = build(config, exec);

    let mut ifindex = HashMap::new();
    for port in 0..args.ports {
        let id = knet
            .create_netif(&format!("swp{port}"), port, HOST_MAC)
            .expect("create netif");
        let info = knet.netif(id).expect("netif exists");
        ifindex.insert(info.ifindex, id);
    }
    let cpu_reason = install(&knet, args.preset);
    knet.start_rx().expect("start rx");

    let sim = Sim {
        knet,
        dev,
        stack,
        sink,
        inline,
        ifindex,
        echo: args.echo,
        tx_channel,
    };

    let l2 = eth_frame(HOST_MAC, PEER_MAC, 0x0800, args.size);
    let frames: Vec<Vec<u8>> = (0..args.ports.max(1))
        .map(|port| device_frame(&RxHeader::new(port as u16, cpu_reason), &l2))
        .collect();

    let mut consumed = Consumed::default();
    let (mut injected, mut refused, mut stalled) = (0u64, 0u64, 0u64);
    let start = Instant::now();
    while injected < args.packets && !stop.load(Ordering::Relaxed) {
        let frame = &frames[(injected % frames.len() as u64) as usize];
        match sim.dev.inject_rx(0, frame) {
            Ok(_) => {
                injected += 1;
                stalled = 0;
            }
            Err(SimError::NoDescriptor { .. }) => {
                refused += 1;
                stalled += 1;
                if stalled >= STALL_LIMIT {
                    error!(injected, "no descriptors returned, giving up");
                    break;
                }
                std::thread::yield_now();
            }
            Err(e) => {
                error!(?e, "injection failed");
                break;
            }
        }
        sim.service();
        sim.consume(&mut consumed);
    }

    // Let in-flight deferred work settle.
    for _ in 0..100 {
        sim.service();
        sim.consume(&mut consumed);
        if sim.inline.is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    let elapsed = start.elapsed();

    let rx = sim.knet.channel_counters(0).expect("rx channel");
    let pps = rx.packets as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        injected,
        refused,
        elapsed_ms = elapsed.as_millis() as u64,
        pps = pps as u64,
        "run finished"
    );
    info!(?consumed, "consumers");
    info!(counters = ?rx, "rx channel 0");
    if let Ok(tx) = sim.knet.channel_counters(tx_channel) {
        info!(counters = ?tx, "tx channel {tx_channel}");
    }
    for n in sim.knet.netifs() {
        if let Ok(c) = sim.knet.netif_counters(n.id) {
            info!(name = %n.name, ifindex = n.ifindex, rx = c.rx_packets, tx = c.tx_packets, "netif");
        }
    }
    info!(counters = ?sim.knet.dispatch_counters(), "dispatch");
    info!(counters = ?sim.knet.sdk_queue_counters(), "sdk queue");
    info!(counters = ?sim.knet.netlink_counters(), "netlink");
    for (r, packets, bytes) in sim.knet.reason_counters_all() {
        info!(reason = r, packets, bytes, "reason");
    }

    sim.knet.shutdown();
    info!(outstanding = sim.knet.buffers_outstanding(), "shut down");
}
