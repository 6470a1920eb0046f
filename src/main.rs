//! nanmux-sim: drives the dispatcher against the loopback HAL.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Adapters (outer ring)                     │
//! │                                                              │
//! │   LoopbackHal        LogEventSink        MonotonicClock      │
//! │   (HalPort)          (EventSink)         (advance)           │
//! │                                                              │
//! │  ─────────────── Port Trait Boundary ────────────────────    │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │            AwareService (pure logic)                   │  │
//! │  │  Directory · Merger · Registry · MessageQueue          │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `nanmux-sim [config.json]`.  Runs a two-client publish/subscribe
//! exchange, then prints the final service snapshot as JSON.
#![deny(unused_must_use)]

use anyhow::{Context, Result, bail};
use log::info;

use nanmux::adapters::log_sink::LogEventSink;
use nanmux::adapters::sim_hal::LoopbackHal;
use nanmux::adapters::time::MonotonicClock;
use nanmux::app::commands::Request;
use nanmux::app::service::AwareService;
use nanmux::config::ManagerConfig;
use nanmux::request::{Band, ConfigRequest, PublishConfig, SubscribeConfig};
use nanmux::types::{Capabilities, ClientId, MacAddr, SessionId};

const PUBLISHER: ClientId = 1;
const SUBSCRIBER: ClientId = 2;
const PUBLISH_CALLBACK: u64 = 10;
const SUBSCRIBE_CALLBACK: u64 = 20;

/// Upper bound on dispatcher/HAL round trips per step.
const MAX_ROUNDS: usize = 64;

// ── Driver ────────────────────────────────────────────────────

struct Sim {
    service: AwareService,
    hal: LoopbackHal,
    sink: LogEventSink,
    clock: MonotonicClock,
}

impl Sim {
    /// Process until neither the dispatcher nor the HAL has work left.
    fn settle(&mut self) -> Result<()> {
        for _ in 0..MAX_ROUNDS {
            self.service.advance(self.clock.now_ms());
            let handled = self.service.process(&mut self.hal, &mut self.sink);
            let events = self.hal.drain();
            if handled == 0 && events.is_empty() {
                return Ok(());
            }
            for event in events {
                self.service.submit(event);
            }
        }
        bail!("dispatcher did not settle after {MAX_ROUNDS} rounds")
    }

    fn request(&mut self, request: Request) -> Result<()> {
        self.service.submit(request);
        self.settle()
    }

    fn only_session(&self, client_id: ClientId) -> Result<SessionId> {
        self.service
            .session_ids(client_id)
            .first()
            .copied()
            .with_context(|| format!("client {client_id} has no session"))
    }
}

// ── Main ──────────────────────────────────────────────────────

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => ManagerConfig::load(&path)?,
        None => ManagerConfig::default(),
    };
    info!("nanmux-sim v{} ({config:?})", env!("CARGO_PKG_VERSION"));

    let caps = Capabilities {
        supports_suspension: true,
        supports_pairing: true,
        ..Capabilities::default()
    };
    let mut sim = Sim {
        service: AwareService::new(config),
        hal: LoopbackHal::new(caps, MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01])),
        sink: LogEventSink::new(),
        clock: MonotonicClock::new(),
    };

    sim.service.start();
    sim.settle()?;

    // ── Attach ────────────────────────────────────────────────
    sim.request(Request::Connect {
        client_id: PUBLISHER,
        uid: 1000,
        pid: 4001,
        package: "org.example.beacon".into(),
        config: ConfigRequest {
            master_preference: 50,
            ..ConfigRequest::default()
        }
        .with_discovery_window(Band::Band24Ghz, 2),
        wants_identity: false,
    })?;
    sim.request(Request::Connect {
        client_id: SUBSCRIBER,
        uid: 2000,
        pid: 4002,
        package: "org.example.finder".into(),
        config: ConfigRequest::default().with_discovery_window(Band::Band24Ghz, 1),
        wants_identity: true,
    })?;

    // ── Discovery ─────────────────────────────────────────────
    sim.request(Request::Publish {
        client_id: PUBLISHER,
        callback: PUBLISH_CALLBACK,
        config: PublishConfig::new("nanmux.demo")?,
    })?;
    sim.request(Request::Subscribe {
        client_id: SUBSCRIBER,
        callback: SUBSCRIBE_CALLBACK,
        config: SubscribeConfig::new("nanmux.demo")?,
    })?;

    let subscribe_session = sim.only_session(SUBSCRIBER)?;
    let pub_sub_id = sim
        .service
        .session(subscribe_session)
        .map(|s| s.pub_sub_id)
        .context("subscribe session vanished")?;
    sim.hal
        .inject_match(pub_sub_id, 7, MacAddr([0x02, 0, 0, 0, 0, 0x07]), b"hello");
    sim.settle()?;

    let peer_id = sim
        .service
        .session(subscribe_session)
        .and_then(|s| s.peers().next().map(|p| p.peer_id))
        .context("match produced no peer")?;

    // ── Messaging (first attempt NACKed, retry succeeds) ──────
    sim.hal.nack_next(1);
    sim.request(Request::SendMessage {
        client_id: SUBSCRIBER,
        session_id: subscribe_session,
        peer_id,
        message_id: 1,
        payload: b"ping".to_vec(),
        retry_count: 2,
    })?;

    // ── Detach ────────────────────────────────────────────────
    sim.request(Request::Disconnect {
        client_id: PUBLISHER,
    })?;
    sim.request(Request::Disconnect {
        client_id: SUBSCRIBER,
    })?;

    info!(
        "events: {} client, {} session, {} failure(s)",
        sim.sink.client_events, sim.sink.session_events, sim.sink.failures
    );
    println!("{}", sim.service.snapshot().to_json()?);
    Ok(())
}
