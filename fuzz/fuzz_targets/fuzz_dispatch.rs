//! Fuzz target: client API interleaved with firmware behaviour
//!
//! Interprets the input as a script of client requests, simulated matches,
//! NACK bursts, clock jumps and HAL rejections against the loopback HAL.
//! Asserts that no session request is answered twice and that once every
//! client has left nothing is left pending.
//!
//! cargo fuzz run fuzz_dispatch

#![no_main]

use std::collections::BTreeMap;

use libfuzzer_sys::fuzz_target;
use nanmux::adapters::sim_hal::LoopbackHal;
use nanmux::app::commands::Request;
use nanmux::app::events::{ClientEvent, SessionEvent};
use nanmux::app::ports::{ClientEventSink, SessionEventSink};
use nanmux::app::service::AwareService;
use nanmux::config::ManagerConfig;
use nanmux::request::{ConfigRequest, PublishConfig, SubscribeConfig};
use nanmux::types::{CallbackId, Capabilities, ClientId, MacAddr};

const CLIENTS: u8 = 4;

/// Counts how often each session request got its first answer.
#[derive(Default)]
struct OutcomeSink {
    answers: BTreeMap<(ClientId, CallbackId), u32>,
}

impl ClientEventSink for OutcomeSink {
    fn on_client_event(&mut self, _client_id: ClientId, _event: &ClientEvent) {}
}

impl SessionEventSink for OutcomeSink {
    fn on_session_event(&mut self, client_id: ClientId, callback: CallbackId, event: &SessionEvent) {
        if matches!(event, SessionEvent::Started { .. } | SessionEvent::ConfigFailed(_)) {
            let n = self.answers.entry((client_id, callback)).or_default();
            *n += 1;
            assert_eq!(*n, 1, "request {callback} of client {client_id} answered twice");
        }
    }
}

struct Rig {
    service: AwareService,
    hal: LoopbackHal,
    sink: OutcomeSink,
    now: u64,
    next_callback: CallbackId,
}

impl Rig {
    fn settle(&mut self) {
        for _ in 0..64 {
            self.service.advance(self.now);
            self.service.process(&mut self.hal, &mut self.sink);
            if !self.hal.has_pending() {
                return;
            }
            for event in self.hal.drain() {
                self.service.submit(event);
            }
        }
    }

    fn request(&mut self, request: Request) {
        self.service.submit(request);
        self.settle();
    }

    fn callback(&mut self) -> CallbackId {
        self.next_callback += 1;
        self.next_callback
    }

    /// First session of `client_id`, with its pub/sub id.
    fn first_session(&self, client_id: ClientId) -> Option<(u32, u8)> {
        let session_id = *self.service.session_ids(client_id).first()?;
        let session = self.service.session(session_id)?;
        Some((session_id, session.pub_sub_id))
    }

    fn step(&mut self, op: u8, arg: u8) {
        let client_id = ClientId::from(arg % CLIENTS) + 1;
        match op % 10 {
            0 => {
                let config = ConfigRequest {
                    master_preference: arg,
                    ..ConfigRequest::default()
                };
                self.request(Request::Connect {
                    client_id,
                    uid: 1000 + client_id,
                    pid: client_id,
                    package: format!("fuzz.{client_id}"),
                    config,
                    wants_identity: arg & 0x80 != 0,
                });
            }
            1 => self.request(Request::Disconnect { client_id }),
            2 => {
                if let Ok(config) = PublishConfig::new("fuzz") {
                    let callback = self.callback();
                    self.request(Request::Publish {
                        client_id,
                        callback,
                        config,
                    });
                }
            }
            3 => {
                if let Ok(config) = SubscribeConfig::new("fuzz") {
                    let callback = self.callback();
                    self.request(Request::Subscribe {
                        client_id,
                        callback,
                        config,
                    });
                }
            }
            4 => {
                if let Some((session_id, _)) = self.first_session(client_id) {
                    self.request(Request::TerminateSession { client_id, session_id });
                }
            }
            5 => {
                if let Some((_, pub_sub_id)) = self.first_session(client_id) {
                    let mac = MacAddr([0x02, 0, 0, 0, arg, arg]);
                    self.hal.inject_match(pub_sub_id, u32::from(arg % 3), mac, &[]);
                    self.settle();
                }
            }
            6 => {
                let target = self.first_session(client_id).and_then(|(session_id, _)| {
                    let peer = self.service.session(session_id)?.peers().next()?.peer_id;
                    Some((session_id, peer))
                });
                if let Some((session_id, peer_id)) = target {
                    self.request(Request::SendMessage {
                        client_id,
                        session_id,
                        peer_id,
                        message_id: u32::from(arg),
                        payload: vec![arg; usize::from(arg % 8)],
                        retry_count: arg % 4,
                    });
                }
            }
            7 => self.hal.nack_next(u32::from(arg % 4)),
            8 => {
                self.now += u64::from(arg) * 100;
                self.settle();
            }
            _ => self.hal.accepting = arg & 1 == 0,
        }
    }
}

fuzz_target!(|data: &[u8]| {
    let caps = Capabilities {
        supports_suspension: true,
        supports_pairing: true,
        ..Capabilities::default()
    };
    let mut rig = Rig {
        service: AwareService::new(ManagerConfig::default()),
        hal: LoopbackHal::new(caps, MacAddr([0x02, 0, 0, 0, 0, 1])),
        sink: OutcomeSink::default(),
        now: 0,
        next_callback: 0,
    };
    rig.service.start();
    rig.settle();

    for pair in data.chunks_exact(2) {
        rig.step(pair[0], pair[1]);
    }

    rig.hal.accepting = true;
    for client_id in rig.service.client_ids() {
        rig.request(Request::Disconnect { client_id });
    }
    rig.now += 60_000;
    rig.settle();

    assert_eq!(rig.service.client_count(), 0);
    assert_eq!(rig.service.host_queue_len(), 0);
    assert_eq!(rig.service.firmware_queue_len(), 0);
    assert!(rig.service.deferred_commands().is_empty());
    assert!(rig.service.pending_transactions().is_empty());
});
