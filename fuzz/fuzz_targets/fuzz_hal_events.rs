//! Fuzz target: unsolicited HAL events
//!
//! Decodes arbitrary bytes into a stream of `HalEvent`s and feeds them to a
//! started service that has no clients.  Nothing it receives may panic, and
//! with nobody attached no callback may ever fire.
//!
//! cargo fuzz run fuzz_hal_events

#![no_main]

use libfuzzer_sys::fuzz_target;
use nanmux::adapters::log_sink::LogEventSink;
use nanmux::adapters::sim_hal::LoopbackHal;
use nanmux::app::commands::{HalEvent, ResponseData};
use nanmux::app::service::AwareService;
use nanmux::config::ManagerConfig;
use nanmux::error::NanStatus;
use nanmux::types::{Capabilities, ClusterEventKind, MacAddr, Role, TerminateReason};

struct Cursor<'a> {
    data: &'a [u8],
}

impl Cursor<'_> {
    fn byte(&mut self) -> Option<u8> {
        let (&b, rest) = self.data.split_first()?;
        self.data = rest;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_le_bytes([self.byte()?, self.byte()?]))
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from(self.u16()?) | (u32::from(self.u16()?) << 16))
    }

    fn mac(&mut self) -> Option<MacAddr> {
        let mut mac = [0u8; 6];
        for b in &mut mac {
            *b = self.byte()?;
        }
        Some(MacAddr(mac))
    }

    fn bytes(&mut self) -> Option<Vec<u8>> {
        let len = usize::from(self.byte()? % 32).min(self.data.len());
        let (head, rest) = self.data.split_at(len);
        self.data = rest;
        Some(head.to_vec())
    }

    fn status(&mut self) -> Option<NanStatus> {
        Some(match self.byte()? % 9 {
            0 => NanStatus::InternalFailure,
            1 => NanStatus::ProtocolFailure,
            2 => NanStatus::InvalidSessionId,
            3 => NanStatus::NoResourcesAvailable,
            4 => NanStatus::InvalidArgs,
            5 => NanStatus::InvalidPeerId,
            6 => NanStatus::NoOtaAck,
            7 => NanStatus::FollowupTxQueueFull,
            _ => NanStatus::NotAllowed,
        })
    }

    fn unit_status(&mut self) -> Option<Result<(), NanStatus>> {
        if self.byte()? & 1 == 0 {
            Some(Ok(()))
        } else {
            Some(Err(self.status()?))
        }
    }

    fn role(&mut self) -> Option<Role> {
        Some(if self.byte()? & 1 == 0 { Role::Publish } else { Role::Subscribe })
    }

    fn event(&mut self) -> Option<HalEvent> {
        Some(match self.byte()? % 14 {
            0 => HalEvent::CommandResponse {
                transaction_id: self.u16()?,
                result: match self.byte()? % 4 {
                    0 => Ok(ResponseData::Done),
                    1 => Ok(ResponseData::PubSubId(self.byte()?)),
                    2 => Ok(ResponseData::Handle(self.u32()?)),
                    _ => Err(self.status()?),
                },
            },
            1 => HalEvent::MessageQueued {
                transaction_id: self.u16()?,
                status: self.unit_status()?,
            },
            2 => HalEvent::MessageTxStatus {
                transaction_id: self.u16()?,
                status: self.unit_status()?,
            },
            3 => HalEvent::SessionTerminated {
                pub_sub_id: self.byte()?,
                role: self.role()?,
                reason: TerminateReason::Failure(self.status()?),
            },
            4 => HalEvent::Match {
                pub_sub_id: self.byte()?,
                requestor_instance_id: self.u32()?,
                peer_mac: self.mac()?,
                service_specific_info: self.bytes()?,
                match_filter: self.bytes()?,
            },
            5 => HalEvent::MatchExpired {
                pub_sub_id: self.byte()?,
                requestor_instance_id: self.u32()?,
            },
            6 => HalEvent::MessageReceived {
                pub_sub_id: self.byte()?,
                requestor_instance_id: self.u32()?,
                peer_mac: self.mac()?,
                payload: self.bytes()?,
            },
            7 => HalEvent::ClusterChanged {
                kind: if self.byte()? & 1 == 0 {
                    ClusterEventKind::Started
                } else {
                    ClusterEventKind::Joined
                },
                cluster_id: self.mac()?,
            },
            8 => HalEvent::InterfaceAddressChanged { mac: self.mac()? },
            9 => HalEvent::BootstrappingConfirm {
                bootstrap_id: self.u32()?,
                accepted: self.byte()? & 1 == 1,
            },
            10 => HalEvent::PairingRequest {
                pub_sub_id: self.byte()?,
                requestor_instance_id: self.u32()?,
                peer_mac: self.mac()?,
                pairing_id: self.u32()?,
            },
            11 => HalEvent::PairingConfirm {
                pairing_id: self.u32()?,
                accepted: self.byte()? & 1 == 1,
            },
            12 => HalEvent::AwareDown {
                reason: self.status()?,
            },
            _ => HalEvent::CommandResponse {
                transaction_id: self.u16()?,
                result: Ok(ResponseData::Capabilities(Capabilities::default())),
            },
        })
    }
}

fuzz_target!(|data: &[u8]| {
    let mut service = AwareService::new(ManagerConfig::default());
    let mut hal = LoopbackHal::new(Capabilities::default(), MacAddr::default());
    let mut sink = LogEventSink::new();
    service.start();

    let mut cursor = Cursor { data };
    let mut now = 0u64;
    while let Some(event) = cursor.event() {
        service.submit(event);
        now += 100;
        service.advance(now);
        service.process(&mut hal, &mut sink);
    }

    assert_eq!(sink.client_events, 0, "client callback with no client attached");
    assert_eq!(sink.session_events, 0, "session callback with no session");
    assert_eq!(service.client_count(), 0);
});
