//! Discovery sessions: publish/subscribe lifecycle, updates, peers,
//! suspension, bootstrapping and pairing.

use nanmux::app::commands::{HalEvent, Request, ResponseData};
use nanmux::app::events::SessionEvent;
use nanmux::error::NanStatus;
use nanmux::request::{PublishConfig, SubscribeConfig};
use nanmux::types::{Capabilities, MacAddr, Role, TerminateReason};

use crate::mock_hal::{HalCall, Harness, PEER_MAC};

const MAC_A: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0a]);
const MAC_B: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0b]);

fn attached(caps: Capabilities) -> Harness {
    let mut h = Harness::with_caps(caps);
    h.attach(1, 1000);
    h
}

fn suspendable_publish() -> PublishConfig {
    let mut config = PublishConfig::new("svc").unwrap();
    config.params.suspendable = true;
    config
}

// ── Lifecycle ─────────────────────────────────────────────────

#[test]
fn session_ids_increase_across_churn() {
    let mut h = attached(Capabilities::default());
    let s1 = h.publish(1, 10);
    let s2 = h.subscribe(1, 11);
    h.request(Request::TerminateSession {
        client_id: 1,
        session_id: s1,
    });
    let s3 = h.publish(1, 12);

    assert!(s1 < s2 && s2 < s3);
    assert_eq!(h.service.session_ids(1), vec![s2, s3]);
    assert!(
        h.hal
            .calls
            .iter()
            .any(|c| matches!(c, HalCall::StopPublish { .. }))
    );
    // App-initiated termination is not echoed back.
    assert!(
        !h.sink
            .session_events(1, 10)
            .iter()
            .any(|e| matches!(e, SessionEvent::Terminated(_)))
    );
}

#[test]
fn rejected_stop_still_ends_the_session() {
    let mut h = attached(Capabilities::default());
    let s = h.subscribe(1, 10);
    let pub_sub_id = h.pub_sub_id(s);
    h.hal.accept = false;
    h.request(Request::TerminateSession {
        client_id: 1,
        session_id: s,
    });
    assert!(matches!(
        h.hal.last(),
        Some(HalCall::StopSubscribe { pub_sub_id: id, .. }) if *id == pub_sub_id
    ));
    assert!(h.service.session_ids(1).is_empty());
    assert!(h.service.pending_transactions().is_empty());

    h.hal.accept = true;
    let next = h.subscribe(1, 11);
    assert!(next > s);
}

#[test]
fn publish_failure_leaves_no_session() {
    let mut h = attached(Capabilities::default());
    h.request(Request::Publish {
        client_id: 1,
        callback: 10,
        config: PublishConfig::new("svc").unwrap(),
    });
    let tid = h.last_tid();
    h.respond(tid, Err(NanStatus::NoResourcesAvailable));

    assert_eq!(
        h.sink.session_events(1, 10),
        vec![SessionEvent::ConfigFailed(NanStatus::NoResourcesAvailable)]
    );
    assert!(h.service.session_ids(1).is_empty());
}

#[test]
fn publish_from_unattached_client_fails_locally() {
    let mut h = Harness::new();
    h.request(Request::Publish {
        client_id: 5,
        callback: 50,
        config: PublishConfig::new("svc").unwrap(),
    });
    assert_eq!(
        h.sink.session_events(5, 50),
        vec![SessionEvent::ConfigFailed(NanStatus::InternalFailure)]
    );
    assert!(h.hal.calls.is_empty());
}

#[test]
fn publish_limit_comes_from_capabilities() {
    let caps = Capabilities {
        max_publishes: 1,
        ..Capabilities::default()
    };
    let mut h = attached(caps);
    h.publish(1, 10);
    let calls = h.hal.calls.len();
    h.request(Request::Publish {
        client_id: 1,
        callback: 11,
        config: PublishConfig::new("svc").unwrap(),
    });
    assert_eq!(
        h.sink.session_events(1, 11),
        vec![SessionEvent::ConfigFailed(NanStatus::NoResourcesAvailable)]
    );
    assert_eq!(h.hal.calls.len(), calls);
}

#[test]
fn unanswered_publish_counts_toward_limit() {
    let caps = Capabilities {
        max_publishes: 1,
        ..Capabilities::default()
    };
    let mut h = attached(caps);
    h.attach(2, 2000);
    let publishes = |h: &Harness| {
        h.hal
            .calls
            .iter()
            .filter(|c| matches!(c, HalCall::Publish { .. }))
            .count()
    };

    h.request(Request::Publish {
        client_id: 1,
        callback: 10,
        config: PublishConfig::new("svc").unwrap(),
    });
    let first = h.last_tid();
    h.request(Request::Publish {
        client_id: 2,
        callback: 20,
        config: PublishConfig::new("svc").unwrap(),
    });
    assert_eq!(publishes(&h), 1);
    assert_eq!(
        h.sink.session_events(2, 20),
        vec![SessionEvent::ConfigFailed(NanStatus::NoResourcesAvailable)]
    );

    // A failed start frees its slot again.
    h.respond(first, Err(NanStatus::InternalFailure));
    assert_eq!(
        h.sink.session_events(1, 10),
        vec![SessionEvent::ConfigFailed(NanStatus::InternalFailure)]
    );
    let s = h.publish(2, 21);
    assert_eq!(h.service.session_ids(2), vec![s]);
    assert_eq!(publishes(&h), 2);
}

#[test]
fn oversized_fields_are_checked_against_capabilities() {
    let caps = Capabilities {
        max_service_specific_info_len: 2,
        ..Capabilities::default()
    };
    let mut h = attached(caps);
    let mut config = PublishConfig::new("svc").unwrap();
    config.params = config.params.with_service_specific_info(&[1, 2, 3]).unwrap();
    h.request(Request::Publish {
        client_id: 1,
        callback: 10,
        config,
    });
    assert_eq!(
        h.sink.session_events(1, 10),
        vec![SessionEvent::ConfigFailed(NanStatus::InvalidArgs)]
    );
}

// ── Updates ───────────────────────────────────────────────────

#[test]
fn update_with_wrong_role_fails_without_hal() {
    let mut h = attached(Capabilities::default());
    let s = h.publish(1, 10);
    let calls = h.hal.calls.len();
    h.request(Request::UpdateSubscribe {
        client_id: 1,
        session_id: s,
        config: SubscribeConfig::new("svc").unwrap(),
    });
    assert_eq!(
        h.sink.session_events(1, 10).last(),
        Some(&SessionEvent::ConfigFailed(NanStatus::InternalFailure))
    );
    assert_eq!(h.hal.calls.len(), calls);
}

#[test]
fn update_of_foreign_session_is_dropped() {
    let mut h = attached(Capabilities::default());
    h.attach(2, 2000);
    let s = h.publish(1, 10);
    let events = h.sink.events.len();
    let calls = h.hal.calls.len();
    h.request(Request::UpdatePublish {
        client_id: 2,
        session_id: s,
        config: PublishConfig::new("other").unwrap(),
    });
    assert_eq!(h.sink.events.len(), events);
    assert_eq!(h.hal.calls.len(), calls);
}

#[test]
fn update_reuses_pub_sub_id() {
    let mut h = attached(Capabilities::default());
    let s = h.publish(1, 10);
    let id = h.pub_sub_id(s);
    h.request(Request::UpdatePublish {
        client_id: 1,
        session_id: s,
        config: PublishConfig::new("renamed").unwrap(),
    });
    let Some(HalCall::Publish { tid, pub_sub_id, config }) = h.hal.last().cloned() else {
        panic!("expected publish update");
    };
    assert_eq!(pub_sub_id, Some(id));
    assert_eq!(config.params.service_name.as_str(), "renamed");

    h.respond(tid, Ok(ResponseData::PubSubId(id)));
    assert_eq!(
        h.sink.session_events(1, 10).last(),
        Some(&SessionEvent::ConfigSucceeded)
    );
    let session = h.service.session(s).unwrap();
    assert_eq!(session.config.params().service_name.as_str(), "renamed");
}

// ── Firmware termination ──────────────────────────────────────

#[test]
fn firmware_termination_notifies_once() {
    let mut h = attached(Capabilities::default());
    let s = h.publish(1, 10);
    let pub_sub_id = h.pub_sub_id(s);
    let done = HalEvent::SessionTerminated {
        pub_sub_id,
        role: Role::Publish,
        reason: TerminateReason::Done,
    };
    h.hal_event(done.clone());
    h.hal_event(done);

    let terminations: Vec<_> = h
        .sink
        .session_events(1, 10)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Terminated(_)))
        .collect();
    assert_eq!(terminations, vec![SessionEvent::Terminated(TerminateReason::Done)]);
    assert!(h.service.session(s).is_none());
}

#[test]
fn termination_for_other_role_is_ignored() {
    let mut h = attached(Capabilities::default());
    let s = h.publish(1, 10);
    let pub_sub_id = h.pub_sub_id(s);
    h.hal_event(HalEvent::SessionTerminated {
        pub_sub_id,
        role: Role::Subscribe,
        reason: TerminateReason::Done,
    });
    assert!(h.service.session(s).is_some());
}

// ── Peers ─────────────────────────────────────────────────────

#[test]
fn peer_id_survives_mac_change() {
    let mut h = attached(Capabilities::default());
    let s = h.subscribe(1, 20);
    let p1 = h.discover(s, 5, MAC_A);
    let again = h.discover(s, 5, MAC_B);
    let other = h.discover(s, 6, MAC_A);

    assert_eq!(p1, again);
    assert_ne!(p1, other);

    let macs = h.service.request_mac_addresses(1000, &[p1, other, 999]);
    assert_eq!(macs.len(), 2);
    assert_eq!(macs[&p1], MAC_B);
    assert_eq!(macs[&other], MAC_A);
}

#[test]
fn mac_lookup_excludes_foreign_uid() {
    let mut h = attached(Capabilities::default());
    h.attach(2, 2000);
    let s = h.subscribe(1, 20);
    let p = h.discover(s, 5, MAC_A);
    assert!(h.service.request_mac_addresses(2000, &[p]).is_empty());
}

#[test]
fn match_expired_resolves_only_known_peers() {
    let mut h = attached(Capabilities::default());
    let s = h.subscribe(1, 20);
    let pub_sub_id = h.pub_sub_id(s);
    let p = h.discover(s, 5, MAC_A);
    h.sink.clear();

    h.hal_event(HalEvent::MatchExpired {
        pub_sub_id,
        requestor_instance_id: 77,
    });
    assert!(h.sink.events.is_empty());

    h.hal_event(HalEvent::MatchExpired {
        pub_sub_id,
        requestor_instance_id: 5,
    });
    assert_eq!(
        h.sink.session_events(1, 20),
        vec![SessionEvent::MatchExpired { peer_id: p }]
    );
}

#[test]
fn received_message_names_the_peer() {
    let mut h = attached(Capabilities::default());
    let s = h.subscribe(1, 20);
    let pub_sub_id = h.pub_sub_id(s);
    let p = h.discover(s, 5, MAC_A);
    h.hal_event(HalEvent::MessageReceived {
        pub_sub_id,
        requestor_instance_id: 5,
        peer_mac: MAC_B,
        payload: b"hi".to_vec(),
    });
    assert_eq!(
        h.sink.session_events(1, 20).last(),
        Some(&SessionEvent::MessageReceived {
            peer_id: p,
            payload: b"hi".to_vec()
        })
    );
}

#[test]
fn notifications_for_unknown_pub_sub_id_are_dropped() {
    let mut h = attached(Capabilities::default());
    h.subscribe(1, 20);
    h.sink.clear();
    h.hal_event(HalEvent::Match {
        pub_sub_id: 200,
        requestor_instance_id: 1,
        peer_mac: MAC_A,
        service_specific_info: vec![],
        match_filter: vec![],
    });
    h.hal_event(HalEvent::SessionTerminated {
        pub_sub_id: 200,
        role: Role::Subscribe,
        reason: TerminateReason::Done,
    });
    assert!(h.sink.events.is_empty());
}

// ── Suspension ────────────────────────────────────────────────

#[test]
fn suspend_and_resume_round_trip() {
    let caps = Capabilities {
        supports_suspension: true,
        ..Capabilities::default()
    };
    let mut h = attached(caps);
    let s = h.publish_with(1, 10, suspendable_publish());

    h.request_acked(Request::Suspend {
        client_id: 1,
        session_id: s,
    });
    assert_eq!(h.sink.session_events(1, 10).last(), Some(&SessionEvent::Suspended));
    assert!(h.service.session(s).unwrap().suspended);

    h.request(Request::Suspend {
        client_id: 1,
        session_id: s,
    });
    assert_eq!(
        h.sink.session_events(1, 10).last(),
        Some(&SessionEvent::SuspendFailed(NanStatus::InvalidArgs))
    );

    h.request_acked(Request::Resume {
        client_id: 1,
        session_id: s,
    });
    assert_eq!(h.sink.session_events(1, 10).last(), Some(&SessionEvent::Resumed));
    assert!(!h.service.session(s).unwrap().suspended);
}

#[test]
fn suspend_needs_firmware_support() {
    let mut h = attached(Capabilities::default());
    let s = h.publish_with(1, 10, suspendable_publish());
    h.request(Request::Suspend {
        client_id: 1,
        session_id: s,
    });
    assert_eq!(
        h.sink.session_events(1, 10).last(),
        Some(&SessionEvent::SuspendFailed(NanStatus::NotAllowed))
    );
}

#[test]
fn suspend_needs_suspendable_session() {
    let caps = Capabilities {
        supports_suspension: true,
        ..Capabilities::default()
    };
    let mut h = attached(caps);
    let s = h.publish(1, 10);
    h.request(Request::Suspend {
        client_id: 1,
        session_id: s,
    });
    assert_eq!(
        h.sink.session_events(1, 10).last(),
        Some(&SessionEvent::SuspendFailed(NanStatus::InvalidArgs))
    );
}

// ── Bootstrapping and pairing ─────────────────────────────────

#[test]
fn bootstrapping_confirms_through_handle() {
    let mut h = attached(Capabilities::default());
    let s = h.subscribe(1, 20);
    let p = h.discover(s, 5, PEER_MAC);
    h.request(Request::InitiateBootstrapping {
        client_id: 1,
        session_id: s,
        peer_id: p,
        method: 0x0001,
    });
    let Some(HalCall::InitiateBootstrapping { tid, method, .. }) = h.hal.last().cloned() else {
        panic!("expected bootstrapping");
    };
    assert_eq!(method, 1);
    h.respond(tid, Ok(ResponseData::Handle(9)));
    h.hal_event(HalEvent::BootstrappingConfirm {
        bootstrap_id: 9,
        accepted: true,
    });
    assert_eq!(
        h.sink.session_events(1, 20).last(),
        Some(&SessionEvent::BootstrappingConfirmed {
            peer_id: p,
            accepted: true
        })
    );
}

#[test]
fn bootstrapping_unknown_peer_fails_locally() {
    let mut h = attached(Capabilities::default());
    let s = h.subscribe(1, 20);
    h.request(Request::InitiateBootstrapping {
        client_id: 1,
        session_id: s,
        peer_id: 99,
        method: 1,
    });
    assert_eq!(
        h.sink.session_events(1, 20).last(),
        Some(&SessionEvent::BootstrappingFailed {
            peer_id: 99,
            reason: NanStatus::InvalidPeerId
        })
    );
}

#[test]
fn incoming_pairing_request_and_reply() {
    let caps = Capabilities {
        supports_pairing: true,
        ..Capabilities::default()
    };
    let mut h = attached(caps);
    let s = h.publish(1, 10);
    let pub_sub_id = h.pub_sub_id(s);
    let p = h.discover(s, 5, PEER_MAC);

    h.hal_event(HalEvent::PairingRequest {
        pub_sub_id,
        requestor_instance_id: 5,
        peer_mac: PEER_MAC,
        pairing_id: 4,
    });
    assert_eq!(
        h.sink.session_events(1, 10).last(),
        Some(&SessionEvent::PairingRequested {
            peer_id: p,
            pairing_id: 4
        })
    );

    h.request_acked(Request::RespondToPairing {
        client_id: 1,
        session_id: s,
        pairing_id: 4,
        accept: true,
    });
    assert!(matches!(
        h.hal.last(),
        Some(HalCall::RespondToPairing {
            pairing_id: 4,
            accept: true,
            ..
        })
    ));
    h.hal_event(HalEvent::PairingConfirm {
        pairing_id: 4,
        accepted: true,
    });
    assert_eq!(
        h.sink.session_events(1, 10).last(),
        Some(&SessionEvent::PairingConfirmed {
            peer_id: p,
            accepted: true
        })
    );
}

#[test]
fn pairing_needs_firmware_support() {
    let mut h = attached(Capabilities::default());
    let s = h.subscribe(1, 20);
    let p = h.discover(s, 5, PEER_MAC);
    h.request(Request::InitiatePairing {
        client_id: 1,
        session_id: s,
        peer_id: p,
    });
    assert_eq!(
        h.sink.session_events(1, 20).last(),
        Some(&SessionEvent::PairingFailed {
            peer_id: p,
            reason: NanStatus::NotAllowed
        })
    );
}
