//! Dispatcher ordering: deferral, response/timeout races, stale ids and
//! whole-service teardown.

use nanmux::app::commands::{HalEvent, Request, ResponseData};
use nanmux::app::events::{ClientEvent, SessionEvent};
use nanmux::app::ports::GrantAll;
use nanmux::app::service::AwareService;
use nanmux::config::ManagerConfig;
use nanmux::error::NanStatus;
use nanmux::request::{ConfigRequest, PublishConfig};
use nanmux::types::{Capabilities, TerminateReason};

use crate::mock_hal::{HalCall, Harness, MockHal, PEER_MAC, RecordingSink};

fn publish_request(client_id: u32, callback: u64) -> Request {
    Request::Publish {
        client_id,
        callback,
        config: PublishConfig::new("svc").unwrap(),
    }
}

// ── Deferral ──────────────────────────────────────────────────

#[test]
fn independent_clients_proceed_in_parallel() {
    let mut h = Harness::new();
    h.attach(1, 1000);
    h.attach(2, 2000);
    h.request(publish_request(1, 10));
    h.request(publish_request(2, 20));

    let publishes = h
        .hal
        .calls
        .iter()
        .filter(|c| matches!(c, HalCall::Publish { .. }))
        .count();
    assert_eq!(publishes, 2);
    assert!(h.service.deferred_commands().is_empty());
}

#[test]
fn same_session_requests_replay_in_order() {
    let caps = Capabilities {
        supports_suspension: true,
        ..Capabilities::default()
    };
    let mut h = Harness::with_caps(caps);
    h.attach(1, 1000);
    let mut config = PublishConfig::new("svc").unwrap();
    config.params.suspendable = true;
    let s = h.publish_with(1, 10, config.clone());
    h.sink.clear();

    h.request(Request::UpdatePublish {
        client_id: 1,
        session_id: s,
        config,
    });
    let update = h.last_tid();
    h.request(Request::Suspend {
        client_id: 1,
        session_id: s,
    });
    h.request(Request::Resume {
        client_id: 1,
        session_id: s,
    });
    assert_eq!(h.service.deferred_commands().len(), 2);

    let id = h.pub_sub_id(s);
    h.respond(update, Ok(ResponseData::PubSubId(id)));
    let Some(HalCall::Suspend { tid: suspend, .. }) = h.hal.last().cloned() else {
        panic!("suspend should run once the update resolved");
    };
    assert_eq!(h.service.deferred_commands().len(), 1, "resume still waits");

    h.respond(suspend, Ok(ResponseData::Done));
    let Some(HalCall::Resume { tid: resume, .. }) = h.hal.last().cloned() else {
        panic!("resume should run once the suspend resolved");
    };
    h.respond(resume, Ok(ResponseData::Done));

    assert_eq!(
        h.sink.session_events(1, 10),
        vec![
            SessionEvent::ConfigSucceeded,
            SessionEvent::Suspended,
            SessionEvent::Resumed
        ]
    );
}

#[test]
fn request_never_overtakes_a_deferred_one_for_the_same_client() {
    let mut h = Harness::new();
    h.attach_with(
        1,
        1000,
        ConfigRequest {
            master_preference: 50,
            ..ConfigRequest::default()
        },
        false,
    );
    // Client 2 forces a reconfigure, which holds the device.
    h.request(Harness::connect_request(
        2,
        2000,
        ConfigRequest {
            master_preference: 100,
            ..ConfigRequest::default()
        },
        false,
    ));
    let reconfigure = h.last_tid();

    h.request(Request::Disconnect { client_id: 1 });
    h.request(publish_request(1, 10));
    assert_eq!(h.service.deferred_commands().len(), 2);

    h.respond(reconfigure, Ok(ResponseData::Done));
    assert_eq!(h.sink.client_events(1).last(), Some(&ClientEvent::Terminated));
    assert_eq!(
        h.sink.session_events(1, 10),
        vec![SessionEvent::ConfigFailed(NanStatus::InternalFailure)]
    );
    assert!(!h.hal.calls.iter().any(|c| matches!(c, HalCall::Publish { .. })));
}

// ── Races and stale ids ───────────────────────────────────────

#[test]
fn duplicate_response_creates_one_session() {
    let mut h = Harness::new();
    h.attach(1, 1000);
    h.request(publish_request(1, 10));
    let tid = h.last_tid();
    h.respond(tid, Ok(ResponseData::PubSubId(3)));
    h.respond(tid, Ok(ResponseData::PubSubId(3)));

    assert_eq!(h.sink.started(1, 10).len(), 1);
    assert_eq!(h.service.session_ids(1).len(), 1);
}

#[test]
fn late_response_after_timeout_is_ignored() {
    let mut h = Harness::new();
    h.attach(1, 1000);
    h.request(publish_request(1, 10));
    let tid = h.last_tid();
    h.advance(5_001);
    h.respond(tid, Ok(ResponseData::PubSubId(3)));

    assert_eq!(
        h.sink.session_events(1, 10),
        vec![SessionEvent::ConfigFailed(NanStatus::InternalFailure)]
    );
    assert!(h.service.session_ids(1).is_empty());
}

#[test]
fn timeout_after_response_is_ignored() {
    let mut h = Harness::new();
    h.attach(1, 1000);
    h.request(publish_request(1, 10));
    let tid = h.last_tid();
    h.respond(tid, Ok(ResponseData::PubSubId(3)));
    h.advance(60_000);

    assert_eq!(h.sink.session_events(1, 10).len(), 1);
    assert_eq!(h.service.session_ids(1).len(), 1);
}

#[test]
fn stale_transaction_ids_change_nothing() {
    let mut h = Harness::new();
    h.attach(1, 1000);
    h.publish(1, 10);
    let before = h.service.snapshot();
    let events = h.sink.events.len();

    h.respond(4242, Ok(ResponseData::Done));
    h.queued(4242, Ok(()));
    h.tx_status(4242, Err(NanStatus::NoOtaAck));
    h.hal_event(HalEvent::BootstrappingConfirm {
        bootstrap_id: 77,
        accepted: true,
    });
    h.hal_event(HalEvent::PairingConfirm {
        pairing_id: 77,
        accepted: true,
    });

    assert_eq!(h.service.snapshot(), before);
    assert_eq!(h.sink.events.len(), events);
}

#[test]
fn capability_timeout_keeps_defaults() {
    let mut service = AwareService::new(ManagerConfig::default());
    let mut hal = MockHal::new();
    let mut sink = RecordingSink::default();
    service.start();
    service.process(&mut hal, &mut sink);
    assert!(matches!(hal.last(), Some(HalCall::QueryCapabilities { .. })));

    service.advance(5_001);
    service.process(&mut hal, &mut sink);
    assert_eq!(service.capabilities(), &Capabilities::default());
    assert!(service.pending_transactions().is_empty());
    assert!(sink.events.is_empty());
}

#[test]
fn invalid_config_falls_back_to_defaults() {
    let config = ManagerConfig {
        command_timeout_ms: 0,
        max_queued_messages_per_uid: 0,
        ..ManagerConfig::default()
    };
    let mut h = Harness::build(config, Capabilities::default(), GrantAll);
    assert_eq!(h.service.config(), &ManagerConfig::default());

    h.attach(1, 1000);
    let s = h.subscribe(1, 10);
    let p = h.discover(s, 1, PEER_MAC);
    h.send(1, s, p, 7, 0);
    assert_eq!(h.hal.sends().len(), 1);
    assert!(
        !h.sink
            .session_events(1, 10)
            .iter()
            .any(|e| matches!(e, SessionEvent::MessageSendFailed { .. }))
    );
}

// ── Teardown ──────────────────────────────────────────────────

#[test]
fn usage_off_fails_everything_once_and_disables() {
    let mut h = Harness::new();
    h.attach(1, 1000);
    h.publish(1, 10);
    h.request(publish_request(1, 11));
    let outstanding = h.last_tid();

    h.request(Request::SetUsageEnabled(false));

    assert_eq!(
        h.sink.session_events(1, 11),
        vec![SessionEvent::ConfigFailed(NanStatus::InternalFailure)]
    );
    assert_eq!(
        h.sink.session_events(1, 10).last(),
        Some(&SessionEvent::Terminated(TerminateReason::Failure(
            NanStatus::InternalFailure
        )))
    );
    assert_eq!(h.sink.client_events(1).last(), Some(&ClientEvent::Terminated));
    assert!(matches!(h.hal.last(), Some(HalCall::Disable { .. })));
    assert_eq!(h.service.client_count(), 0);
    assert!(!h.service.is_usage_enabled());

    // The publish answer arrives after the teardown.
    h.respond(outstanding, Ok(ResponseData::PubSubId(9)));
    assert_eq!(h.sink.session_events(1, 11).len(), 1);
    assert!(h.service.session_ids(1).is_empty());
}

#[test]
fn firmware_down_tears_down_without_disable() {
    let mut h = Harness::new();
    h.attach(1, 1000);
    h.publish(1, 10);
    h.request(Harness::connect_request(2, 2000, ConfigRequest {
        master_preference: 9,
        ..ConfigRequest::default()
    }, false));
    let calls = h.hal.calls.len();

    h.hal_event(HalEvent::AwareDown {
        reason: NanStatus::ProtocolFailure,
    });

    assert_eq!(h.hal.calls.len(), calls, "no disable when firmware is gone");
    assert!(!h.service.is_enabled());
    assert_eq!(
        h.sink.client_events(2),
        vec![ClientEvent::AttachFailed(NanStatus::InternalFailure)]
    );
    assert_eq!(
        h.sink.session_events(1, 10).last(),
        Some(&SessionEvent::Terminated(TerminateReason::Failure(
            NanStatus::ProtocolFailure
        )))
    );

    // Usage is still enabled, so a fresh attach re-enables the interface.
    h.request(Harness::connect_request(3, 3000, ConfigRequest::default(), false));
    assert!(matches!(
        h.hal.last(),
        Some(HalCall::EnableAndConfigure { initial: true, .. })
    ));
}

#[test]
fn snapshot_exports_json_and_postcard() {
    let mut h = Harness::new();
    h.attach(1, 1000);
    h.publish(1, 10);
    let snapshot = h.service.snapshot();
    let json = snapshot.to_json().unwrap();
    assert!(json.contains("\"enabled\": true"));
    assert!(json.contains("\"package\": \"app.1\""));
    assert!(!snapshot.to_postcard().unwrap().is_empty());
    assert_eq!(snapshot.clients[0].sessions.len(), 1);
}
