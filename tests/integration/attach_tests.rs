//! Attach, detach and device configuration through the dispatcher.

use nanmux::app::commands::{HalEvent, Request, ResponseData};
use nanmux::app::events::ClientEvent;
use nanmux::app::ports::{Consent, InterfaceArbiter};
use nanmux::config::ManagerConfig;
use nanmux::error::NanStatus;
use nanmux::request::ConfigRequest;
use nanmux::types::{Capabilities, ClientId, ClusterEventKind, MacAddr};

use crate::mock_hal::{HalCall, Harness};

fn with_preference(master_preference: u8) -> ConfigRequest {
    ConfigRequest {
        master_preference,
        ..ConfigRequest::default()
    }
}

// ── Enable / reconfigure ──────────────────────────────────────

#[test]
fn first_attach_enables_interface() {
    let mut h = Harness::new();
    h.request(Harness::connect_request(1, 1000, with_preference(40), false));

    let Some(HalCall::EnableAndConfigure { tid, config, initial }) = h.hal.last().cloned() else {
        panic!("expected enable, got {:?}", h.hal.calls);
    };
    assert!(initial);
    assert_eq!(config.request.master_preference, 40);
    // Not attached until the HAL confirms.
    assert_eq!(h.service.client_count(), 0);
    assert!(h.sink.client_events(1).is_empty());

    h.respond(tid, Ok(ResponseData::Done));
    assert_eq!(h.sink.client_events(1), vec![ClientEvent::AttachSucceeded]);
    assert!(h.service.is_enabled());
    assert_eq!(h.service.client_ids(), vec![1]);
}

#[test]
fn identical_second_attach_skips_hal() {
    let mut h = Harness::new();
    h.attach(1, 1000);
    let calls = h.hal.calls.len();

    h.request(Harness::connect_request(2, 2000, ConfigRequest::default(), false));
    assert_eq!(h.hal.calls.len(), calls, "no reconfigure for an unchanged merge");
    assert_eq!(h.sink.client_events(2), vec![ClientEvent::AttachSucceeded]);
    assert_eq!(h.service.client_count(), 2);
}

#[test]
fn changed_merge_reconfigures_without_reenabling() {
    let mut h = Harness::new();
    h.attach_with(1, 1000, with_preference(50), false);
    h.request(Harness::connect_request(2, 2000, with_preference(100), false));

    let Some(HalCall::EnableAndConfigure { tid, config, initial }) = h.hal.last().cloned() else {
        panic!("expected reconfigure");
    };
    assert!(!initial);
    assert_eq!(config.request.master_preference, 100);
    h.respond(tid, Ok(ResponseData::Done));

    assert_eq!(h.sink.client_events(2), vec![ClientEvent::AttachSucceeded]);
    assert_eq!(h.service.applied_config().unwrap().request.master_preference, 100);
}

#[test]
fn hal_failure_forgets_client() {
    let mut h = Harness::new();
    h.request(Harness::connect_request(1, 1000, ConfigRequest::default(), false));
    let tid = h.last_tid();
    h.respond(tid, Err(NanStatus::ProtocolFailure));

    assert_eq!(
        h.sink.client_events(1),
        vec![ClientEvent::AttachFailed(NanStatus::ProtocolFailure)]
    );
    assert_eq!(h.service.client_count(), 0);
    assert!(!h.service.is_enabled());
    assert!(h.service.applied_config().is_none());
}

#[test]
fn synchronous_reject_fails_without_pending_transaction() {
    let mut h = Harness::new();
    h.hal.accept = false;
    h.request(Harness::connect_request(1, 1000, ConfigRequest::default(), false));

    assert_eq!(
        h.sink.client_events(1),
        vec![ClientEvent::AttachFailed(NanStatus::InternalFailure)]
    );
    assert!(h.service.pending_transactions().is_empty());
}

#[test]
fn duplicate_attach_is_rejected() {
    let mut h = Harness::new();
    h.attach(1, 1000);
    h.sink.clear();
    h.request(Harness::connect_request(1, 1000, ConfigRequest::default(), false));
    assert_eq!(
        h.sink.client_events(1),
        vec![ClientEvent::AttachFailed(NanStatus::InvalidArgs)]
    );
    assert_eq!(h.service.client_count(), 1);
}

#[test]
fn invalid_config_fails_locally() {
    let mut h = Harness::new();
    h.request(Harness::connect_request(1, 1000, with_preference(255), false));
    assert_eq!(
        h.sink.client_events(1),
        vec![ClientEvent::AttachFailed(NanStatus::InvalidArgs)]
    );
    assert!(h.hal.calls.is_empty());
}

// ── Detach ────────────────────────────────────────────────────

#[test]
fn last_detach_disables_interface() {
    let mut h = Harness::new();
    h.attach(1, 1000);
    h.request(Request::Disconnect { client_id: 1 });

    assert_eq!(h.sink.client_events(1).last(), Some(&ClientEvent::Terminated));
    let Some(HalCall::Disable { tid }) = h.hal.last().cloned() else {
        panic!("expected disable");
    };
    assert!(h.service.is_enabled(), "still up until the HAL confirms");
    h.respond(tid, Ok(ResponseData::Done));
    assert!(!h.service.is_enabled());
    assert!(h.service.applied_config().is_none());
}

#[test]
fn detach_reconfigures_for_remaining_clients() {
    let mut h = Harness::new();
    h.attach_with(1, 1000, with_preference(50), false);
    h.attach_with(2, 2000, with_preference(100), false);
    h.request(Request::Disconnect { client_id: 2 });

    let Some(HalCall::EnableAndConfigure { tid, config, initial }) = h.hal.last().cloned() else {
        panic!("expected reconfigure");
    };
    assert!(!initial);
    assert_eq!(config.request.master_preference, 50);
    h.respond(tid, Ok(ResponseData::Done));
    assert_eq!(h.service.applied_config().unwrap().request.master_preference, 50);
}

#[test]
fn detach_of_unknown_client_is_silent() {
    let mut h = Harness::new();
    h.request(Request::Disconnect { client_id: 9 });
    assert!(h.sink.events.is_empty());
    assert!(h.hal.calls.is_empty());
}

// ── Gating, consent, identity ─────────────────────────────────

#[test]
fn attach_while_usage_disabled_is_not_allowed() {
    let mut h = Harness::new();
    h.request(Request::SetUsageEnabled(false));
    h.request(Harness::connect_request(1, 1000, ConfigRequest::default(), false));
    assert_eq!(
        h.sink.client_events(1),
        vec![ClientEvent::AttachFailed(NanStatus::NotAllowed)]
    );

    h.request(Request::SetUsageEnabled(true));
    h.attach(2, 2000);
    assert_eq!(h.sink.client_events(2), vec![ClientEvent::AttachSucceeded]);
}

/// Asks the user once, then grants.
#[derive(Default)]
struct AskOnce {
    asked: bool,
}

impl InterfaceArbiter for AskOnce {
    fn request(&mut self, _client_id: ClientId, _package: &str) -> Consent {
        if self.asked {
            Consent::Granted
        } else {
            self.asked = true;
            Consent::Pending
        }
    }
}

#[test]
fn consent_suspends_queue_until_granted() {
    let mut h = Harness::build(ManagerConfig::default(), Capabilities::default(), AskOnce::default());
    h.request(Harness::connect_request(1, 1000, ConfigRequest::default(), false));
    h.request(Request::Disconnect { client_id: 7 });

    assert!(h.hal.calls.is_empty());
    assert!(h.service.snapshot().consent_pending);
    assert_eq!(h.service.queued_commands(), 1, "later commands wait behind consent");

    h.service.resolve_consent(true);
    h.process();
    let Some(HalCall::EnableAndConfigure { tid, initial: true, .. }) = h.hal.last().cloned() else {
        panic!("expected enable after consent");
    };
    assert!(!h.service.snapshot().consent_pending);
    h.respond(tid, Ok(ResponseData::Done));
    assert_eq!(h.sink.client_events(1), vec![ClientEvent::AttachSucceeded]);
}

#[test]
fn declined_consent_fails_with_no_resources() {
    let mut h = Harness::build(ManagerConfig::default(), Capabilities::default(), AskOnce::default());
    h.request(Harness::connect_request(1, 1000, ConfigRequest::default(), false));
    h.service.resolve_consent(false);
    h.process();

    assert_eq!(
        h.sink.client_events(1),
        vec![ClientEvent::AttachFailed(NanStatus::NoResourcesAvailable)]
    );
    assert!(h.hal.calls.is_empty());

    // The arbiter now grants, so the next attach proceeds.
    h.attach(2, 2000);
    assert_eq!(h.sink.client_events(2), vec![ClientEvent::AttachSucceeded]);
}

#[test]
fn identity_events_reach_only_interested_clients() {
    let mut h = Harness::new();
    h.attach_with(1, 1000, ConfigRequest::default(), true);
    h.attach(2, 2000);
    let mac = MacAddr([0x02, 0, 0, 0, 0, 0x42]);
    h.hal_event(HalEvent::InterfaceAddressChanged { mac });
    h.hal_event(HalEvent::ClusterChanged {
        kind: ClusterEventKind::Joined,
        cluster_id: MacAddr([0x50, 0x6f, 0x9a, 0x01, 0, 0]),
    });

    let events = h.sink.client_events(1);
    assert!(events.contains(&ClientEvent::IdentityChanged { mac }));
    assert!(events.iter().any(|e| matches!(e, ClientEvent::ClusterChanged { .. })));
    assert_eq!(h.sink.client_events(2), vec![ClientEvent::AttachSucceeded]);
}

// ── Instant mode ──────────────────────────────────────────────

#[test]
fn instant_mode_reconfigures_when_supported() {
    let caps = Capabilities {
        supports_instant_mode: true,
        ..Capabilities::default()
    };
    let mut h = Harness::with_caps(caps);
    h.attach(1, 1000);
    h.request(Request::SetInstantMode(true));

    let Some(HalCall::EnableAndConfigure { tid, config, initial: false }) = h.hal.last().cloned() else {
        panic!("expected reconfigure");
    };
    assert!(config.instant_mode);
    h.respond(tid, Ok(ResponseData::Done));
    assert!(h.service.applied_config().unwrap().instant_mode);
}

#[test]
fn instant_mode_ignored_when_unsupported() {
    let mut h = Harness::new();
    h.attach(1, 1000);
    let calls = h.hal.calls.len();
    h.request(Request::SetInstantMode(true));
    assert_eq!(h.hal.calls.len(), calls);
    assert!(!h.service.snapshot().instant_mode);
}
