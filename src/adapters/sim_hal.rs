//! Loopback HAL: an in-process firmware model for simulation.
//!
//! Every accepted request queues the completion a well-behaved firmware
//! would send into an outbox.  The driver drains the outbox and submits the
//! events back into the service, which keeps the asynchronous shape of the
//! real channel while staying deterministic.

use std::collections::VecDeque;

use log::debug;

use crate::app::commands::{HalEvent, ResponseData};
use crate::app::ports::HalPort;
use crate::error::NanStatus;
use crate::merge::EffectiveConfig;
use crate::request::{PublishConfig, SubscribeConfig};
use crate::types::{
    Capabilities, ClusterEventKind, MacAddr, PubSubId, RequestorInstanceId, Role, TerminateReason,
    TransactionId,
};

pub struct LoopbackHal {
    caps: Capabilities,
    interface_mac: MacAddr,
    outbox: VecDeque<HalEvent>,
    next_pub_sub_id: PubSubId,
    next_handle: u32,
    /// Transmissions still to be NACKed with `NoOtaAck`.
    nack_budget: u32,
    /// When false every request is rejected synchronously.
    pub accepting: bool,
    pub enabled: bool,
}

impl LoopbackHal {
    pub fn new(caps: Capabilities, interface_mac: MacAddr) -> Self {
        Self {
            caps,
            interface_mac,
            outbox: VecDeque::new(),
            next_pub_sub_id: 1,
            next_handle: 1,
            nack_budget: 0,
            accepting: true,
            enabled: false,
        }
    }

    /// NACK the next `n` transmissions.
    pub fn nack_next(&mut self, n: u32) {
        self.nack_budget = n;
    }

    /// Simulate a discovery match on `pub_sub_id`.
    pub fn inject_match(
        &mut self,
        pub_sub_id: PubSubId,
        requestor_instance_id: RequestorInstanceId,
        peer_mac: MacAddr,
        service_specific_info: &[u8],
    ) {
        self.outbox.push_back(HalEvent::Match {
            pub_sub_id,
            requestor_instance_id,
            peer_mac,
            service_specific_info: service_specific_info.to_vec(),
            match_filter: Vec::new(),
        });
    }

    /// Simulate the firmware ending a session on its own.
    pub fn inject_termination(&mut self, pub_sub_id: PubSubId, role: Role) {
        self.outbox.push_back(HalEvent::SessionTerminated {
            pub_sub_id,
            role,
            reason: TerminateReason::Done,
        });
    }

    /// Take every queued completion, oldest first.
    pub fn drain(&mut self) -> Vec<HalEvent> {
        self.outbox.drain(..).collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.outbox.is_empty()
    }

    fn respond(&mut self, transaction_id: TransactionId, result: Result<ResponseData, NanStatus>) {
        self.outbox.push_back(HalEvent::CommandResponse {
            transaction_id,
            result,
        });
    }

    fn allocate_pub_sub(&mut self, existing: Option<PubSubId>) -> PubSubId {
        existing.unwrap_or_else(|| {
            let id = self.next_pub_sub_id;
            self.next_pub_sub_id = self.next_pub_sub_id.wrapping_add(1).max(1);
            id
        })
    }

    fn allocate_handle(&mut self) -> u32 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }
}

impl HalPort for LoopbackHal {
    fn query_capabilities(&mut self, tid: TransactionId) -> bool {
        if !self.accepting {
            return false;
        }
        self.respond(tid, Ok(ResponseData::Capabilities(self.caps)));
        true
    }

    fn enable_and_configure(&mut self, tid: TransactionId, config: &EffectiveConfig, initial: bool) -> bool {
        if !self.accepting {
            return false;
        }
        debug!(
            "sim_hal: {} with master preference {}",
            if initial { "enable" } else { "reconfigure" },
            config.request.master_preference
        );
        self.respond(tid, Ok(ResponseData::Done));
        if initial {
            self.enabled = true;
            self.outbox.push_back(HalEvent::InterfaceAddressChanged {
                mac: self.interface_mac,
            });
            self.outbox.push_back(HalEvent::ClusterChanged {
                kind: ClusterEventKind::Started,
                cluster_id: MacAddr([0x50, 0x6f, 0x9a, 0x01, 0x00, 0x00]),
            });
        }
        true
    }

    fn disable(&mut self, tid: TransactionId) -> bool {
        if !self.accepting {
            return false;
        }
        self.enabled = false;
        self.respond(tid, Ok(ResponseData::Done));
        true
    }

    fn publish(&mut self, tid: TransactionId, pub_sub_id: Option<PubSubId>, _config: &PublishConfig) -> bool {
        if !self.accepting {
            return false;
        }
        let id = self.allocate_pub_sub(pub_sub_id);
        self.respond(tid, Ok(ResponseData::PubSubId(id)));
        true
    }

    fn subscribe(
        &mut self,
        tid: TransactionId,
        pub_sub_id: Option<PubSubId>,
        _config: &SubscribeConfig,
    ) -> bool {
        if !self.accepting {
            return false;
        }
        let id = self.allocate_pub_sub(pub_sub_id);
        self.respond(tid, Ok(ResponseData::PubSubId(id)));
        true
    }

    fn stop_publish(&mut self, _tid: TransactionId, pub_sub_id: PubSubId) -> bool {
        debug!("sim_hal: stop publish {pub_sub_id}");
        self.accepting
    }

    fn stop_subscribe(&mut self, _tid: TransactionId, pub_sub_id: PubSubId) -> bool {
        debug!("sim_hal: stop subscribe {pub_sub_id}");
        self.accepting
    }

    fn send_message(
        &mut self,
        tid: TransactionId,
        _pub_sub_id: PubSubId,
        _requestor_instance_id: RequestorInstanceId,
        peer_mac: MacAddr,
        payload: &[u8],
    ) -> bool {
        if !self.accepting {
            return false;
        }
        debug!("sim_hal: {} byte(s) to {peer_mac}", payload.len());
        self.outbox.push_back(HalEvent::MessageQueued {
            transaction_id: tid,
            status: Ok(()),
        });
        let status = if self.nack_budget > 0 {
            self.nack_budget -= 1;
            Err(NanStatus::NoOtaAck)
        } else {
            Ok(())
        };
        self.outbox.push_back(HalEvent::MessageTxStatus {
            transaction_id: tid,
            status,
        });
        true
    }

    fn suspend(&mut self, tid: TransactionId, _pub_sub_id: PubSubId) -> bool {
        if !self.accepting {
            return false;
        }
        self.respond(tid, Ok(ResponseData::Done));
        true
    }

    fn resume(&mut self, tid: TransactionId, _pub_sub_id: PubSubId) -> bool {
        if !self.accepting {
            return false;
        }
        self.respond(tid, Ok(ResponseData::Done));
        true
    }

    fn initiate_bootstrapping(
        &mut self,
        tid: TransactionId,
        _pub_sub_id: PubSubId,
        _requestor_instance_id: RequestorInstanceId,
        _peer_mac: MacAddr,
        _method: u16,
    ) -> bool {
        if !self.accepting {
            return false;
        }
        let bootstrap_id = self.allocate_handle();
        self.respond(tid, Ok(ResponseData::Handle(bootstrap_id)));
        self.outbox.push_back(HalEvent::BootstrappingConfirm {
            bootstrap_id,
            accepted: true,
        });
        true
    }

    fn initiate_pairing(
        &mut self,
        tid: TransactionId,
        _pub_sub_id: PubSubId,
        _requestor_instance_id: RequestorInstanceId,
        _peer_mac: MacAddr,
    ) -> bool {
        if !self.accepting || !self.caps.supports_pairing {
            return false;
        }
        let pairing_id = self.allocate_handle();
        self.respond(tid, Ok(ResponseData::Handle(pairing_id)));
        self.outbox.push_back(HalEvent::PairingConfirm {
            pairing_id,
            accepted: true,
        });
        true
    }

    fn respond_to_pairing(&mut self, tid: TransactionId, pairing_id: u32, accept: bool) -> bool {
        if !self.accepting {
            return false;
        }
        self.respond(tid, Ok(ResponseData::Done));
        self.outbox.push_back(HalEvent::PairingConfirm {
            pairing_id,
            accepted: accept,
        });
        true
    }
}
