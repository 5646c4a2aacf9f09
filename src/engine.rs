//! The SIP engine: the single `ingest` entry point that drives the
//! REGISTER and INVITE state machines.
//!
//! The per-request handlers are shaped after the teacher crate's
//! `B2buaManager::handle_invite`/`handle_ack`/`handle_bye` (one method
//! per request type, each returning a `Result` the caller folds into
//! an outcome), generalized from B2BUA call-leg bookkeeping to the
//! REGISTER/INVITE machine in SPEC_FULL §4.4. Response bodies mirror
//! `examples/original_source/backend/sip_server.py`'s
//! `create_*_response` templates. The engine never lets an internal
//! error escape `ingest`: everything becomes (optional response,
//! audit event), per SPEC_FULL §7.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::audit::{AuditBus, AuditEvent};
use crate::clock::{Clock, MonoTime};
use crate::config::EngineConfig;
use crate::dialog::{DialogState, DialogStore};
use crate::error::{EngineError, RegistryError};
use crate::message::{extract_uri_user, Method, SipMessage};
use crate::registry::UserRegistry;
use crate::sdp::{build_answer, SdpOffer};
use crate::timer::{TimerKind, TimerQueue};

/// One outbound datagram: where to send it and what to send.
pub type Outbound = (SocketAddr, Vec<u8>);

pub struct SipEngine {
    pub registry: UserRegistry,
    pub dialogs: DialogStore,
    timers: TimerQueue,
    audit: AuditBus,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl SipEngine {
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>, audit: AuditBus) -> Self {
        Self {
            registry: UserRegistry::new(),
            dialogs: DialogStore::new(),
            timers: TimerQueue::new(),
            audit,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn audit_bus(&self) -> &AuditBus {
        &self.audit
    }

    /// The deadline the transport adapter should wake up for, if any
    /// timer is pending (SPEC_FULL §5).
    pub fn next_timer_deadline(&self) -> Option<MonoTime> {
        self.timers.next_deadline()
    }

    /// Ingest one raw UDP datagram from `peer_addr`. Returns zero or
    /// more response datagrams; all other side effects (registry,
    /// dialog store, audit bus) happen internally.
    pub fn ingest(&self, peer_addr: SocketAddr, datagram: &[u8]) -> Vec<Outbound> {
        let now = self.clock.now();
        let message = match SipMessage::parse(datagram) {
            Ok(message) => message,
            Err(error) => {
                self.audit.publish(AuditEvent::new(
                    now,
                    "DATAGRAM_DROPPED",
                    [
                        ("peer".to_string(), peer_addr.to_string()),
                        ("reason".to_string(), error.to_string()),
                    ],
                ));
                return Vec::new();
            }
        };

        let method = match message.method() {
            Some(method) => method.clone(),
            None => return Vec::new(), // responses arriving at a server are not acted on
        };

        let mut outputs = match method {
            Method::Register => self.handle_register(peer_addr, &message, now),
            Method::Invite => self.handle_invite(peer_addr, &message, now),
            Method::Ack => self.handle_ack(&message, now),
            Method::Bye => self.handle_bye(peer_addr, &message, now),
            Method::Options => self.handle_options(peer_addr, &message),
            Method::Cancel | Method::Unknown(_) => {
                self.audit.publish(AuditEvent::new(
                    now,
                    "UNHANDLED_METHOD",
                    [("method".to_string(), format!("{}", method))],
                ));
                Vec::new()
            }
        };

        outputs.extend(self.fire_due_timers(now));
        outputs
    }

    /// Process every timer that is due at `now`. Called both
    /// internally right after `ingest` schedules one (so a
    /// `ring_delay_ms = 0` test sees the auto-answer in the same
    /// call) and by the transport adapter's timer task when a real
    /// deadline elapses.
    pub fn fire_due_timers(&self, now: MonoTime) -> Vec<Outbound> {
        let mut outputs = Vec::new();
        for entry in self.timers.pop_due(now) {
            match entry.kind {
                TimerKind::AutoAnswer => {
                    if let Some(out) = self.auto_answer(&entry.call_id, now) {
                        outputs.push(out);
                    }
                }
                TimerKind::DialogExpiry => {
                    self.expire_dialog(&entry.call_id, now);
                }
            }
        }
        outputs
    }

    /// Force a still-live dialog to `terminated` with no response, once
    /// its dialog-timeout timer fires (SPEC_FULL §4.4.2, "any
    /// non-terminated -- dialog timeout --> terminated"). A no-op if
    /// the dialog already reached `terminated` (via BYE or a prior
    /// expiry) before the timer fired.
    fn expire_dialog(&self, call_id: &str, now: MonoTime) {
        let dialog = match self.dialogs.lookup(call_id) {
            Some(dialog) if dialog.state != DialogState::Terminated => dialog,
            _ => return,
        };
        let was_established = dialog.state == DialogState::Established;
        let _ = self.dialogs.transition(call_id, DialogState::Terminated, now);
        self.audit.publish(AuditEvent::new(
            now,
            "DIALOG_EXPIRED",
            [("call_id".to_string(), call_id.to_string())],
        ));
        if was_established {
            self.registry.set_busy(&dialog.caller_ext, false);
            self.registry.set_busy(&dialog.callee_ext, false);
        }
        self.dialogs.remove(call_id);
    }

    fn respond_with_echo(&self, request: &SipMessage, status: u16, reason: &str) -> SipMessage {
        let mut response = SipMessage::new_response(status, reason);
        response.echo_header_from(request, "Via");
        response.echo_header_from(request, "From");
        response.echo_header_from(request, "To");
        response.echo_header_from(request, "Call-ID");
        response.echo_header_from(request, "CSeq");
        response
    }

    fn handle_register(
        &self,
        peer_addr: SocketAddr,
        request: &SipMessage,
        now: MonoTime,
    ) -> Vec<Outbound> {
        let call_id = request.header("call-id").unwrap_or("").to_string();
        self.audit.publish(AuditEvent::new(
            now,
            "REGISTER_REQUEST",
            [
                ("call_id".to_string(), call_id.clone()),
                ("peer".to_string(), peer_addr.to_string()),
            ],
        ));

        let extension = request.header("from").and_then(extract_uri_user);
        let extension = match extension {
            Some(ext) => ext,
            None => return vec![self.bad_request(peer_addr, request, now, "missing From user-part")],
        };

        match self.registry.register(&extension, &*self.clock) {
            Ok(_user) => {
                let mut response = self.respond_with_echo(request, 200, "OK");
                response.echo_header_from(request, "Contact");
                let _ = response.set_header("Expires", "3600");
                self.audit.publish(AuditEvent::new(
                    now,
                    "REGISTER_RESPONSE",
                    [
                        ("call_id".to_string(), call_id),
                        ("extension".to_string(), extension),
                        ("status".to_string(), "200".to_string()),
                    ],
                ));
                vec![(peer_addr, response.serialize())]
            }
            Err(_invalid_extension) => {
                vec![self.bad_request(peer_addr, request, now, "invalid extension")]
            }
        }
    }

    fn bad_request(
        &self,
        peer_addr: SocketAddr,
        request: &SipMessage,
        now: MonoTime,
        reason: &str,
    ) -> Outbound {
        let response = self.respond_with_echo(request, 400, "Bad Request");
        self.audit.publish(AuditEvent::new(
            now,
            "REGISTER_RESPONSE",
            [
                ("status".to_string(), "400".to_string()),
                ("reason".to_string(), reason.to_string()),
            ],
        ));
        (peer_addr, response.serialize())
    }

    fn handle_invite(
        &self,
        peer_addr: SocketAddr,
        request: &SipMessage,
        now: MonoTime,
    ) -> Vec<Outbound> {
        let call_id = request.header("call-id").unwrap_or("").to_string();
        let caller_ext = request.header("from").and_then(extract_uri_user).unwrap_or_default();
        let callee_ext = request.header("to").and_then(extract_uri_user).unwrap_or_default();
        let body = String::from_utf8_lossy(&request.body).to_string();
        let offer = SdpOffer::parse(&body);

        self.audit.publish(AuditEvent::new(
            now,
            "INVITE_REQUEST",
            [
                ("call_id".to_string(), call_id.clone()),
                ("caller".to_string(), caller_ext.clone()),
                ("callee".to_string(), callee_ext.clone()),
                ("codecs_offered".to_string(), offer.audit_codec_list()),
            ],
        ));

        let via: Vec<String> = request.header_values("via").to_vec();
        let from = request.header("from").unwrap_or("").to_string();
        let to = request.header("to").unwrap_or("").to_string();
        let cseq = request.header("cseq").unwrap_or("").to_string();

        let dialog = match self.dialogs.create(&call_id, &caller_ext, &callee_ext, peer_addr, now, via, &from, &to, &cseq) {
            Ok(dialog) => dialog,
            Err(_already_exists) => return Vec::new(), // retransmitted INVITE, ignore
        };
        let _ = dialog;

        self.audit.publish(AuditEvent::new(now, "IDLE_TO_TRYING", [("call_id".to_string(), call_id.clone())]));
        let trying = self.respond_with_echo(request, 100, "Trying");
        let mut outputs = vec![(peer_addr, trying.serialize())];

        // Δtry = 0: the trying -> ringing move happens immediately.
        if self.dialogs.transition(&call_id, DialogState::Ringing, now).is_ok() {
            self.audit.publish(AuditEvent::new(
                now,
                "TRYING_TO_RINGING",
                [("call_id".to_string(), call_id.clone())],
            ));
            let ringing = self.respond_with_echo(request, 180, "Ringing");
            outputs.push((peer_addr, ringing.serialize()));
        }

        self.timers.schedule(
            now.add_millis(self.config.dialog_timeout_sec.saturating_mul(1000)),
            call_id.clone(),
            TimerKind::DialogExpiry,
        );
        self.timers.schedule(
            now.add_millis(self.config.ring_delay_ms),
            call_id,
            TimerKind::AutoAnswer,
        );
        outputs
    }

    fn auto_answer(&self, call_id: &str, now: MonoTime) -> Option<Outbound> {
        let dialog = self.dialogs.lookup(call_id)?;
        if dialog.state != DialogState::Ringing {
            // Already answered, cancelled, or timed out in the
            // meantime; nothing to do.
            return None;
        }
        self.dialogs.transition(call_id, DialogState::Established, now).ok()?;
        self.registry.set_busy(&dialog.caller_ext, true);
        self.registry.set_busy(&dialog.callee_ext, true);
        self.audit.publish(AuditEvent::new(
            now,
            "RINGING_TO_ESTABLISHED",
            [
                ("call_id".to_string(), call_id.to_string()),
                ("negotiated_codec".to_string(), crate::sdp::NEGOTIATED_CODEC.to_string()),
            ],
        ));

        let bind_host = self.config.bind_addr.split(':').next().unwrap_or("0.0.0.0");
        let bind_label = if bind_host == "0.0.0.0" { "192.168.100.1" } else { bind_host };
        let mut response = SipMessage::new_response(200, "OK");
        for via in &dialog.via {
            let _ = response.add_header("Via", via.clone());
        }
        let _ = response.add_header("From", dialog.from.clone());
        let _ = response.add_header("To", dialog.to.clone());
        let _ = response.add_header("Call-ID", dialog.call_id.clone());
        let _ = response.add_header("CSeq", dialog.cseq.clone());
        let _ = response.set_header("Content-Type", "application/sdp");
        response.set_body(build_answer(bind_label).into_bytes());

        Some((dialog.peer_addr, response.serialize()))
    }

    fn handle_ack(&self, request: &SipMessage, now: MonoTime) -> Vec<Outbound> {
        let call_id = request.header("call-id").unwrap_or("").to_string();
        match self.dialogs.lookup(&call_id) {
            Some(dialog) if dialog.state == DialogState::Established => {
                // Idempotent self-transition; records nothing new.
                let _ = self.dialogs.transition(&call_id, DialogState::Established, now);
                let first_ack = self.dialogs.mark_rtp_started(&call_id);
                self.audit.publish(AuditEvent::new(
                    now,
                    "ACK_RECEIVED",
                    [("call_id".to_string(), call_id.clone())],
                ));
                if first_ack {
                    self.audit.publish(AuditEvent::new(
                        now,
                        "RTP_SESSION_STARTED",
                        [
                            ("call_id".to_string(), call_id),
                            ("codec".to_string(), crate::sdp::NEGOTIATED_CODEC.to_string()),
                            ("rtp_port".to_string(), "8000".to_string()),
                        ],
                    ));
                }
            }
            _ => {
                self.audit.publish(AuditEvent::new(
                    now,
                    "SPURIOUS_ACK",
                    [("call_id".to_string(), call_id)],
                ));
            }
        }
        Vec::new()
    }

    fn handle_bye(&self, peer_addr: SocketAddr, request: &SipMessage, now: MonoTime) -> Vec<Outbound> {
        let call_id = request.header("call-id").unwrap_or("").to_string();
        let dialog = match self.dialogs.lookup(&call_id) {
            Some(dialog) => dialog,
            None => {
                self.audit.publish(AuditEvent::new(
                    now,
                    "UNKNOWN_CALL_ID",
                    [("call_id".to_string(), call_id)],
                ));
                return Vec::new();
            }
        };

        // Addressed to the BYE's own source, not the dialog's
        // remembered peer (SPEC_FULL §4.4.5: "regardless of Contact").
        let response = self.respond_with_echo(request, 200, "OK");
        let outputs = vec![(peer_addr, response.serialize())];

        let was_established = dialog.state == DialogState::Established;
        if was_established {
            let _ = self.dialogs.transition(&call_id, DialogState::Terminating, now);
            self.audit.publish(AuditEvent::new(
                now,
                "ESTABLISHED_TO_TERMINATING",
                [("call_id".to_string(), call_id.clone())],
            ));
        }
        if self.dialogs.transition(&call_id, DialogState::Terminated, now).is_ok() {
            self.audit.publish(AuditEvent::new(
                now,
                "TO_TERMINATED",
                [("call_id".to_string(), call_id.clone())],
            ));
        }
        self.registry.set_busy(&dialog.caller_ext, false);
        self.registry.set_busy(&dialog.callee_ext, false);
        self.dialogs.remove(&call_id);
        outputs
    }

    /// Pure bookkeeping for an out-of-scope admin surface: records that
    /// an operator asked to connect `caller` to `callee`, without
    /// synthesizing any SIP traffic itself (SPEC_FULL §6). Grounded on
    /// `examples/original_source/backend/main.py`'s `POST
    /// /call/initiate` handler, which does exactly this -- looks both
    /// users up and logs a step, leaving the actual INVITE to a
    /// separate client.
    pub fn initiate_call(&self, caller: &str, callee: &str) -> Result<(), EngineError> {
        let now = self.clock.now();
        let caller_user = self
            .registry
            .get(caller)
            .ok_or_else(|| EngineError::Registry(RegistryError::InvalidExtension(caller.to_string())))?;
        let callee_user = self
            .registry
            .get(callee)
            .ok_or_else(|| EngineError::Registry(RegistryError::InvalidExtension(callee.to_string())))?;
        self.audit.publish(AuditEvent::new(
            now,
            "CALL_INITIATED",
            [
                ("caller".to_string(), caller_user.extension),
                ("caller_address".to_string(), caller_user.internal_address),
                ("callee".to_string(), callee_user.extension),
                ("callee_address".to_string(), callee_user.internal_address),
            ],
        ));
        Ok(())
    }

    fn handle_options(&self, peer_addr: SocketAddr, request: &SipMessage) -> Vec<Outbound> {
        let mut response = self.respond_with_echo(request, 200, "OK");
        let _ = response.set_header("Allow", "INVITE, ACK, BYE, CANCEL, OPTIONS, REGISTER");
        let _ = response.set_header("Accept", "application/sdp");
        vec![(peer_addr, response.serialize())]
    }
}
