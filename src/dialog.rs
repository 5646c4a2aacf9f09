//! Dialog store: the INVITE call-setup state machine's persistent
//! state, keyed by `Call-ID`.
//!
//! Adapted from the teacher crate's `b2bua::{Dialog, CallState,
//! B2buaManager}`: kept the manager-owns-a-`HashMap` shape and the
//! dialog struct's timestamp fields, replaced the 8-state
//! B2BUA/transaction machine (which models two call legs and a
//! transaction layer -- forking/B2BUA behavior is an explicit
//! non-goal here) with the single 5-state INVITE machine from
//! SPEC_FULL §4.4.2, and replaced `SystemTime`-based timestamps with
//! the injected `Clock`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::clock::MonoTime;
use crate::error::DialogError;
use crate::sdp::NEGOTIATED_CODEC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Trying,
    Ringing,
    Established,
    Terminating,
    Terminated,
}

impl DialogState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialogState::Trying => "trying",
            DialogState::Ringing => "ringing",
            DialogState::Established => "established",
            DialogState::Terminating => "terminating",
            DialogState::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialog {
    pub call_id: String,
    pub caller_ext: String,
    pub callee_ext: String,
    pub peer_addr: SocketAddr,
    pub state: DialogState,
    pub started_at: MonoTime,
    pub answered_at: Option<MonoTime>,
    pub ended_at: Option<MonoTime>,
    pub negotiated_codec: Option<&'static str>,
    /// Header values from the originating INVITE, kept so the engine
    /// can echo `Via`/`From`/`To`/`CSeq` onto responses emitted later
    /// by a timer re-entry (the `ringing -> established` auto-answer),
    /// when the original request is no longer in scope.
    pub via: Vec<String>,
    pub from: String,
    pub to: String,
    pub cseq: String,
    /// Set on the first ACK received while `established`, so the
    /// engine can tell a first ACK (which starts the RTP session) from
    /// a retransmitted one (SPEC_FULL §4.4.2).
    pub rtp_started: bool,
}

/// Whether `from -> to` is a legal forward move in the INVITE state
/// machine (SPEC_FULL §4.4.2). `Terminated` is absorbing.
fn is_valid_transition(from: DialogState, to: DialogState) -> bool {
    use DialogState::*;
    matches!(
        (from, to),
        (Trying, Ringing)
            | (Ringing, Established)
            | (Established, Established)
            | (Established, Terminating)
            | (Terminating, Terminated)
            | (Trying, Terminated)
            | (Ringing, Terminated)
            | (Established, Terminated)
    )
}

pub struct DialogStore {
    dialogs: Mutex<HashMap<String, Dialog>>,
}

impl DialogStore {
    pub fn new() -> Self {
        Self { dialogs: Mutex::new(HashMap::new()) }
    }

    /// Create a new dialog already in the `Trying` state (the
    /// `idle -> trying` transition happens at creation time: there is
    /// no stored representation of `idle`).
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        call_id: &str,
        caller_ext: &str,
        callee_ext: &str,
        peer_addr: SocketAddr,
        now: MonoTime,
        via: Vec<String>,
        from: &str,
        to: &str,
        cseq: &str,
    ) -> Result<Dialog, DialogError> {
        let mut dialogs = self.dialogs.lock().unwrap();
        if dialogs.contains_key(call_id) {
            return Err(DialogError::AlreadyExists(call_id.to_string()));
        }
        let dialog = Dialog {
            call_id: call_id.to_string(),
            caller_ext: caller_ext.to_string(),
            callee_ext: callee_ext.to_string(),
            peer_addr,
            state: DialogState::Trying,
            started_at: now,
            answered_at: None,
            ended_at: None,
            negotiated_codec: None,
            via,
            from: from.to_string(),
            to: to.to_string(),
            cseq: cseq.to_string(),
            rtp_started: false,
        };
        dialogs.insert(call_id.to_string(), dialog.clone());
        Ok(dialog)
    }

    pub fn lookup(&self, call_id: &str) -> Option<Dialog> {
        self.dialogs.lock().unwrap().get(call_id).cloned()
    }

    /// Validate and apply a state transition, stamping
    /// `answered_at`/`ended_at` as the invariants in SPEC_FULL §3
    /// require. Invalid transitions are rejected and leave the dialog
    /// untouched (SPEC_FULL §4.3).
    pub fn transition(
        &self,
        call_id: &str,
        new_state: DialogState,
        now: MonoTime,
    ) -> Result<Dialog, DialogError> {
        let mut dialogs = self.dialogs.lock().unwrap();
        let dialog =
            dialogs.get_mut(call_id).ok_or_else(|| DialogError::UnknownCallId(call_id.to_string()))?;

        if !is_valid_transition(dialog.state, new_state) {
            return Err(DialogError::IllegalTransition {
                call_id: call_id.to_string(),
                from: dialog.state,
                to: new_state,
            });
        }

        if new_state == DialogState::Established && dialog.answered_at.is_none() {
            dialog.answered_at = Some(now);
            dialog.negotiated_codec = Some(NEGOTIATED_CODEC);
        }
        if new_state == DialogState::Terminated && dialog.ended_at.is_none() {
            dialog.ended_at = Some(now);
        }
        dialog.state = new_state;
        Ok(dialog.clone())
    }

    /// Mark the RTP session as started for `call_id`, returning `true`
    /// the first time this is called for that dialog and `false` on
    /// every subsequent (retransmitted ACK) call.
    pub fn mark_rtp_started(&self, call_id: &str) -> bool {
        let mut dialogs = self.dialogs.lock().unwrap();
        match dialogs.get_mut(call_id) {
            Some(dialog) if !dialog.rtp_started => {
                dialog.rtp_started = true;
                true
            }
            _ => false,
        }
    }

    /// Remove a dialog. Callers must only do this once the dialog has
    /// reached `Terminated` and its final response has been emitted
    /// (SPEC_FULL §3).
    pub fn remove(&self, call_id: &str) -> Option<Dialog> {
        self.dialogs.lock().unwrap().remove(call_id)
    }

    pub fn iter_active(&self) -> Vec<Dialog> {
        self.dialogs
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.state != DialogState::Terminated)
            .cloned()
            .collect()
    }
}

impl Default for DialogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5060".parse().unwrap()
    }

    #[test]
    fn happy_path_reaches_established_then_terminated() {
        let store = DialogStore::new();
        store.create("call-1", "200", "201", addr(), MonoTime(0), vec!["SIP/2.0/UDP h".into()], "f", "t", "1 INVITE").unwrap();
        store.transition("call-1", DialogState::Ringing, MonoTime(10)).unwrap();
        let established =
            store.transition("call-1", DialogState::Established, MonoTime(2010)).unwrap();
        assert_eq!(established.answered_at, Some(MonoTime(2010)));
        assert_eq!(established.negotiated_codec, Some(NEGOTIATED_CODEC));

        // idempotent ACK re-entry
        store.transition("call-1", DialogState::Established, MonoTime(2500)).unwrap();

        store.transition("call-1", DialogState::Terminating, MonoTime(3000)).unwrap();
        let terminated = store.transition("call-1", DialogState::Terminated, MonoTime(3001)).unwrap();
        assert_eq!(terminated.ended_at, Some(MonoTime(3001)));
    }

    #[test]
    fn bye_before_established_terminates_directly() {
        let store = DialogStore::new();
        store.create("call-2", "200", "201", addr(), MonoTime(0), vec![], "f", "t", "1 INVITE").unwrap();
        let terminated = store.transition("call-2", DialogState::Terminated, MonoTime(5)).unwrap();
        assert_eq!(terminated.answered_at, None);
        assert!(terminated.ended_at.is_some());
    }

    #[test]
    fn illegal_transition_is_rejected_and_dialog_untouched() {
        let store = DialogStore::new();
        store.create("call-3", "200", "201", addr(), MonoTime(0), vec![], "f", "t", "1 INVITE").unwrap();
        let err = store.transition("call-3", DialogState::Established, MonoTime(1)).unwrap_err();
        assert!(matches!(err, DialogError::IllegalTransition { .. }));
        assert_eq!(store.lookup("call-3").unwrap().state, DialogState::Trying);
    }

    #[test]
    fn transition_on_unknown_call_id_errors() {
        let store = DialogStore::new();
        let err = store.transition("nope", DialogState::Ringing, MonoTime(0)).unwrap_err();
        assert!(matches!(err, DialogError::UnknownCallId(_)));
    }

    #[test]
    fn duplicate_create_errors() {
        let store = DialogStore::new();
        store.create("call-4", "200", "201", addr(), MonoTime(0), vec![], "f", "t", "1 INVITE").unwrap();
        let err = store
            .create("call-4", "200", "201", addr(), MonoTime(0), vec![], "f", "t", "1 INVITE")
            .unwrap_err();
        assert!(matches!(err, DialogError::AlreadyExists(_)));
    }
}
