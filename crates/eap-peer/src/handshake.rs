//! TLS handshake driver
//!
//! Sits between the state machine and a [`TlsEngine`]: steps the engine,
//! consults the trust evaluator when the server shows its chain, and
//! exports the session keys once the handshake completes.
//!
//! ```text
//! Idle -> Handshaking -> (AuthPending) -> Established
//!                     \-> Failed
//! ```

use crate::config::TrustPolicy;
use crate::credentials::Credentials;
use crate::engine::{HandshakeStatus, TlsEngine, TlsEngineError};
use crate::status::ClientStatus;
use crate::trust::{TrustEvaluator, TrustFailure, TrustOutcome};
use tracing::{debug, info, warn};

/// Exported key block: MSK followed by EMSK
pub const KEY_BLOCK_LEN: usize = 128;

const HALF_KEY_LEN: usize = KEY_BLOCK_LEN / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakePhase {
    #[default]
    Idle,
    Handshaking,
    /// Waiting for the user to accept the server chain
    AuthPending,
    Established,
    Failed,
}

/// What the caller should do after a driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// Send these handshake bytes; empty means acknowledge
    Continue(Vec<u8>),
    /// The tunnel is up; send these final bytes, if any
    Established(Vec<u8>),
    UserInputRequired,
    /// Terminal; `alert` holds the closing alert, if any, and never
    /// handshake records queued before a trust failure
    Failed {
        status: ClientStatus,
        code: u32,
        alert: Vec<u8>,
    },
}

/// Keys derived from the TLS session
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// First half of the export (client key, MSK)
    pub msk: Vec<u8>,
    /// Second half of the export (server key, EMSK)
    pub emsk: Vec<u8>,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

impl SessionKeys {
    /// Split a 128 byte export into its halves
    pub fn from_block(block: &[u8]) -> Option<Self> {
        if block.len() != KEY_BLOCK_LEN {
            return None;
        }
        let (msk, emsk) = block.split_at(HALF_KEY_LEN);
        Some(SessionKeys {
            msk: msk.to_vec(),
            emsk: emsk.to_vec(),
        })
    }
}

pub struct TlsHandshakeDriver<E> {
    engine: E,
    evaluator: Box<dyn TrustEvaluator + Send>,
    policy: TrustPolicy,
    key_label: &'static str,
    phase: HandshakePhase,
    trust_confirmed: bool,
    /// The engine finished while trust was still undecided
    completion_pending: bool,
    user_decision: Option<bool>,
    server_certificates: Vec<Vec<u8>>,
    keys: Option<SessionKeys>,
    resumed: bool,
    last_error: Option<u32>,
}

impl<E: TlsEngine> TlsHandshakeDriver<E> {
    pub fn new(
        engine: E,
        evaluator: Box<dyn TrustEvaluator + Send>,
        policy: TrustPolicy,
        key_label: &'static str,
    ) -> Self {
        TlsHandshakeDriver {
            engine,
            evaluator,
            policy,
            key_label,
            phase: HandshakePhase::Idle,
            trust_confirmed: false,
            completion_pending: false,
            user_decision: None,
            server_certificates: Vec::new(),
            keys: None,
            resumed: false,
            last_error: None,
        }
    }

    /// Create a fresh engine connection
    pub fn start(&mut self, credentials: &Credentials) -> Result<(), TlsEngineError> {
        self.engine.create()?;
        if let Some(id) = &credentials.resumption_id {
            self.engine.set_peer_id(id.as_bytes());
        }
        if let Some(identity) = &credentials.identity {
            self.engine.set_certificate(identity)?;
        }

        self.phase = HandshakePhase::Handshaking;
        self.trust_confirmed = false;
        self.completion_pending = false;
        self.user_decision = None;
        self.server_certificates.clear();
        self.keys = None;
        self.resumed = false;
        self.last_error = None;
        debug!("TLS handshake started");
        Ok(())
    }

    /// Feed a reassembled handshake message and step the engine
    pub fn receive(&mut self, bytes: &[u8]) -> HandshakeProgress {
        if let Err(e) = self.engine.push_incoming(bytes) {
            warn!(error = %e, "TLS engine rejected handshake data");
            return self.fail(ClientStatus::Failed, e.code());
        }
        self.advance()
    }

    /// Step the engine until it needs more input or reaches a decision point
    pub fn advance(&mut self) -> HandshakeProgress {
        loop {
            match self.engine.handshake_step() {
                HandshakeStatus::ServerAuthCompleted => match self.evaluate_trust() {
                    TrustOutcome::Ok => {
                        self.trust_confirmed = true;
                        continue;
                    }
                    TrustOutcome::UserInputRequired => {
                        self.phase = HandshakePhase::AuthPending;
                        return HandshakeProgress::UserInputRequired;
                    }
                    TrustOutcome::Failed(failure) => return self.refuse(failure),
                },
                HandshakeStatus::WouldBlock => {
                    return HandshakeProgress::Continue(self.engine.take_outgoing());
                }
                HandshakeStatus::Complete => {
                    if !self.trust_confirmed {
                        // Resumed sessions skip the certificate exchange
                        match self.evaluate_trust() {
                            TrustOutcome::Ok => self.trust_confirmed = true,
                            TrustOutcome::UserInputRequired => {
                                self.completion_pending = true;
                                self.phase = HandshakePhase::AuthPending;
                                return HandshakeProgress::UserInputRequired;
                            }
                            TrustOutcome::Failed(failure) => return self.refuse(failure),
                        }
                    }
                    return self.finish();
                }
                HandshakeStatus::Error(e) => {
                    warn!(error = %e, "TLS handshake failed");
                    return self.fail(ClientStatus::Failed, e.code());
                }
            }
        }
    }

    /// Record the user's answer to a pending trust question
    pub fn confirm_trust(&mut self, accepted: bool) {
        self.user_decision = Some(accepted);
    }

    /// Continue after [`HandshakeProgress::UserInputRequired`]
    pub fn resume(&mut self) -> HandshakeProgress {
        if self.phase != HandshakePhase::AuthPending {
            return self.advance();
        }
        match self.user_decision.take() {
            None => HandshakeProgress::UserInputRequired,
            Some(false) => {
                info!("user rejected server certificate");
                self.refuse(TrustFailure::UserRejected)
            }
            Some(true) => {
                info!("user accepted server certificate");
                self.trust_confirmed = true;
                self.phase = HandshakePhase::Handshaking;
                if std::mem::take(&mut self.completion_pending) {
                    self.finish()
                } else {
                    self.advance()
                }
            }
        }
    }

    /// Evaluate trust again if it was never confirmed; used when the
    /// server reports outer Success
    pub fn ensure_trust(&mut self) -> TrustOutcome {
        if self.trust_confirmed {
            return TrustOutcome::Ok;
        }
        let outcome = self.evaluate_trust();
        if outcome == TrustOutcome::Ok {
            self.trust_confirmed = true;
        }
        outcome
    }

    fn evaluate_trust(&mut self) -> TrustOutcome {
        self.server_certificates = self.engine.peer_certificates();
        let outcome = self
            .evaluator
            .evaluate(&self.server_certificates, &self.policy);
        debug!(
            certificates = self.server_certificates.len(),
            outcome = ?outcome,
            "server trust evaluated"
        );
        outcome
    }

    fn finish(&mut self) -> HandshakeProgress {
        let block = match self.engine.export_key_material(self.key_label, KEY_BLOCK_LEN) {
            Ok(block) => block,
            Err(e) => return self.fail(ClientStatus::Failed, e.code()),
        };
        let Some(keys) = SessionKeys::from_block(&block) else {
            return self.fail(
                ClientStatus::Failed,
                TlsEngineError::KeyExport(String::new()).code(),
            );
        };

        self.keys = Some(keys);
        self.resumed = self.engine.session_was_resumed();
        self.phase = HandshakePhase::Established;
        info!(
            resumed = self.resumed,
            cipher = ?self.engine.negotiated_cipher(),
            "TLS tunnel established"
        );
        HandshakeProgress::Established(self.engine.take_outgoing())
    }

    /// Close the engine and move to `Failed`
    fn fail(&mut self, status: ClientStatus, code: u32) -> HandshakeProgress {
        self.engine.close();
        self.failed(status, code)
    }

    /// Refuse the server chain: nothing the engine queued is sent, only
    /// a fatal alert
    pub fn refuse(&mut self, failure: TrustFailure) -> HandshakeProgress {
        warn!(failure = ?failure, "server certificate refused");
        self.engine.abort(failure.alert());
        self.failed(ClientStatus::SecurityError, failure.code())
    }

    fn failed(&mut self, status: ClientStatus, code: u32) -> HandshakeProgress {
        self.phase = HandshakePhase::Failed;
        self.last_error = Some(code);
        HandshakeProgress::Failed {
            status,
            code,
            alert: self.engine.take_outgoing(),
        }
    }

    /// Export keying material with another label, e.g. the inner challenge
    pub fn key_material(&self, label: &str, len: usize) -> Result<Vec<u8>, TlsEngineError> {
        self.engine.export_key_material(label, len)
    }

    pub fn session_keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn trust_confirmed(&self) -> bool {
        self.trust_confirmed
    }

    pub fn trust_pending(&self) -> bool {
        self.phase == HandshakePhase::AuthPending
    }

    pub fn last_error(&self) -> Option<u32> {
        self.last_error
    }

    pub fn server_certificates(&self) -> &[Vec<u8>] {
        &self.server_certificates
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}
