//! EAP-TTLS / EAP-TLS peer state machine
//!
//! One call to [`TtlsStateMachine::process`] per inbound EAP packet. The
//! machine reassembles and fragments TLS messages, drives the handshake,
//! and once the tunnel is up runs inner authentication (EAP-TTLS only).
//!
//! ```text
//! Idle --Start--> Handshaking --tunnel up--> TunnelEstablished --Success--> Success
//!                      \                         \
//!                       \--------------------------\------------------> Failure
//! ```
//!
//! A request that repeats the previous identifier is answered with the
//! previous response and changes nothing.

use crate::config::{ConfigError, InnerAuthType, PeerConfig, TunnelMethod};
use crate::credentials::Credentials;
use crate::engine::{RustlsEngine, SessionCache, TlsEngine};
use crate::handshake::{HandshakeProgress, SessionKeys, TlsHandshakeDriver};
use crate::inner::InnerAuthEngine;
use crate::method::{EapMethod, MethodRegistry};
use crate::status::{ClientState, ClientStatus, PropertyKey, PublishedProperties, Step, TunnelStep};
use crate::trust::{PolicyTrustEvaluator, TrustEvaluator, TrustFailure, TrustOutcome};
use eap_proto::eap::eap_tls::{EapTlsPacket, FeedResult, FragmentAssembler, FragmentError, FragmentWriter};
use eap_proto::{EapCode, EapPacket, EapType};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Last-error code for malformed EAP-TLS framing
pub const FRAMING_ERROR: u32 = 0x401;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtlsPhase {
    #[default]
    Idle,
    Handshaking,
    TunnelEstablished,
    Success,
    Failure,
}

pub struct TtlsStateMachine<E> {
    method: TunnelMethod,
    credentials: Credentials,
    driver: TlsHandshakeDriver<E>,
    /// Present for EAP-TTLS only
    inner: Option<InnerAuthEngine>,
    assembler: FragmentAssembler,
    writer: FragmentWriter,
    mtu: usize,
    phase: TtlsPhase,
    status: ClientStatus,
    last_identifier: Option<u8>,
    last_output: Option<EapPacket>,
    last_error: Option<u32>,
    deferred: Option<Deferred>,
}

/// Inner work postponed until the user supplies input
enum Deferred {
    Start,
    Received(Vec<u8>),
}

impl TtlsStateMachine<RustlsEngine> {
    /// Machine over rustls with the policy trust evaluator, resuming
    /// sessions through the process-wide [`SessionCache`]
    pub fn from_config(config: &PeerConfig) -> Result<Self, ConfigError> {
        Self::from_config_with_cache(config, SessionCache::shared())
    }

    /// Like [`Self::from_config`] with sessions kept in `cache`
    pub fn from_config_with_cache(
        config: &PeerConfig,
        cache: Arc<SessionCache>,
    ) -> Result<Self, ConfigError> {
        Self::new(
            config,
            RustlsEngine::with_session_cache(cache),
            Box::new(PolicyTrustEvaluator::new()),
        )
    }
}

impl<E: TlsEngine> TtlsStateMachine<E> {
    pub fn new(
        config: &PeerConfig,
        engine: E,
        evaluator: Box<dyn TrustEvaluator + Send>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let credentials = config.credentials()?;
        Ok(Self::with_parts(
            config,
            credentials,
            engine,
            evaluator,
            MethodRegistry::with_defaults(),
        ))
    }

    /// Assemble a machine from explicit collaborators
    ///
    /// The configuration is assumed to be valid.
    pub fn with_parts(
        config: &PeerConfig,
        credentials: Credentials,
        engine: E,
        evaluator: Box<dyn TrustEvaluator + Send>,
        registry: MethodRegistry,
    ) -> Self {
        let driver = TlsHandshakeDriver::new(
            engine,
            evaluator,
            config.trust.clone(),
            config.method.key_label(),
        );
        let inner = (config.method == TunnelMethod::Ttls).then(|| {
            InnerAuthEngine::new(
                config.inner_authentication,
                credentials.clone(),
                registry,
                config.nested_candidates(),
            )
        });

        TtlsStateMachine {
            method: config.method,
            credentials,
            driver,
            inner,
            assembler: FragmentAssembler::with_max_message_size(config.max_message_size),
            writer: FragmentWriter::new(),
            mtu: config.mtu,
            phase: TtlsPhase::Idle,
            status: ClientStatus::Ok,
            last_identifier: None,
            last_output: None,
            last_error: None,
            deferred: None,
        }
    }

    pub fn process(&mut self, packet: &EapPacket) -> Step {
        match packet.code {
            EapCode::Success => return self.on_outer_success(packet.identifier),
            EapCode::Failure => return self.on_outer_failure(),
            EapCode::Response => {
                warn!(identifier = packet.identifier, "ignoring EAP Response");
                return self.current(None);
            }
            EapCode::Request => {}
        }

        let eap_type = self.method.eap_type();
        if packet.eap_type != Some(eap_type) {
            warn!(received = ?packet.eap_type, expected = %eap_type, "unexpected EAP type");
            return self.current(None);
        }
        if matches!(self.phase, TtlsPhase::Success | TtlsPhase::Failure) {
            return self.current(None);
        }

        if self.phase != TtlsPhase::Idle && self.last_identifier == Some(packet.identifier) {
            if let Some(output) = &self.last_output {
                debug!(identifier = packet.identifier, "repeated request, resending");
                return Step::running(Some(output.clone()));
            }
        }

        let tls = match EapTlsPacket::from_eap_packet(packet) {
            Ok(tls) => tls,
            Err(e) => return self.framing_error(e),
        };

        let step = match self.phase {
            TtlsPhase::Idle => self.on_idle(packet.identifier, &tls),
            TtlsPhase::Handshaking => self.on_handshake(packet.identifier, &tls),
            TtlsPhase::TunnelEstablished => self.on_tunnel(packet.identifier, &tls),
            TtlsPhase::Success | TtlsPhase::Failure => self.current(None),
        };

        if let Some(response) = &step.response {
            self.last_identifier = Some(packet.identifier);
            self.last_output = Some(response.clone());
        }
        step
    }

    fn on_idle(&mut self, identifier: u8, tls: &EapTlsPacket) -> Step {
        if !tls.flags.start() {
            warn!(identifier, "expected EAP-TLS Start");
            return Step::running(None);
        }
        self.begin(identifier)
    }

    fn begin(&mut self, identifier: u8) -> Step {
        if let Some(inner) = &self.inner {
            if inner.auth_type().requires_password() && self.credentials.password.is_none() {
                info!("password required before starting");
                return Step::input_required(None);
            }
        }

        self.assembler.reset();
        self.writer.clear();
        self.deferred = None;
        if let Err(e) = self.driver.start(&self.credentials) {
            warn!(error = %e, "TLS engine could not start");
            return self.terminate(identifier, ClientStatus::Failed, e.code(), Vec::new());
        }

        self.phase = TtlsPhase::Handshaking;
        info!(method = %self.method.eap_type(), "EAP-TLS Start received");
        let progress = self.driver.advance();
        self.on_progress(identifier, progress)
    }

    fn on_handshake(&mut self, identifier: u8, tls: &EapTlsPacket) -> Step {
        if self.driver.trust_pending() {
            let progress = self.driver.resume();
            return self.on_progress(identifier, progress);
        }

        match self.assembler.feed(identifier, tls) {
            Ok(FeedResult::Start) => {
                debug!("server restarted the handshake");
                self.begin(identifier)
            }
            Ok(FeedResult::Ack) => self.next_output(identifier),
            Ok(FeedResult::Incomplete) => self.ack(identifier),
            Ok(FeedResult::Duplicate) => Step::running(self.last_output.clone()),
            Ok(FeedResult::Complete(message)) => {
                let progress = self.driver.receive(&message);
                self.on_progress(identifier, progress)
            }
            Err(e) => self.framing_error(e),
        }
    }

    fn on_progress(&mut self, identifier: u8, progress: HandshakeProgress) -> Step {
        match progress {
            HandshakeProgress::Continue(bytes) => self.send(identifier, bytes),
            HandshakeProgress::UserInputRequired => {
                info!("waiting for a trust decision");
                Step::input_required(None)
            }
            HandshakeProgress::Failed {
                status,
                code,
                alert,
            } => self.terminate(identifier, status, code, alert),
            HandshakeProgress::Established(final_bytes) => {
                self.phase = TtlsPhase::TunnelEstablished;
                if self.driver.resumed() || self.inner.is_none() {
                    // Inner authentication waits for the server on resumed sessions
                    return self.send(identifier, final_bytes);
                }
                self.run_inner(identifier, final_bytes, None)
            }
        }
    }

    fn on_tunnel(&mut self, identifier: u8, tls: &EapTlsPacket) -> Step {
        if let Some(deferred) = self.deferred.take() {
            let received = match deferred {
                Deferred::Start => None,
                Deferred::Received(data) => Some(data),
            };
            return self.run_inner(identifier, Vec::new(), received);
        }

        match self.assembler.feed(identifier, tls) {
            Ok(FeedResult::Start) => {
                warn!("Start received inside the tunnel");
                Step::running(None)
            }
            Ok(FeedResult::Ack) => self.next_output(identifier),
            Ok(FeedResult::Incomplete) => self.ack(identifier),
            Ok(FeedResult::Duplicate) => Step::running(self.last_output.clone()),
            Ok(FeedResult::Complete(message)) => {
                let plaintext = match self
                    .driver
                    .engine_mut()
                    .push_incoming(&message)
                    .and_then(|()| self.driver.engine_mut().read())
                {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        warn!(error = %e, "tunnel read failed");
                        return self.terminate(identifier, ClientStatus::Failed, e.code(), Vec::new());
                    }
                };
                if plaintext.is_empty() || self.inner.is_none() {
                    let pending = self.driver.engine_mut().take_outgoing();
                    return self.send(identifier, pending);
                }
                self.run_inner(identifier, Vec::new(), Some(plaintext))
            }
            Err(e) => self.framing_error(e),
        }
    }

    /// Run one inner step and send its output after `prefix`
    ///
    /// `received` is `None` for the first step after a full handshake.
    fn run_inner(&mut self, identifier: u8, prefix: Vec<u8>, received: Option<Vec<u8>>) -> Step {
        let Some(inner) = self.inner.as_mut() else {
            return self.send(identifier, prefix);
        };

        let result = match &received {
            Some(data) => inner.process(self.driver.engine(), data),
            None => inner.start(self.driver.engine()),
        };
        let step = match result {
            Ok(step) => step,
            Err(e) => {
                warn!(error = %e, "inner authentication failed");
                return self.terminate(identifier, ClientStatus::Failed, e.code(), prefix);
            }
        };

        if step.status == ClientStatus::UserInputRequired {
            self.deferred = Some(match received {
                Some(data) => Deferred::Received(data),
                None => Deferred::Start,
            });
            if prefix.is_empty() {
                return Step::input_required(None);
            }
            // Finish the handshake now and answer the inner step later
            let mut output = self.send(identifier, prefix);
            output.status = ClientStatus::UserInputRequired;
            return output;
        }

        let TunnelStep {
            write,
            status,
            state,
        } = step;
        let mut message = prefix;
        if let Some(plaintext) = write {
            let engine = self.driver.engine_mut();
            if let Err(e) = engine.write(&plaintext) {
                warn!(error = %e, "tunnel write failed");
                return self.terminate(identifier, ClientStatus::Failed, e.code(), message);
            }
            message.extend(engine.take_outgoing());
        }

        if state == ClientState::Failure {
            info!(status = ?status, "inner authentication rejected");
            self.phase = TtlsPhase::Failure;
            self.status = status;
            let output = self.send(identifier, message);
            return Step::failure(output.response, status);
        }
        self.send(identifier, message)
    }

    fn on_outer_success(&mut self, identifier: u8) -> Step {
        match self.phase {
            TtlsPhase::Success | TtlsPhase::Failure => return self.current(None),
            TtlsPhase::TunnelEstablished => {}
            _ => {
                warn!(phase = ?self.phase, "EAP Success before the tunnel was established");
                self.phase = TtlsPhase::Failure;
                self.status = ClientStatus::Failed;
                return self.current(None);
            }
        }

        match self.driver.ensure_trust() {
            TrustOutcome::Ok => {}
            TrustOutcome::UserInputRequired => return self.reject(TrustFailure::Untrusted),
            TrustOutcome::Failed(failure) => return self.reject(failure),
        }

        let resumed = self.driver.resumed();
        if let Some(inner) = self.inner.as_mut() {
            if let Err(status) = inner.accept_success(identifier, resumed) {
                warn!(status = ?status, "EAP Success before inner authentication finished");
                self.phase = TtlsPhase::Failure;
                self.status = status;
                return self.current(None);
            }
        }

        info!(resumed, "authentication succeeded");
        self.phase = TtlsPhase::Success;
        self.status = ClientStatus::Ok;
        self.current(None)
    }

    fn on_outer_failure(&mut self) -> Step {
        if self.phase != TtlsPhase::Failure {
            info!(phase = ?self.phase, "EAP Failure received");
            self.phase = TtlsPhase::Failure;
            if self.status == ClientStatus::Ok {
                self.status = ClientStatus::Failed;
            }
        }
        self.current(None)
    }

    fn reject(&mut self, failure: TrustFailure) -> Step {
        self.driver.refuse(failure);
        self.last_error = Some(failure.code());
        self.phase = TtlsPhase::Failure;
        self.status = ClientStatus::SecurityError;
        self.current(None)
    }

    fn framing_error(&mut self, error: FragmentError) -> Step {
        warn!(error = %error, phase = ?self.phase, "EAP-TLS framing error");
        self.last_error = Some(FRAMING_ERROR);
        if self.phase == TtlsPhase::TunnelEstablished {
            self.phase = TtlsPhase::Failure;
            self.status = ClientStatus::Failed;
            return self.current(None);
        }
        Step::running(None)
    }

    /// Enter `Failure`, sending the final alert or an Ack
    fn terminate(&mut self, identifier: u8, status: ClientStatus, code: u32, alert: Vec<u8>) -> Step {
        self.last_error = Some(code);
        self.phase = TtlsPhase::Failure;
        self.status = status;
        self.deferred = None;
        let output = self.send(identifier, alert);
        Step::failure(output.response, status)
    }

    /// Queue a message and emit its first fragment; empty means Ack
    fn send(&mut self, identifier: u8, message: Vec<u8>) -> Step {
        if message.is_empty() {
            return self.ack(identifier);
        }
        self.writer.set_message(message);
        self.next_output(identifier)
    }

    /// Emit the next pending fragment, or an Ack when nothing is pending
    fn next_output(&mut self, identifier: u8) -> Step {
        if !self.writer.has_pending() {
            return self.ack(identifier);
        }
        match self
            .writer
            .next_fragment(identifier, self.mtu, self.method.eap_type())
        {
            Ok((packet, _more)) => self.current(Some(packet)),
            Err(e) => {
                warn!(error = %e, "fragmentation failed");
                self.last_error = Some(FRAMING_ERROR);
                self.phase = TtlsPhase::Failure;
                self.status = ClientStatus::Failed;
                self.current(None)
            }
        }
    }

    fn ack(&self, identifier: u8) -> Step {
        self.current(Some(
            EapTlsPacket::ack().to_eap_response(identifier, self.method.eap_type()),
        ))
    }

    /// Step reflecting the current phase
    fn current(&self, response: Option<EapPacket>) -> Step {
        match self.phase {
            TtlsPhase::Success => Step::success(response),
            TtlsPhase::Failure => Step::failure(response, self.status),
            _ => Step::running(response),
        }
    }

    /// Supply a password after [`ClientStatus::UserInputRequired`]
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.credentials.password = Some(password.into());
        if let Some(inner) = self.inner.as_mut() {
            inner.update_credentials(&self.credentials);
        }
    }

    /// Accept or reject a server chain the policy could not decide on
    pub fn set_trust_decision(&mut self, accepted: bool) {
        self.driver.confirm_trust(accepted);
    }

    pub fn phase(&self) -> TtlsPhase {
        self.phase
    }

    pub fn last_error(&self) -> Option<u32> {
        self.last_error.or(self.driver.last_error())
    }

    /// MSK and EMSK, available once authentication succeeded
    pub fn session_keys(&self) -> Option<&SessionKeys> {
        if self.phase != TtlsPhase::Success {
            return None;
        }
        self.driver.session_keys()
    }

    pub fn inner_auth_type(&self) -> Option<InnerAuthType> {
        self.inner.as_ref().map(InnerAuthEngine::auth_type)
    }

    pub fn engine(&self) -> &E {
        self.driver.engine()
    }
}

impl<E: TlsEngine> EapMethod for TtlsStateMachine<E> {
    fn eap_type(&self) -> EapType {
        self.method.eap_type()
    }

    fn process(&mut self, packet: &EapPacket) -> Step {
        TtlsStateMachine::process(self, packet)
    }

    fn require_properties(&self) -> Vec<PropertyKey> {
        let mut required = Vec::new();
        if self.credentials.username.is_empty() {
            required.push(PropertyKey::UserName);
        }
        if let Some(inner) = &self.inner {
            required.extend(inner.require_properties());
        }
        if self.driver.trust_pending() {
            required.push(PropertyKey::TrustDecision);
        }
        required
    }

    fn publish_properties(&self) -> PublishedProperties {
        let engine = self.driver.engine();
        PublishedProperties {
            negotiated_cipher: engine.negotiated_cipher(),
            session_resumed: self.driver.resumed(),
            server_certificates: self.driver.server_certificates().to_vec(),
            inner_eap_type: self.inner.as_ref().and_then(InnerAuthEngine::nested_type),
            trust_pending: self.driver.trust_pending(),
        }
    }

    fn session_key(&self) -> Option<Vec<u8>> {
        self.session_keys().map(|keys| keys.msk.clone())
    }

    fn update_credentials(&mut self, credentials: &Credentials) {
        if let Some(password) = &credentials.password {
            self.set_password(password.clone());
        }
    }
}
