//! Stratum method handlers
//!
//! Implements the server-side protocol conversation for both variants on
//! top of the session layer: subscribe/authorize/submit for V1,
//! setup/open-channel/submit for V2, job announcements, and retarget
//! pushes. One handler instance serves every connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use serde_json::{json, Value};

use orepool_core::{
    ConnectionId, Job, JobId, ProtocolVariant, RejectReason, ShareVerdict, Target,
};
use orepool_protocol::v1::{
    self, StratumNotification, StratumRequest, StratumResponse, SubmitParams, V1Method,
};
use orepool_protocol::v2::messages::*;
use orepool_protocol::Message;
use orepool_server::{
    ConnectionManager, DisconnectReason, Incoming, ServerError, Session, SessionHandler,
};

use crate::classifier;
use crate::jobs::JobProvider;
use crate::pipeline::{SubmitRequest, Submitter};
use crate::vardiff::{RetargetDecision, VardiffEngine};

/// Handler tuning
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Version string answered to client.get_version
    pub server_version: String,
    /// Consecutive invalid proofs from one session before its address is
    /// temporarily banned
    pub ban_after_invalid: u64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        HandlerConfig {
            server_version: "orepool/0.1.0".to_string(),
            ban_after_invalid: 50,
        }
    }
}

/// Protocol conversation driver shared by all sessions
pub struct StratumHandler {
    config: HandlerConfig,
    manager: Arc<ConnectionManager>,
    provider: Arc<JobProvider>,
    vardiff: Arc<VardiffEngine>,
    submitter: Submitter,

    /// Consecutive invalid-proof counts per session
    invalid_streaks: Mutex<HashMap<ConnectionId, u64>>,
}

impl StratumHandler {
    pub fn new(
        config: HandlerConfig,
        manager: Arc<ConnectionManager>,
        provider: Arc<JobProvider>,
        vardiff: Arc<VardiffEngine>,
        submitter: Submitter,
    ) -> Arc<StratumHandler> {
        Arc::new(StratumHandler {
            config,
            manager,
            provider,
            vardiff,
            submitter,
            invalid_streaks: Mutex::new(HashMap::new()),
        })
    }

    /// Push a job to every authorized session.
    ///
    /// The V1 notify line is extranonce-independent and shared; V2 frames
    /// carry a per-channel merkle root, so they are built per session.
    pub fn announce_job(&self, job: &Arc<Job>) {
        let v1_line = Bytes::from(
            StratumNotification::new(
                V1Method::Notify,
                v1::notify_params(
                    &job.id.to_hex(),
                    &job.prev_hash,
                    &job.coinbase_head,
                    &job.coinbase_tail,
                    &job.merkle_path,
                    job.version,
                    job.bits,
                    job.time_ceiling.saturating_sub(7200),
                    job.clean_jobs,
                ),
            )
            .to_line(),
        );

        let delivered = self.manager.broadcast_with(|session| {
            if !session.is_authorized() {
                return None;
            }
            match session.variant() {
                ProtocolVariant::V1 => Some(v1_line.clone()),
                ProtocolVariant::V2 => {
                    let channel_id = session.with_state(|s| s.channel_id)?;
                    Some(encode_frame(Message::NewMiningJob(NewMiningJob {
                        channel_id,
                        job_id: job.id.0,
                        version: job.version,
                        merkle_root: self.channel_merkle_root(session, job),
                        future_job: false,
                    })))
                }
            }
        });

        // Activate the job on V2 channels with the tip announcement
        self.manager.broadcast_with(|session| {
            if !session.is_authorized() || session.variant() != ProtocolVariant::V2 {
                return None;
            }
            let channel_id = session.with_state(|s| s.channel_id)?;
            Some(encode_frame(Message::SetNewPrevHash(SetNewPrevHash {
                channel_id,
                job_id: job.id.0,
                prev_hash: job.prev_hash,
                min_ntime: job.time_floor,
                nbits: job.bits,
            })))
        });

        debug!("job {} announced to {} sessions", job.id, delivered);
    }

    /// Ask V2 sessions to reconnect, sent ahead of a graceful shutdown
    pub fn announce_reconnect(&self, host: &str, port: u16) {
        let host = host.to_string();
        self.manager.broadcast_with(|session| {
            if session.variant() != ProtocolVariant::V2 {
                return None;
            }
            Some(encode_frame(Message::Reconnect(Reconnect {
                new_host: host.clone(),
                new_port: port,
            })))
        });
    }

    /// Merkle root for a standard channel: the extranonce is entirely the
    /// server-assigned prefix
    fn channel_merkle_root(&self, session: &Arc<Session>, job: &Job) -> [u8; 32] {
        let coinbase = job.build_coinbase(&session.extranonce1(), &[]);
        let txid = orepool_core::pow::sha256d(&coinbase);
        job.merkle_root(&txid)
    }

    /// Apply a retarget decision and push it to the peer
    fn push_retarget(&self, session: &Arc<Session>, decision: RetargetDecision) {
        session.with_state(|state| {
            state.share_target = decision.new_target;
            if let Some(class) = decision.reclassified {
                state.hardware = class;
            }
        });
        if let Some(class) = decision.reclassified {
            info!("{} reclassified as {}", session.id(), class);
        }

        let payload = match session.variant() {
            ProtocolVariant::V1 => Bytes::from(
                StratumNotification::new(
                    V1Method::SetDifficulty,
                    vec![json!(decision.new_target)],
                )
                .to_line(),
            ),
            ProtocolVariant::V2 => {
                let channel_id = match session.with_state(|s| s.channel_id) {
                    Some(channel_id) => channel_id,
                    None => return,
                };
                encode_frame(Message::SetTarget(SetTarget {
                    channel_id,
                    maximum_target: Target::from_difficulty(decision.new_target).to_le_bytes(),
                }))
            }
        };
        self.send_or_close(session, payload);
    }

    /// Queue a payload, closing the session when its egress overflows
    fn send_or_close(&self, session: &Arc<Session>, payload: Bytes) {
        match session.send(payload) {
            Ok(()) => {}
            Err(ServerError::EgressFull) => {
                warn!("{} egress overflow", session.id());
                session.close(DisconnectReason::SlowConsumer);
            }
            Err(_) => {}
        }
    }

    /// Track invalid proofs; sustained streams earn the address a ban
    fn note_invalid(&self, session: &Arc<Session>, reason: RejectReason) {
        if !matches!(reason, RejectReason::InvalidProof | RejectReason::LowDifficulty) {
            self.invalid_streaks.lock().unwrap().remove(&session.id());
            return;
        }
        let streak = {
            let mut streaks = self.invalid_streaks.lock().unwrap();
            let streak = streaks.entry(session.id()).or_insert(0);
            *streak += 1;
            *streak
        };
        if streak >= self.config.ban_after_invalid {
            warn!(
                "{} banned after {} consecutive invalid proofs",
                session.remote_addr().ip(),
                streak
            );
            self.manager.ban(session.remote_addr().ip());
            session.close(DisconnectReason::HandlerClosed);
        }
    }

    fn clear_invalid(&self, session: &Arc<Session>) {
        self.invalid_streaks.lock().unwrap().remove(&session.id());
    }

    /// Common submission path once the variant-specific shape is parsed
    async fn run_submission(
        &self,
        session: &Arc<Session>,
        job_id: JobId,
        extranonce2: Vec<u8>,
        ntime: u32,
        nonce: u32,
    ) -> Result<crate::pipeline::ShareOutcome, ServerError> {
        let worker = session.worker().unwrap_or_default();
        // The target snapshot taken here is what the share is credited at
        let share_target = session.share_target();
        let request = SubmitRequest {
            connection: session.id(),
            worker,
            remote_ip: session.remote_addr().ip(),
            extranonce1: session.extranonce1(),
            share_target,
            job_id,
            extranonce2,
            ntime,
            nonce,
        };
        let outcome = self
            .submitter
            .submit(request)
            .await
            .map_err(|e| ServerError::Handler(e.to_string()))?;

        match outcome.verdict {
            ShareVerdict::Accepted => {
                session
                    .accepted_shares
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.clear_invalid(session);
                if let Some(decision) = self.vardiff.record_share(session.id(), share_target) {
                    self.push_retarget(session, decision);
                }
            }
            ShareVerdict::Rejected(reason) => {
                session
                    .rejected_shares
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                // Stale shares still smooth the cadence estimate
                if reason == RejectReason::Stale {
                    if let Some(decision) = self.vardiff.record_share(session.id(), share_target) {
                        self.push_retarget(session, decision);
                    }
                }
                self.note_invalid(session, reason);
            }
        }
        Ok(outcome)
    }

    // ---- V1 ----

    async fn on_v1_request(
        &self,
        session: &Arc<Session>,
        request: StratumRequest,
    ) -> Result<(), ServerError> {
        let id = request.id.clone().unwrap_or(Value::Null);
        match request.method() {
            V1Method::Subscribe => self.v1_subscribe(session, id, &request.params),
            V1Method::Authorize => self.v1_authorize(session, id, &request.params),
            V1Method::Submit => self.v1_submit(session, id, &request.params).await,
            V1Method::GetTransactions => {
                self.reply(session, StratumResponse::ok(id, json!([])));
                Ok(())
            }
            V1Method::GetVersion => {
                self.reply(
                    session,
                    StratumResponse::ok(id, json!(self.config.server_version)),
                );
                Ok(())
            }
            method => {
                // Unknown or client-inappropriate method; connection stays open
                debug!("{} unsupported method {}", session.id(), method.as_str());
                self.reply(
                    session,
                    StratumResponse::err(id, 20, &format!("Unsupported method: {}", request.method)),
                );
                Ok(())
            }
        }
    }

    fn v1_subscribe(
        &self,
        session: &Arc<Session>,
        id: Value,
        params: &[Value],
    ) -> Result<(), ServerError> {
        let user_agent = params.first().and_then(|p| p.as_str()).map(str::to_string);
        let class = classifier::classify(None, user_agent.as_deref());
        session.with_state(|state| {
            state.subscribed = true;
            state.user_agent = user_agent.clone();
            state.hardware = class;
            state.share_target = class.profile().baseline_target;
        });
        trace!("{} subscribed as {}", session.id(), class);

        let result = v1::subscribe_result(
            session.subscription_id(),
            &session.extranonce1(),
            self.provider.extranonce2_size(),
        );
        self.reply(session, StratumResponse::ok(id, result));
        Ok(())
    }

    fn v1_authorize(
        &self,
        session: &Arc<Session>,
        id: Value,
        params: &[Value],
    ) -> Result<(), ServerError> {
        let worker = params.first().and_then(|p| p.as_str()).unwrap_or("");
        if worker.is_empty() {
            self.reply(
                session,
                StratumResponse::err(id, 24, "Worker name must not be empty"),
            );
            return Ok(());
        }

        session.authorize(worker);
        let class = session.with_state(|s| s.hardware);
        let target = self.vardiff.register(session.id(), class);
        session.with_state(|state| state.share_target = target);
        info!("{} authorized worker {}", session.id(), worker);

        self.reply(session, StratumResponse::ok(id, json!(true)));

        // Difficulty first, then the current job
        self.send_or_close(
            session,
            Bytes::from(
                StratumNotification::new(V1Method::SetDifficulty, vec![json!(target)]).to_line(),
            ),
        );
        if let Some(job) = self.provider.current_job() {
            let line = StratumNotification::new(
                V1Method::Notify,
                v1::notify_params(
                    &job.id.to_hex(),
                    &job.prev_hash,
                    &job.coinbase_head,
                    &job.coinbase_tail,
                    &job.merkle_path,
                    job.version,
                    job.bits,
                    job.time_floor,
                    true,
                ),
            )
            .to_line();
            self.send_or_close(session, Bytes::from(line));
        }
        Ok(())
    }

    async fn v1_submit(
        &self,
        session: &Arc<Session>,
        id: Value,
        params: &[Value],
    ) -> Result<(), ServerError> {
        let (subscribed, authorized) =
            session.with_state(|state| (state.subscribed, state.authorized));
        if !subscribed {
            self.reply(session, StratumResponse::err(id, 25, "Not subscribed"));
            return Ok(());
        }
        if !authorized {
            session
                .rejected_shares
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.reply(
                session,
                StratumResponse::reject(id, RejectReason::Unauthorized),
            );
            return Ok(());
        }

        let parsed = match SubmitParams::parse(params) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("{} malformed submit: {}", session.id(), e);
                self.reply(session, StratumResponse::err(id, 20, "Malformed submission"));
                return Ok(());
            }
        };
        let job_id = match JobId::from_hex(&parsed.job_id) {
            Ok(job_id) => job_id,
            Err(_) => {
                self.reply(
                    session,
                    StratumResponse::reject(id, RejectReason::UnknownJob),
                );
                return Ok(());
            }
        };

        let outcome = self
            .run_submission(session, job_id, parsed.extranonce2, parsed.ntime, parsed.nonce)
            .await?;

        let response = match outcome.verdict {
            ShareVerdict::Accepted => StratumResponse::ok(id, json!(true)),
            ShareVerdict::Rejected(reason) => StratumResponse::reject(id, reason),
        };
        self.reply(session, response);
        Ok(())
    }

    fn reply(&self, session: &Arc<Session>, response: StratumResponse) {
        self.send_or_close(session, Bytes::from(response.to_line()));
    }

    // ---- V2 ----

    async fn on_v2_message(
        &self,
        session: &Arc<Session>,
        message: Message,
    ) -> Result<(), ServerError> {
        match message {
            Message::SetupConnection(m) => self.v2_setup(session, m),
            Message::OpenStandardMiningChannel(m) => self.v2_open_channel(session, m),
            Message::SubmitSharesStandard(m) => self.v2_submit(session, m).await,
            Message::UpdateChannel(m) => self.v2_update_channel(session, m),
            Message::CloseChannel(m) => {
                debug!(
                    "{} closed channel {} ({})",
                    session.id(),
                    m.channel_id,
                    m.reason_code
                );
                session.close(DisconnectReason::HandlerClosed);
                Ok(())
            }
            other => {
                // Server-to-client kinds arriving inbound fail that message
                debug!(
                    "{} unexpected message type {:#04x}",
                    session.id(),
                    other.message_type()
                );
                Ok(())
            }
        }
    }

    fn v2_setup(
        &self,
        session: &Arc<Session>,
        m: SetupConnection,
    ) -> Result<(), ServerError> {
        if m.min_version > 2 || m.max_version < 2 {
            self.send_or_close(
                session,
                encode_frame(Message::SetupConnectionError(SetupConnectionError {
                    flags: m.flags,
                    error_code: "unsupported-protocol-version".to_string(),
                })),
            );
            return Ok(());
        }

        let agent = format!("{} {} {}", m.vendor, m.hardware_version, m.firmware);
        let class = classifier::classify(None, Some(&agent));
        session.with_state(|state| {
            state.subscribed = true;
            state.user_agent = Some(agent.trim().to_string());
            state.hardware = class;
            state.share_target = class.profile().baseline_target;
        });

        self.send_or_close(
            session,
            encode_frame(Message::SetupConnectionSuccess(SetupConnectionSuccess {
                used_version: 2,
                flags: 0,
            })),
        );
        Ok(())
    }

    fn v2_open_channel(
        &self,
        session: &Arc<Session>,
        m: OpenStandardMiningChannel,
    ) -> Result<(), ServerError> {
        if !session.with_state(|s| s.subscribed) {
            self.send_or_close(
                session,
                encode_frame(Message::OpenMiningChannelError(OpenMiningChannelError {
                    request_id: m.request_id,
                    error_code: "connection-not-setup".to_string(),
                })),
            );
            return Ok(());
        }
        if m.user_identity.is_empty() {
            self.send_or_close(
                session,
                encode_frame(Message::OpenMiningChannelError(OpenMiningChannelError {
                    request_id: m.request_id,
                    error_code: "invalid-user-identity".to_string(),
                })),
            );
            return Ok(());
        }

        session.authorize(&m.user_identity);
        // Declared hashrate refines the class picked at setup
        if m.nominal_hashrate > 0.0 {
            let class = classifier::classify_by_hashrate(m.nominal_hashrate as f64);
            session.with_state(|state| state.hardware = class);
        }
        let class = session.with_state(|s| s.hardware);
        let target = self.vardiff.register(session.id(), class);
        let channel_id = (session.id().0 & 0xffff_ffff) as u32;
        session.with_state(|state| {
            state.share_target = target;
            state.channel_id = Some(channel_id);
        });
        info!(
            "{} opened channel {} for {}",
            session.id(),
            channel_id,
            m.user_identity
        );

        self.send_or_close(
            session,
            encode_frame(Message::OpenStandardMiningChannelSuccess(
                OpenStandardMiningChannelSuccess {
                    request_id: m.request_id,
                    channel_id,
                    target: Target::from_difficulty(target).to_le_bytes(),
                    extranonce_prefix: session.extranonce1(),
                    group_channel_id: 0,
                },
            )),
        );

        // Hand the current job to the fresh channel
        if let Some(job) = self.provider.current_job() {
            self.send_or_close(
                session,
                encode_frame(Message::NewMiningJob(NewMiningJob {
                    channel_id,
                    job_id: job.id.0,
                    version: job.version,
                    merkle_root: self.channel_merkle_root(session, &job),
                    future_job: false,
                })),
            );
            self.send_or_close(
                session,
                encode_frame(Message::SetNewPrevHash(SetNewPrevHash {
                    channel_id,
                    job_id: job.id.0,
                    prev_hash: job.prev_hash,
                    min_ntime: job.time_floor,
                    nbits: job.bits,
                })),
            );
        }
        Ok(())
    }

    async fn v2_submit(
        &self,
        session: &Arc<Session>,
        m: SubmitSharesStandard,
    ) -> Result<(), ServerError> {
        let authorized_channel = session
            .with_state(|s| s.channel_id)
            .filter(|channel_id| *channel_id == m.channel_id)
            .is_some()
            && session.is_authorized();
        if !authorized_channel {
            session
                .rejected_shares
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.send_or_close(
                session,
                encode_frame(Message::SubmitSharesError(SubmitSharesError {
                    channel_id: m.channel_id,
                    sequence_number: m.sequence_number,
                    error_code: RejectReason::Unauthorized.v2_reason_tag().to_string(),
                })),
            );
            return Ok(());
        }

        let outcome = self
            .run_submission(session, JobId(m.job_id), Vec::new(), m.ntime, m.nonce)
            .await?;

        let response = match outcome.verdict {
            ShareVerdict::Accepted => Message::SubmitSharesSuccess(SubmitSharesSuccess {
                channel_id: m.channel_id,
                last_sequence_number: m.sequence_number,
                new_submits_accepted_count: 1,
                new_shares_sum: outcome.credited_difficulty,
            }),
            ShareVerdict::Rejected(reason) => Message::SubmitSharesError(SubmitSharesError {
                channel_id: m.channel_id,
                sequence_number: m.sequence_number,
                error_code: reason.v2_reason_tag().to_string(),
            }),
        };
        self.send_or_close(session, encode_frame(response));
        Ok(())
    }

    fn v2_update_channel(
        &self,
        session: &Arc<Session>,
        m: UpdateChannel,
    ) -> Result<(), ServerError> {
        if m.nominal_hashrate <= 0.0 {
            return Ok(());
        }
        let new_class = classifier::classify_by_hashrate(m.nominal_hashrate as f64);
        let (old_class, old_target) =
            session.with_state(|s| (s.hardware, s.share_target));
        if new_class == old_class {
            return Ok(());
        }

        let bumped = new_class.clamp_target(old_target);
        session.with_state(|state| {
            state.hardware = new_class;
            state.share_target = bumped;
        });
        info!("{} updated class to {}", session.id(), new_class);
        if bumped != old_target {
            self.send_or_close(
                session,
                encode_frame(Message::SetTarget(SetTarget {
                    channel_id: m.channel_id,
                    maximum_target: Target::from_difficulty(bumped).to_le_bytes(),
                })),
            );
        }
        Ok(())
    }
}

/// Serialize a message into egress-ready plaintext frame bytes
fn encode_frame(message: Message) -> Bytes {
    message.to_frame().encode().freeze()
}

#[async_trait]
impl SessionHandler for StratumHandler {
    async fn on_connect(&self, session: &Arc<Session>) {
        trace!("{} handler attached", session.id());
    }

    async fn on_frame(&self, session: &Arc<Session>, frame: Incoming) -> Result<(), ServerError> {
        match frame {
            Incoming::V1(request) => self.on_v1_request(session, request).await,
            Incoming::V2(message) => self.on_v2_message(session, message).await,
        }
    }

    async fn on_disconnect(&self, session: &Arc<Session>, reason: DisconnectReason) {
        trace!("{} handler detached ({})", session.id(), reason);
        self.vardiff.unregister(session.id());
        self.submitter.forget_session(session.id());
        self.invalid_streaks.lock().unwrap().remove(&session.id());
    }
}
