use super::Validator;
use crate::{
    abh::{AgentBinaryIdentity, ConnectionKind},
    pki::{leaf_common_name, IAC_COMMON_NAME},
    transport::{recv_timeout, send, Transport},
    wire::{self, MessageType, Status as WireStatus},
    Error, Phase, PhaseExt,
};
use bastion_persistence::{AgentInfo, AgentRecord, AgentStore, Status, Upsert};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Transport-level facts about an init connection.
#[derive(Clone, Debug, Default)]
pub struct InitConnectionInfo {
    /// Remote address of the peer, as `host:port`.
    pub ip: String,

    /// TLS server name requested by the peer. Names the protocol version.
    pub server_name: String,

    /// Verified TLS chain of the peer, leaf first, DER encoded.
    pub peer_chain: Vec<Vec<u8>>,
}

/// Strip the port from `ip`.
fn host(ip: &str) -> Result<String, Error> {
    let addr: SocketAddr = ip
        .parse()
        .map_err(|err| Error::InvalidAddress(format!("{ip}: {err}")))?;
    Ok(addr.ip().to_string())
}

fn binary_identity(request: &wire::InitConnectionRequest) -> Result<AgentBinaryIdentity, Error> {
    let id = request
        .agent_binary_id
        .as_ref()
        .ok_or(Error::MissingField("agent_binary_id"))?;
    if id.version.is_empty() || id.os.is_empty() || id.arch.is_empty() {
        return Err(Error::MissingField("agent_binary_id"));
    }
    Ok(AgentBinaryIdentity::agent(&id.version, &id.os, &id.arch))
}

/// Refresh the connected date of `agent_id` every `interval` until `context` is cancelled.
async fn keep_connected(
    context: CancellationToken,
    store: Arc<dyn AgentStore>,
    agent_id: String,
    interval: Duration,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;

            _ = context.cancelled() => return,
            _ = ticker.tick() => {},
        }
        if let Err(err) = store.touch_connected_date(&agent_id).await {
            error!(?err, %agent_id, "failed to update connected date");
            return;
        }
    }
}

impl Validator {
    /// Bootstrap the credentials of an agent over the single-use `transport`.
    ///
    /// On success the agent receives its LTAC, the secret blob for the requested server name
    /// and an integrity script. On failure it receives a generic status, best effort. The
    /// transport is closed in both cases.
    pub async fn on_init_connect<T: Transport>(
        &self,
        context: &CancellationToken,
        transport: &T,
        info: &InitConnectionInfo,
    ) -> Result<(), Error> {
        let context = context.child_token();
        let _guard = context.clone().drop_guard();

        let result = match self.init(&context, transport, info).await {
            Ok(response) => {
                let message = wire::pack(MessageType::InitConnection, &response);
                send(&context, transport, &message)
                    .await
                    .phase(Phase::InitResponse)
            }
            Err(err) => {
                let response = wire::InitConnectionResponse {
                    status: err.status().to_string(),
                    ..Default::default()
                };
                let message = wire::pack(MessageType::InitConnection, &response);
                if let Err(send_err) = send(&context, transport, &message).await {
                    debug!(?send_err, "failed to report init connection failure");
                }
                Err(err)
            }
        };
        if let Err(err) = transport.close().await {
            warn!(?err, "failed to close init connection");
        }

        match &result {
            Ok(()) => info!(ip = %info.ip, "init connection succeeded"),
            Err(err) if err.is_expected() => info!(?err, ip = %info.ip, "init connection refused"),
            Err(err) => error!(?err, ip = %info.ip, "init connection failed"),
        }
        result
    }

    async fn init<T: Transport>(
        &self,
        context: &CancellationToken,
        transport: &T,
        info: &InitConnectionInfo,
    ) -> Result<wire::InitConnectionResponse, Error> {
        let raw = recv_timeout(context, transport, self.cfg.init_request_timeout)
            .await
            .phase(Phase::InitRequest)?;
        let request: wire::InitConnectionRequest =
            wire::unpack(MessageType::InitConnection, &raw).phase(Phase::InitRequest)?;
        let agent_id = request.agent_id.clone();
        info!(%agent_id, "agent is performing its initial connection");

        let identity = binary_identity(&request).phase(Phase::ValidateBinary)?;
        self.validate_binary(&identity, &request.abh)
            .phase(Phase::ValidateBinary)?;

        self.upsert_agent(&request, &identity, info)
            .await
            .phase(Phase::UpsertAgent)?;
        let liveness = context.child_token();
        tokio::spawn(keep_connected(
            liveness.clone(),
            self.store.clone(),
            agent_id.clone(),
            self.cfg.liveness_interval,
        ));

        let result = self.approve_and_issue(context, &request, info).await;
        liveness.cancel();
        debug!(%agent_id, "disconnecting agent");
        if let Err(err) = self
            .store
            .set_agent_status(&agent_id, Status::Disconnected)
            .await
        {
            error!(?err, %agent_id, "failed to set agent status to disconnected");
        }
        let ltac = result?;

        let sbh = self
            .sbh
            .get(context, &info.server_name)
            .phase(Phase::InitResponse)?;
        let ssa = self
            .scripts
            .generate(&agent_id)
            .phase(Phase::InitResponse)?;
        Ok(wire::InitConnectionResponse {
            ltac,
            sbh,
            ssa,
            status: WireStatus::Authorized.to_string(),
        })
    }

    fn validate_binary(&self, identity: &AgentBinaryIdentity, claimed: &[u8]) -> Result<(), Error> {
        let expected = self.abh.get_abh(ConnectionKind::Agent, identity)?;
        if !expected.iter().any(|hash| hash.as_slice() == claimed) {
            warn!(
                %identity,
                claimed = %hex::encode(claimed),
                "binary hash does not match the directory"
            );
            return Err(Error::AbhMismatch(identity.key()));
        }
        Ok(())
    }

    async fn upsert_agent(
        &self,
        request: &wire::InitConnectionRequest,
        identity: &AgentBinaryIdentity,
        info: &InitConnectionInfo,
    ) -> Result<(), Error> {
        let host = host(&info.ip)?;
        let agent_info = request
            .info
            .as_ref()
            .map(AgentInfo::from)
            .unwrap_or_default();
        let record = AgentRecord::connecting(
            &request.agent_id,
            &host,
            &identity.version,
            agent_info,
        );
        record
            .validate()
            .map_err(|err| Error::InvalidIdentity(format!("{}: {err}", request.agent_id)))?;
        match self.store.upsert_agent(record).await? {
            Upsert::Blocked => Err(Error::Blocked),
            outcome => {
                debug!(agent_id = %request.agent_id, ?outcome, "upserted agent");
                Ok(())
            }
        }
    }

    async fn approve_and_issue(
        &self,
        context: &CancellationToken,
        request: &wire::InitConnectionRequest,
        info: &InitConnectionInfo,
    ) -> Result<Vec<u8>, Error> {
        debug!(agent_id = %request.agent_id, "waiting for agent approval");
        self.approver
            .wait_for_auth(context, &request.agent_id)
            .await
            .phase(Phase::Approval)?;
        self.issue_credential(request, info)
            .phase(Phase::IssueCredential)
    }

    fn issue_credential(
        &self,
        request: &wire::InitConnectionRequest,
        info: &InitConnectionInfo,
    ) -> Result<Vec<u8>, Error> {
        let cn = leaf_common_name(&info.peer_chain)?;
        if cn.as_deref() != Some(IAC_COMMON_NAME) {
            return Err(Error::InvalidChain(format!(
                "expected leaf {IAC_COMMON_NAME:?}, got {cn:?}"
            )));
        }
        let name = self.ca.verify_chain(&info.peer_chain)?;
        let root = self.ca.root_certificate(&name)?;
        self.ca.create_ltac_from_csr(&root, &request.csr)
    }
}
