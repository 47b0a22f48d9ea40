use super::{Agent, Credentials};
use crate::{
    transport::{recv_timeout, send, Transport},
    wire::{self, MessageType, Status},
    Error, Phase, PhaseExt,
};
use bastion_persistence::AgentInfo;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Generate a key pair and a DER-encoded CSR for `agent_id`.
fn csr(agent_id: &str) -> Result<(Vec<u8>, KeyPair), Error> {
    let key = KeyPair::generate().map_err(|err| Error::Certificate(err.to_string()))?;
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, agent_id);
    params.distinguished_name = dn;
    let request = params
        .serialize_request(&key)
        .map_err(|err| Error::Certificate(err.to_string()))?;
    Ok((request.der().to_vec(), key))
}

impl Agent {
    /// Obtain credentials over the single-use `transport`.
    ///
    /// Waits until the server approves the agent, which may take a long time.
    pub async fn on_init_connect<T: Transport>(
        &self,
        context: &CancellationToken,
        transport: &T,
        info: &AgentInfo,
    ) -> Result<Credentials, Error> {
        let result = self.request_credentials(context, transport, info).await;
        if let Err(err) = transport.close().await {
            debug!(?err, "failed to close init connection");
        }
        match &result {
            Ok(_) => info!(agent_id = %self.identity.agent_id, "obtained credentials"),
            Err(err) => warn!(?err, agent_id = %self.identity.agent_id, "init connection failed"),
        }
        result
    }

    async fn request_credentials<T: Transport>(
        &self,
        context: &CancellationToken,
        transport: &T,
        info: &AgentInfo,
    ) -> Result<Credentials, Error> {
        let identity = &self.identity;
        let platform = identity
            .binary
            .platform
            .as_ref()
            .ok_or(Error::MissingField("platform"))
            .phase(Phase::InitRequest)?;
        let (csr, key) = csr(&identity.agent_id).phase(Phase::InitRequest)?;
        let request = wire::InitConnectionRequest {
            agent_id: identity.agent_id.clone(),
            agent_binary_id: Some(wire::AgentBinaryId {
                os: platform.os.clone(),
                arch: platform.arch.clone(),
                version: identity.version().to_string(),
            }),
            abh: identity.abh.clone(),
            csr,
            info: Some(info.into()),
        };
        send(
            context,
            transport,
            &wire::pack(MessageType::InitConnection, &request),
        )
        .await
        .phase(Phase::InitRequest)?;

        debug!(agent_id = %identity.agent_id, "waiting for credentials");
        let raw = recv_timeout(context, transport, self.cfg.init_response_timeout)
            .await
            .phase(Phase::InitResponse)?;
        let response: wire::InitConnectionResponse =
            wire::unpack(MessageType::InitConnection, &raw).phase(Phase::InitResponse)?;
        response
            .status
            .parse::<Status>()
            .and_then(Status::into_result)
            .phase(Phase::InitResponse)?;
        if response.ltac.is_empty() {
            return Err(Error::MissingField("ltac")).phase(Phase::InitResponse);
        }
        Ok(Credentials {
            ltac: response.ltac,
            key_pem: Zeroizing::new(key.serialize_pem()),
            sbh: response.sbh,
            ssa: response.ssa,
        })
    }
}
