use super::Validator;
use crate::{
    abh::{AgentBinaryIdentity, ConnectionKind, PeerSocket, Platform},
    challenge,
    ping::Pinger,
    transport::{recv, send, Transport},
    wire::{self, MessageType, Status as WireStatus},
    Error, Phase, PhaseExt,
};
use bastion_persistence::AuthStatus;
use bastion_tunnel::TunnelConfig;
use rand::rngs::OsRng;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Facts about a live connection known before its handshake.
#[derive(Clone, Debug)]
pub struct ConnectionMetadata {
    /// Hex-encoded hash identifying the peer.
    pub agent_id: String,

    pub kind: ConnectionKind,

    /// TLS server name requested by the peer. Names the protocol version.
    pub server_name: String,

    /// Token identifying the server end of the connection.
    pub server_token: String,
}

/// What the peer announced during authentication.
struct Peer {
    version: String,
    platform: Option<Platform>,
}

impl PeerSocket for Peer {
    fn version(&self) -> &str {
        &self.version
    }

    fn platform(&self) -> Option<Platform> {
        self.platform.clone()
    }
}

fn failure(version: &str, status: WireStatus) -> Vec<u8> {
    wire::pack(
        MessageType::Authentication,
        &wire::AuthenticationResponse {
            sversion: version.to_string(),
            status: status.to_string(),
            ..Default::default()
        },
    )
}

/// Best effort: the handshake already failed.
async fn notify_failure<T: Transport>(
    context: &CancellationToken,
    socket: &T,
    version: &str,
    status: WireStatus,
) {
    if let Err(err) = send(context, socket, &failure(version, status)).await {
        debug!(?err, %status, "failed to notify peer of handshake failure");
    }
}

impl Validator {
    /// Run the handshake of a live connection.
    ///
    /// `configure_encryptor` receives the fresh tunnel key material before it is sent to the
    /// peer. Once the tunnel is confirmed, a started [Pinger] governed by `context` is handed to
    /// `configure_pinger`. The caller must route every pong it reads to [Pinger::process].
    pub async fn on_connect<T, E, P>(
        &self,
        context: &CancellationToken,
        socket: Arc<T>,
        metadata: &ConnectionMetadata,
        configure_encryptor: E,
        configure_pinger: P,
    ) -> Result<(), Error>
    where
        T: Transport,
        E: FnOnce(&TunnelConfig) -> Result<(), Error>,
        P: FnOnce(Pinger<T>),
    {
        debug!(agent_id = %metadata.agent_id, kind = %metadata.kind, "authenticating peer");
        let peer = self
            .authenticate(context, socket.as_ref(), metadata)
            .await
            .phase(Phase::Authentication)?;

        debug!(agent_id = %metadata.agent_id, "performing connection challenge");
        let identity = match self.challenge(context, socket.as_ref(), metadata, &peer).await {
            Ok(identity) => identity,
            Err(err) => {
                warn!(?err, agent_id = %metadata.agent_id, "connection challenge failed");
                notify_failure(context, socket.as_ref(), &peer.version, WireStatus::TunnelError)
                    .await;
                return Err(err).phase(Phase::Challenge);
            }
        };

        debug!(agent_id = %metadata.agent_id, "requesting connection start");
        self.start_tunnel(context, socket.as_ref(), metadata, configure_encryptor)
            .await
            .phase(Phase::TunnelSetup)?;

        let pinger = Pinger::new(
            context.clone(),
            socket,
            self.abh.clone(),
            metadata.kind,
            identity,
            &metadata.agent_id,
            self.cfg.ping.clone(),
        );
        pinger.start();
        configure_pinger(pinger);
        info!(agent_id = %metadata.agent_id, kind = %metadata.kind, "peer connected");
        Ok(())
    }

    async fn authenticate<T: Transport>(
        &self,
        context: &CancellationToken,
        socket: &T,
        metadata: &ConnectionMetadata,
    ) -> Result<Peer, Error> {
        let raw = match recv(context, socket).await {
            Ok(raw) => raw,
            Err(err) => {
                notify_failure(context, socket, "", WireStatus::InternalError).await;
                return Err(err);
            }
        };
        let (request, peer) = match parse_authentication(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                notify_failure(context, socket, "", WireStatus::Corrupted).await;
                return Err(err);
            }
        };
        if let Err(err) = self.check_record(metadata).await {
            notify_failure(context, socket, &peer.version, err.status()).await;
            return Err(err);
        }

        let mut atoken = request.atoken;
        if !self.tokens.is_valid(&atoken, &metadata.agent_id, metadata.kind) {
            debug!(agent_id = %metadata.agent_id, "reissuing session token");
            atoken = self.tokens.issue(&metadata.agent_id, metadata.kind);
        }
        let response = wire::AuthenticationResponse {
            atoken,
            stoken: metadata.server_token.clone(),
            sversion: peer.version.clone(),
            status: WireStatus::Authorized.to_string(),
        };
        send(
            context,
            socket,
            &wire::pack(MessageType::Authentication, &response),
        )
        .await?;
        Ok(peer)
    }

    /// Check the persisted authorization status of the peer.
    async fn check_record(&self, metadata: &ConnectionMetadata) -> Result<(), Error> {
        let record = self.store.find_agent_by_hash(&metadata.agent_id).await?;
        match record.map(|record| record.auth_status) {
            Some(AuthStatus::Authorized) => Ok(()),
            Some(AuthStatus::Blocked) => Err(Error::Blocked),
            Some(AuthStatus::Unauthorized) | None => Err(Error::Unauthorized),
        }
    }

    async fn challenge<T: Transport>(
        &self,
        context: &CancellationToken,
        socket: &T,
        metadata: &ConnectionMetadata,
        peer: &Peer,
    ) -> Result<AgentBinaryIdentity, Error> {
        let nonce = challenge::connection_challenge();
        let request = wire::ConnectionChallengeRequest {
            nonce: nonce.clone(),
        };
        send(
            context,
            socket,
            &wire::pack(MessageType::ConnectionChallenge, &request),
        )
        .await?;
        let raw = recv(context, socket).await?;
        let response: wire::ConnectionChallengeResponse =
            wire::unpack(MessageType::ConnectionChallenge, &raw)?;

        let identity = peer.binary_identity(metadata.kind)?;
        let candidates = self.abh.get_abh(metadata.kind, &identity)?;
        challenge::check_connection_challenge(
            &response.ct,
            &nonce,
            &metadata.agent_id,
            &candidates,
        )?;
        Ok(identity)
    }

    async fn start_tunnel<T, E>(
        &self,
        context: &CancellationToken,
        socket: &T,
        metadata: &ConnectionMetadata,
        configure_encryptor: E,
    ) -> Result<(), Error>
    where
        T: Transport,
        E: FnOnce(&TunnelConfig) -> Result<(), Error>,
    {
        let config = TunnelConfig::generate(self.cfg.tunnel_strength, &mut OsRng);
        configure_encryptor(&config)?;
        let request = wire::ConnectionStartRequest {
            tunnel_config: Some(wire::TunnelConfig::from(&config)),
            sbh: self.sbh.get(context, &metadata.server_name)?,
        };
        send(
            context,
            socket,
            &wire::pack(MessageType::ConnectionStart, &request),
        )
        .await?;
        let raw = recv(context, socket).await?;
        let _: wire::ConnectionStartResponse = wire::unpack(MessageType::ConnectionStart, &raw)?;
        Ok(())
    }
}

/// Decode an authentication request and the peer facts it announces.
fn parse_authentication(raw: &[u8]) -> Result<(wire::AuthenticationRequest, Peer), Error> {
    let request: wire::AuthenticationRequest = wire::unpack(MessageType::Authentication, raw)?;
    if request.aversion.is_empty() {
        return Err(Error::MissingField("aversion"));
    }
    let os = request
        .ainfo
        .as_ref()
        .ok_or(Error::MissingField("ainfo"))?
        .os
        .clone()
        .unwrap_or_default();
    let platform = (!os.kind.is_empty() && !os.arch.is_empty()).then(|| Platform {
        os: os.kind,
        arch: os.arch,
    });
    let peer = Peer {
        version: request.aversion.clone(),
        platform,
    };
    Ok((request, peer))
}
