use super::Agent;
use crate::{
    challenge,
    ping::Pingee,
    token,
    transport::{recv, send, Transport},
    wire::{self, MessageType, Status},
    Error, Phase, PhaseExt,
};
use bastion_persistence::AgentInfo;
use bastion_tunnel::TunnelConfig;
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of a successful live connection handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// Session token to present on the next connection.
    pub atoken: String,

    /// Token identifying the server end.
    pub stoken: String,

    /// Protocol version acknowledged by the server.
    pub sversion: String,

    /// Secret blob of the protocol version.
    pub sbh: Vec<u8>,
}

/// Map the status of an authentication response to an error.
fn reported(status: &str) -> Result<(), Error> {
    status.parse::<Status>()?.into_result()
}

impl Agent {
    /// Run the handshake of a live connection.
    ///
    /// `atoken` is the session token of the previous connection, empty if none.
    /// `configure_encryptor` receives the tunnel key material chosen by the server before the
    /// tunnel is confirmed. A started [Pingee] governed by `context` is then handed to
    /// `configure_pingee`. The caller must route every ping it reads to [Pingee::process].
    pub async fn on_connect<T, E, P>(
        &self,
        context: &CancellationToken,
        socket: Arc<T>,
        atoken: &str,
        info: &AgentInfo,
        configure_encryptor: E,
        configure_pingee: P,
    ) -> Result<Session, Error>
    where
        T: Transport,
        E: FnOnce(&TunnelConfig) -> Result<(), Error>,
        P: FnOnce(Pingee<T>) -> Result<(), Error>,
    {
        let agent_id = &self.identity.agent_id;
        debug!(%agent_id, "authenticating");
        let response = self
            .authenticate(context, socket.as_ref(), atoken, info)
            .await
            .phase(Phase::Authentication)?;

        debug!(%agent_id, "answering connection challenge");
        self.answer_challenge(context, socket.as_ref())
            .await
            .phase(Phase::Challenge)?;

        let sbh = self
            .accept_tunnel(context, socket.as_ref(), configure_encryptor)
            .await
            .phase(Phase::TunnelSetup)?;

        let pingee = Pingee::new(
            context.clone(),
            socket,
            self.identity.key(),
            self.cfg.ping.clone(),
        );
        pingee.start();
        configure_pingee(pingee).phase(Phase::PingerStart)?;
        info!(%agent_id, sversion = %response.sversion, "connected");
        Ok(Session {
            atoken: response.atoken,
            stoken: response.stoken,
            sversion: response.sversion,
            sbh,
        })
    }

    async fn authenticate<T: Transport>(
        &self,
        context: &CancellationToken,
        socket: &T,
        atoken: &str,
        info: &AgentInfo,
    ) -> Result<wire::AuthenticationResponse, Error> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let request = wire::AuthenticationRequest {
            timestamp,
            atoken: atoken.to_string(),
            aversion: self.identity.version().to_string(),
            ainfo: Some(info.into()),
        };
        send(
            context,
            socket,
            &wire::pack(MessageType::Authentication, &request),
        )
        .await?;
        let raw = recv(context, socket).await?;
        let response: wire::AuthenticationResponse =
            wire::unpack(MessageType::Authentication, &raw)?;
        reported(&response.status)?;
        if !token::is_crc_valid(&response.atoken) || response.stoken.is_empty() {
            return Err(Error::InvalidToken);
        }
        Ok(response)
    }

    async fn answer_challenge<T: Transport>(
        &self,
        context: &CancellationToken,
        socket: &T,
    ) -> Result<(), Error> {
        let raw = recv(context, socket).await?;
        // The server reports a failed check where the challenge would be
        let request: wire::ConnectionChallengeRequest = match wire::open(&raw)? {
            (MessageType::ConnectionChallenge, _) => {
                wire::unpack(MessageType::ConnectionChallenge, &raw)?
            }
            (MessageType::Authentication, _) => return Err(rejection(&raw)),
            (got, _) => {
                return Err(Error::UnexpectedMessage {
                    expected: MessageType::ConnectionChallenge,
                    got,
                })
            }
        };
        let identity = &self.identity;
        let response = wire::ConnectionChallengeResponse {
            ct: challenge::respond(&request.nonce, &identity.agent_id, &identity.abh),
        };
        send(
            context,
            socket,
            &wire::pack(MessageType::ConnectionChallenge, &response),
        )
        .await
    }

    async fn accept_tunnel<T, E>(
        &self,
        context: &CancellationToken,
        socket: &T,
        configure_encryptor: E,
    ) -> Result<Vec<u8>, Error>
    where
        T: Transport,
        E: FnOnce(&TunnelConfig) -> Result<(), Error>,
    {
        let raw = recv(context, socket).await?;
        let request: wire::ConnectionStartRequest = match wire::open(&raw)? {
            (MessageType::ConnectionStart, _) => wire::unpack(MessageType::ConnectionStart, &raw)?,
            (MessageType::Authentication, _) => return Err(rejection(&raw)),
            (got, _) => {
                return Err(Error::UnexpectedMessage {
                    expected: MessageType::ConnectionStart,
                    got,
                })
            }
        };
        let config = request
            .tunnel_config
            .as_ref()
            .ok_or(Error::MissingField("tunnel_config"))?;
        let config = TunnelConfig::try_from(config)?;
        configure_encryptor(&config)?;
        send(
            context,
            socket,
            &wire::pack(MessageType::ConnectionStart, &wire::ConnectionStartResponse {}),
        )
        .await?;
        Ok(request.sbh)
    }
}

/// Error carried by a failure response received mid-handshake.
fn rejection(raw: &[u8]) -> Error {
    let response: wire::AuthenticationResponse =
        match wire::unpack(MessageType::Authentication, raw) {
            Ok(response) => response,
            Err(err) => return err,
        };
    match reported(&response.status) {
        Err(err) => err,
        Ok(()) => Error::UnexpectedMessage {
            expected: MessageType::ConnectionStart,
            got: MessageType::Authentication,
        },
    }
}
