//! Operational subcommands.

use crate::{config::Config, Error};
use bastion_cache::DataSource;
use bastion_hardening::{
    abh::{extract_identity, Abh, ConnectionKind},
    pki::CertificateAuthority,
    sbh::Sbh,
    token::TokenIssuer,
};
use bastion_persistence::{fs::LocalReader, settings::YamlSettings, FileReader};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const CHECK_CMD: &str = "check";
pub const ABH_CMD: &str = "abh";
pub const SIGN_CMD: &str = "sign";
pub const TOKEN_CMD: &str = "token";

fn reader(config: &Config) -> Arc<dyn FileReader> {
    Arc::new(LocalReader::new(config.storage.clone()))
}

/// Load certificates, binary hashes, and secret blobs, then report what was found.
pub async fn check(config: &Config) -> Result<(), Error> {
    let context = CancellationToken::new();
    let _guard = context.clone().drop_guard();
    let reader = reader(config);
    let ca = CertificateAuthority::load(reader.clone(), &config.certificates).await?;
    let (roots, signers, servers) = ca.counts();
    info!(roots, signers, servers, names = ?ca.names(), "loaded certificates");

    let abh = Abh::new(
        context.clone(),
        DataSource::File(reader.clone()),
        config.cache(),
    )
    .await?;
    let sbh = Sbh::new(context, DataSource::File(reader), config.cache()).await?;
    let hashes = abh.cache().dump();
    for kind in ConnectionKind::ALL {
        info!(%kind, identities = hashes.len(kind), "loaded binary hashes");
    }
    info!(versions = sbh.cache().dump().len(), "loaded secret blobs");

    let mut registry = Registry::default();
    abh.cache().register(&mut registry, "abh");
    sbh.cache().register(&mut registry, "sbh");
    let mut metrics = String::new();
    encode(&mut metrics, &registry)?;
    println!("{metrics}");
    Ok(())
}

/// Storage path segment naming `identity`.
///
/// Agent identities are `version/os/arch`, other kinds are a bare version.
fn identity_path(kind: ConnectionKind, identity: &str) -> String {
    match kind {
        ConnectionKind::Agent => identity.to_string(),
        other => format!("{identity}/{other}"),
    }
}

/// Print the hashes accepted for a binary, one per line.
pub async fn abh(config: &Config, kind: ConnectionKind, identity: &str) -> Result<(), Error> {
    let context = CancellationToken::new();
    let _guard = context.clone().drop_guard();
    let (parsed, identity) = extract_identity(&identity_path(kind, identity))?;
    if parsed != kind {
        return Err(Error::InvalidConfig(format!(
            "{identity} is not a {kind} identity"
        )));
    }
    let abh = Abh::new(context, DataSource::File(reader(config)), config.cache()).await?;
    for hash in abh.get_abh(kind, &identity)? {
        println!("{}", hex::encode(hash));
    }
    Ok(())
}

fn read_pem(path: &PathBuf) -> Result<Vec<u8>, Error> {
    let raw = std::fs::read(path)?;
    Ok(pem::parse(raw)?.into_contents())
}

/// Sign a certificate signing request under the root at `root`.
pub async fn sign(
    config: &Config,
    root: &PathBuf,
    csr: &PathBuf,
    out: Option<&PathBuf>,
) -> Result<(), Error> {
    let ca = CertificateAuthority::load(reader(config), &config.certificates).await?;
    let ltac = ca.create_ltac_from_csr(&read_pem(root)?, &read_pem(csr)?)?;
    let encoded = pem::encode(&pem::Pem::new("CERTIFICATE", ltac));
    match out {
        Some(path) => {
            std::fs::write(path, encoded)?;
            info!(path = %path.display(), "wrote certificate");
        }
        None => print!("{encoded}"),
    }
    Ok(())
}

/// Issue a session token with the persisted token key.
pub fn token(config: &Config, agent_id: &str, kind: ConnectionKind) -> Result<(), Error> {
    let settings = YamlSettings::open(&config.settings)?;
    let issuer = TokenIssuer::from_settings(&settings)?;
    println!("{}", issuer.issue(agent_id, kind));
    Ok(())
}
