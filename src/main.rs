use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use proma_gateway::api::{self, AppContext};
use proma_gateway::config::{Config, TlsConfig};
use proma_gateway::gateway::Gateway;
use proma_gateway::identity::JwtVerifier;
use proma_gateway::membership::MembershipAuthority;
use proma_gateway::registry::RoomRegistry;
use proma_gateway::store::MemoryStore;

/// Checks that the certificate chain and key are readable PEM before handing
/// the paths to warp, which would otherwise panic on them at startup.
fn tls_usable(tls: &TlsConfig) -> bool {
    fn open(path: &Path) -> Option<BufReader<File>> {
        match File::open(path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) => {
                warn!("Failed to open {}: {}", path.display(), e);
                None
            }
        }
    }

    let (Some(mut cert_reader), Some(mut key_reader)) = (open(&tls.cert_path), open(&tls.key_path))
    else {
        return false;
    };

    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>();
    match certs {
        Ok(certs) if !certs.is_empty() => {}
        Ok(_) => {
            warn!("No certificates found in {}", tls.cert_path.display());
            return false;
        }
        Err(e) => {
            warn!("Failed to parse certificate: {}", e);
            return false;
        }
    }

    match rustls_pemfile::private_key(&mut key_reader) {
        Ok(Some(_)) => true,
        Ok(None) => {
            warn!("No private key found in {}", tls.key_path.display());
            false
        }
        Err(e) => {
            warn!("Failed to parse private key: {}", e);
            false
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    if config.jwt_secret.is_empty() {
        error!("JWT_SECRET must be set");
        std::process::exit(1);
    }
    info!(
        "Room access is {:?}, last-admin guard {}",
        config.room_access,
        if config.last_admin_guard { "on" } else { "off" }
    );

    let store = Arc::new(MemoryStore::new());
    let authority = Arc::new(MembershipAuthority::new(store.clone(), config.last_admin_guard));
    let gateway = Arc::new(Gateway::new(
        Arc::new(RoomRegistry::new()),
        authority.clone(),
        store,
        config.room_access,
        config.persist_timeout,
    ));

    let routes = api::routes(Arc::new(AppContext {
        authority,
        gateway: gateway.clone(),
        verifier: Arc::new(JwtVerifier::new(&config.jwt_secret)),
        handshake_timeout: config.handshake_timeout,
    }));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    };

    match config.tls.as_ref().filter(|tls| tls_usable(tls)) {
        Some(tls) => {
            let (addr, server) = warp::serve(routes)
                .tls()
                .cert_path(&tls.cert_path)
                .key_path(&tls.key_path)
                .bind_with_graceful_shutdown(config.bind, shutdown);
            info!("Starting secure server (HTTPS/WSS) on {}", addr);
            server.await;
        }
        None => {
            if config.tls.is_some() {
                warn!("Failed to load TLS config, falling back to HTTP/WS");
            }
            let (addr, server) = warp::serve(routes).bind_with_graceful_shutdown(config.bind, shutdown);
            info!("Server starting on {}", addr);
            server.await;
        }
    }

    gateway.shutdown().await;
}
