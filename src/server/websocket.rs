use crate::agent::ChatAgent;
use crate::auth::{ bearer_token, Authenticator };
use crate::cli::Args;
use crate::websocket::{ error_frame, handle_connection, Broadcaster };

use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::io::{ AsyncRead, AsyncWrite };

use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ Request, Response, ErrorResponse };
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_rustls::TlsAcceptor;

use rustls::ServerConfig;
use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls_pemfile::{ certs, pkcs8_private_keys };

use lazy_static::lazy_static;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };

use url::form_urlencoded;

use log::{ info, warn, error };
use futures::SinkExt;

const CONNECTIONS_PER_SECOND: NonZeroU32 = match NonZeroU32::new(10) {
    Some(n) => n,
    None => panic!("connection quota must be non-zero"),
};

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(CONNECTIONS_PER_SECOND));
}

/// Shared state every feed connection needs.
#[derive(Clone)]
pub struct FeedContext {
    pub agent: Arc<ChatAgent>,
    pub auth: Arc<Authenticator>,
    pub broadcaster: Broadcaster,
}

pub(crate) fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let key = match pkcs8_private_keys(&mut key_reader).next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

fn tls_acceptor(args: &Args) -> Result<Option<TlsAcceptor>, Box<dyn Error + Send + Sync>> {
    if !args.enable_tls {
        info!("TLS not enabled. Running plain WebSocket (WS) feed.");
        return Ok(None);
    }
    match (&args.tls_cert_path, &args.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            info!("TLS enabled. Loading certificate from '{}' and key from '{}'", cert_path, key_path);
            let config = load_tls_config(cert_path, key_path)?;
            Ok(Some(TlsAcceptor::from(config)))
        }
        (Some(_), None) | (None, Some(_)) => {
            error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
            Err("Missing TLS certificate or key path".into())
        }
        (None, None) => {
            error!("--enable-tls was set but no certificate/key paths provided.");
            Err("TLS enabled without cert/key".into())
        }
    }
}

pub async fn start_ws_server(
    addr: &str,
    context: FeedContext,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let tls_acceptor = tls_acceptor(&args)?;
    let listener = TcpListener::bind(addr).await?;
    let protocol = if tls_acceptor.is_some() { "wss" } else { "ws" };
    info!("{} feed listening on: {}", protocol.to_uppercase(), addr);

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming feed connection from: {}", peer);
        let context = context.clone();
        let tls_acceptor = tls_acceptor.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = tls_acceptor {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!("TLS handshake successful for {}", peer);
                        process_connection(peer, tls_stream, context).await
                    }
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                    }
                }
            } else {
                process_connection(peer, stream, context).await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

/// Bearer token from `?token=` or the `Authorization` header.
fn token_from_request(req: &Request) -> Option<String> {
    let from_query = req
        .uri()
        .query()
        .and_then(|qs| {
            form_urlencoded
                ::parse(qs.as_bytes())
                .find(|(key, _)| key == "token")
                .map(|(_, value)| value.into_owned())
        });

    from_query
        .or_else(|| {
            req.headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(bearer_token)
                .map(str::to_string)
        })
        .filter(|t| !t.trim().is_empty())
}

fn reject(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    context: FeedContext
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let mut presented: Option<String> = None;
    let auth = Arc::clone(&context.auth);

    // signature and expiry are checked here; the user lookup needs the async store
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match token_from_request(req) {
            Some(token) => {
                if let Err(e) = auth.verify(&token) {
                    warn!("Rejected feed handshake from {}: {}", peer, e);
                    return Err(reject("invalid token"));
                }
                presented = Some(token);
            }
            None if auth.require_auth() => {
                warn!("Rejected feed handshake from {}: missing token", peer);
                return Err(reject("missing token"));
            }
            None => {}
        }
        Ok(response)
    };

    let mut ws = match accept_hdr_async(stream, auth_callback).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            return Err(Box::new(e));
        }
    };

    let author = match context.auth.resolve_author(presented.as_deref()).await {
        Ok(author) => author,
        Err(e) => {
            warn!("Closing feed connection from {}: {}", peer, e);
            if let Some(frame) = error_frame(e.to_string()) {
                let _ = ws.send(frame).await;
            }
            let _ = ws.close(None).await;
            return Ok(());
        }
    };

    let feed = context.broadcaster.subscribe();
    handle_connection(peer, ws, context.agent, feed, author).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, authorization: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = authorization {
            builder = builder.header("authorization", value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn token_is_read_from_query_then_header() {
        assert_eq!(token_from_request(&request("/?token=abc", None)).as_deref(), Some("abc"));
        assert_eq!(
            token_from_request(&request("/?token=abc", Some("Bearer xyz"))).as_deref(),
            Some("abc")
        );
        assert_eq!(token_from_request(&request("/", Some("Bearer xyz"))).as_deref(), Some("xyz"));
        assert_eq!(token_from_request(&request("/", Some("bearer xyz"))).as_deref(), Some("xyz"));
        assert_eq!(token_from_request(&request("/?token=", None)), None);
        assert_eq!(token_from_request(&request("/", Some("Basic xyz"))), None);
    }

    #[test]
    fn rejections_are_unauthorized() {
        let response = reject("missing token");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.body().as_deref(), Some("missing token"));
    }

    #[test]
    fn tls_requires_both_paths() {
        use clap::Parser;
        let args = Args::parse_from(["groupchat-agent", "--enable-tls", "--tls-cert-path", "cert.pem"]);
        assert!(tls_acceptor(&args).is_err());

        let args = Args::parse_from(["groupchat-agent"]);
        assert!(tls_acceptor(&args).unwrap().is_none());
    }
}
