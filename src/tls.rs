//! TLS sessions over rustls.
//!
//! [`RustlsConnectionFactory`] opens sessions through `tokio-postgres-rustls`. Server
//! certificates are checked against the webpki roots plus any roots added here, and a
//! validation callback may override that verdict. Client certificates come from a provider
//! that is asked again on every connect and reconnect.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pg_middleware::prelude::*;
//! use pg_middleware::tls::{ClientIdentity, RustlsConnectionFactory};
//!
//! # async fn demo() -> Result<(), SqlMiddlewareDbError> {
//! let factory = RustlsConnectionFactory::new()
//!     .with_root_certificates_pem(&std::fs::read("ca.pem").unwrap_or_default())?
//!     .with_client_certificates(|| {
//!         let cert = std::fs::read("client.pem").map_err(|e| SqlMiddlewareDbError::TlsError(e.to_string()))?;
//!         let key = std::fs::read("client.key").map_err(|e| SqlMiddlewareDbError::TlsError(e.to_string()))?;
//!         ClientIdentity::from_pem(&cert, &key).map(Some)
//!     });
//! let client = PgClient::connect_with_factory(
//!     "host=db.internal user=app dbname=app sslmode=require",
//!     Arc::new(factory),
//! )
//! .await?;
//! # let _ = client;
//! # Ok(()) }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::config::PostgresOptions;
use crate::connection::PgConnection;
use crate::error::SqlMiddlewareDbError;
use crate::executor::ConnectionFactory;

fn tls_error(msg: impl Into<String>) -> SqlMiddlewareDbError {
    SqlMiddlewareDbError::TlsError(msg.into())
}

/// Parse every certificate in PEM data.
///
/// # Errors
/// Returns `TlsError` if the PEM data is malformed.
pub fn load_pem_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, SqlMiddlewareDbError> {
    rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("failed to parse certificates: {e}")))
}

/// A client certificate chain and its private key.
pub struct ClientIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("certificates", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl ClientIdentity {
    /// Parse a PEM certificate chain and a PEM private key (PKCS#1, PKCS#8 or SEC1).
    ///
    /// # Errors
    /// Returns `TlsError` if either part is malformed or missing.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, SqlMiddlewareDbError> {
        let chain = load_pem_certificates(cert_pem)?;
        if chain.is_empty() {
            return Err(tls_error("no client certificate found in PEM data"));
        }
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| tls_error(format!("failed to parse private key: {e}")))?
            .ok_or_else(|| tls_error("no private key found in PEM data"))?;
        Ok(Self { chain, key })
    }
}

/// What a server-certificate validation callback is shown.
#[derive(Debug)]
pub struct ServerCertificate<'a> {
    pub end_entity: &'a CertificateDer<'a>,
    pub intermediates: &'a [CertificateDer<'a>],
    pub server_name: &'a ServerName<'a>,
    /// Why webpki verification rejected the chain; `None` when it passed.
    pub verification_error: Option<&'a rustls::Error>,
}

/// Decides whether a server certificate is accepted. Returning `true` accepts the
/// certificate even when `verification_error` is set.
pub type ServerCertificateCallback = Arc<dyn Fn(&ServerCertificate<'_>) -> bool + Send + Sync>;

/// Supplies the client certificate for a connect; `Ok(None)` connects without one.
pub type ClientCertificateProvider =
    Arc<dyn Fn() -> Result<Option<ClientIdentity>, SqlMiddlewareDbError> + Send + Sync>;

/// Runs webpki verification, then lets the callback have the final say.
struct CallbackVerifier {
    webpki: Arc<WebPkiServerVerifier>,
    callback: ServerCertificateCallback,
}

impl std::fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verdict =
            self.webpki
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);
        let certificate = ServerCertificate {
            end_entity,
            intermediates,
            server_name,
            verification_error: verdict.as_ref().err(),
        };
        if (self.callback)(&certificate) {
            return Ok(ServerCertVerified::assertion());
        }
        tracing::warn!(server = ?server_name, "server certificate rejected by validation callback");
        Err(verdict.err().unwrap_or_else(|| {
            rustls::Error::General("server certificate rejected by validation callback".to_string())
        }))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}

/// Opens TLS sessions. Whether TLS is required follows the config's `sslmode`.
#[derive(Clone)]
pub struct RustlsConnectionFactory {
    provider: Arc<CryptoProvider>,
    roots: RootCertStore,
    client_certificates: Option<ClientCertificateProvider>,
    server_validation: Option<ServerCertificateCallback>,
}

impl std::fmt::Debug for RustlsConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsConnectionFactory")
            .field("roots", &self.roots.len())
            .field("client_certificates", &self.client_certificates.is_some())
            .field("server_validation", &self.server_validation.is_some())
            .finish()
    }
}

impl Default for RustlsConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RustlsConnectionFactory {
    /// Trust the webpki roots, no client certificate, no validation callback.
    #[must_use]
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            roots,
            client_certificates: None,
            server_validation: None,
        }
    }

    /// Also trust `cert`, e.g. a private CA.
    ///
    /// # Errors
    /// Returns `TlsError` if the certificate is not a usable trust anchor.
    pub fn with_root_certificate(
        mut self,
        cert: CertificateDer<'static>,
    ) -> Result<Self, SqlMiddlewareDbError> {
        self.roots
            .add(cert)
            .map_err(|e| tls_error(format!("failed to add root certificate: {e}")))?;
        Ok(self)
    }

    /// Also trust every certificate in PEM data.
    ///
    /// # Errors
    /// Returns `TlsError` if the PEM data is malformed or a certificate is unusable.
    pub fn with_root_certificates_pem(self, pem: &[u8]) -> Result<Self, SqlMiddlewareDbError> {
        load_pem_certificates(pem)?
            .into_iter()
            .try_fold(self, Self::with_root_certificate)
    }

    #[must_use]
    pub fn with_client_certificates<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Result<Option<ClientIdentity>, SqlMiddlewareDbError> + Send + Sync + 'static,
    {
        self.client_certificates = Some(Arc::new(provider));
        self
    }

    #[must_use]
    pub fn with_server_certificate_validation<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ServerCertificate<'_>) -> bool + Send + Sync + 'static,
    {
        self.server_validation = Some(Arc::new(callback));
        self
    }

    /// Build the rustls configuration for one connect. The client-certificate provider is
    /// asked here.
    ///
    /// # Errors
    /// Returns `TlsError` for an unusable configuration or client certificate, or whatever the
    /// client-certificate provider returns.
    pub fn client_config(&self) -> Result<ClientConfig, SqlMiddlewareDbError> {
        let builder = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_error(format!("unsupported TLS protocol versions: {e}")))?;

        let builder = match &self.server_validation {
            Some(callback) => {
                let webpki = WebPkiServerVerifier::builder_with_provider(
                    Arc::new(self.roots.clone()),
                    Arc::clone(&self.provider),
                )
                .build()
                .map_err(|e| tls_error(format!("cannot build certificate verifier: {e}")))?;
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(CallbackVerifier {
                        webpki,
                        callback: Arc::clone(callback),
                    }))
            }
            None => builder.with_root_certificates(self.roots.clone()),
        };

        let identity = match &self.client_certificates {
            Some(provider) => provider()?,
            None => None,
        };
        match identity {
            Some(ClientIdentity { chain, key }) => builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| tls_error(format!("invalid client certificate: {e}"))),
            None => Ok(builder.with_no_client_auth()),
        }
    }
}

#[async_trait]
impl ConnectionFactory for RustlsConnectionFactory {
    async fn connect(&self, options: &PostgresOptions) -> Result<PgConnection, SqlMiddlewareDbError> {
        let config = options.connect_config()?;
        let tls = MakeRustlsConnect::new(self.client_config()?);
        tracing::debug!(
            hosts = ?config.get_hosts(),
            ssl_mode = ?config.get_ssl_mode(),
            "postgres tls connect start"
        );
        let (client, connection) = config.connect(tls).await?;
        Ok(PgConnection::from_parts(config, client, connection)
            .await?
            .with_close_grace(options.close_grace))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rustls::client::ResolvesClientCert;

    use super::*;

    fn self_signed() -> rcgen::CertifiedKey {
        rcgen::generate_simple_self_signed(vec!["db.internal".to_string()]).unwrap()
    }

    fn verifier(accept: bool, seen: Arc<Mutex<Vec<bool>>>) -> CallbackVerifier {
        let factory = RustlsConnectionFactory::new();
        let webpki = WebPkiServerVerifier::builder_with_provider(
            Arc::new(factory.roots.clone()),
            Arc::clone(&factory.provider),
        )
        .build()
        .unwrap();
        CallbackVerifier {
            webpki,
            callback: Arc::new(move |cert: &ServerCertificate<'_>| {
                seen.lock().unwrap().push(cert.verification_error.is_some());
                accept
            }),
        }
    }

    #[test]
    fn callback_overrides_webpki_verdict() {
        let certified = self_signed();
        let server = ServerName::try_from("db.internal").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let accepting = verifier(true, Arc::clone(&seen));
        assert!(accepting
            .verify_server_cert(certified.cert.der(), &[], &server, &[], UnixTime::now())
            .is_ok());

        let rejecting = verifier(false, Arc::clone(&seen));
        assert!(rejecting
            .verify_server_cert(certified.cert.der(), &[], &server, &[], UnixTime::now())
            .is_err());

        // a self-signed certificate never passes webpki on its own
        assert_eq!(*seen.lock().unwrap(), vec![true, true]);
    }

    #[test]
    fn client_identity_round_trips_through_pem() {
        let certified = self_signed();
        let identity = ClientIdentity::from_pem(
            certified.cert.pem().as_bytes(),
            certified.key_pair.serialize_pem().as_bytes(),
        )
        .unwrap();
        assert_eq!(identity.chain.len(), 1);

        assert!(matches!(
            ClientIdentity::from_pem(b"", certified.key_pair.serialize_pem().as_bytes()),
            Err(SqlMiddlewareDbError::TlsError(_))
        ));
        assert!(matches!(
            ClientIdentity::from_pem(certified.cert.pem().as_bytes(), b"not a key"),
            Err(SqlMiddlewareDbError::TlsError(_))
        ));
    }

    #[test]
    fn client_certificates_are_requested_per_config() {
        let certified = self_signed();
        let cert_pem = certified.cert.pem();
        let key_pem = certified.key_pair.serialize_pem();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let factory = RustlsConnectionFactory::new()
            .with_root_certificates_pem(cert_pem.as_bytes())
            .unwrap()
            .with_server_certificate_validation(|cert| cert.verification_error.is_none())
            .with_client_certificates(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                ClientIdentity::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).map(Some)
            });

        let config = factory.client_config().unwrap();
        assert!(config.client_auth_cert_resolver.has_certs());
        factory.client_config().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let plain = RustlsConnectionFactory::new().client_config().unwrap();
        assert!(!plain.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn provider_errors_abort_the_connect_config() {
        let factory = RustlsConnectionFactory::new()
            .with_client_certificates(|| Err(SqlMiddlewareDbError::TlsError("no token".into())));
        assert!(matches!(
            factory.client_config(),
            Err(SqlMiddlewareDbError::TlsError(msg)) if msg == "no token"
        ));
    }
}
