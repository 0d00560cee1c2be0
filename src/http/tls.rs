//! TLS acceptor construction with a curated cipher list.
use crate::error::HttpError;
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslOptions, SslVerifyMode};
use std::path::Path;

/// ECDHE-preferring, no NULL/anon/export/RC4/DES/MD5. SSLv2/SSLv3 are
/// disabled by requiring TLSv1.2 as the floor.
const CIPHER_LIST: &str =
    "ECDHE+AESGCM:ECDHE+CHACHA20:ECDHE+AES256:ECDHE+AES128:!aNULL:!eNULL:!EXPORT:!RC4:!DES:!MD5:!PSK";

/// Builds an acceptor from a single PEM file containing both certificate
/// and private key, as the control-plane listener config expects.
pub fn build_acceptor(certfile: &Path) -> Result<SslAcceptor, HttpError> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())
        .map_err(|e| HttpError::Tls(e.to_string()))?;

    builder
        .set_certificate_file(certfile, SslFiletype::PEM)
        .map_err(|e| HttpError::Tls(e.to_string()))?;
    builder
        .set_private_key_file(certfile, SslFiletype::PEM)
        .map_err(|e| HttpError::Tls(e.to_string()))?;
    builder
        .check_private_key()
        .map_err(|e| HttpError::Tls(e.to_string()))?;

    builder
        .set_cipher_list(CIPHER_LIST)
        .map_err(|e| HttpError::Tls(e.to_string()))?;
    builder.set_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3 | SslOptions::NO_TLSV1 | SslOptions::NO_TLSV1_1);
    builder.set_verify(SslVerifyMode::NONE);

    Ok(builder.build())
}
