//! Worker DTLS identity, ICE credential generation and validation of the
//! parameters clients send on connect.

use rand::Rng;
use vc_common::ortc;
use vc_common::{DtlsFingerprint, DtlsParameters, DtlsRole, IceParameters};
use webrtc::peer_connection::certificate::RTCCertificate;

use super::error::EngineError;

/// Shortest ICE username fragment allowed by RFC 8445.
const MIN_UFRAG_LEN: usize = 4;
/// Shortest ICE password allowed by RFC 8445.
const MIN_PASSWORD_LEN: usize = 22;

/// Certificate a worker presents on every transport it serves.
#[derive(Clone)]
pub struct DtlsIdentity {
    certificate: RTCCertificate,
    fingerprints: Vec<DtlsFingerprint>,
}

impl std::fmt::Debug for DtlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtlsIdentity")
            .field("fingerprints", &self.fingerprints)
            .finish_non_exhaustive()
    }
}

impl DtlsIdentity {
    /// Generate a fresh self-signed certificate.
    pub fn generate() -> Result<Self, EngineError> {
        let certificate = ortc::generate_certificate()?;
        let fingerprints = ortc::certificate_fingerprints(&certificate);
        Ok(Self {
            certificate,
            fingerprints,
        })
    }

    pub const fn certificate(&self) -> &RTCCertificate {
        &self.certificate
    }

    /// Fingerprints of the certificate.
    pub fn fingerprints(&self) -> &[DtlsFingerprint] {
        &self.fingerprints
    }

    /// Local DTLS parameters advertised to clients.
    pub fn parameters(&self) -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Auto,
            fingerprints: self.fingerprints.clone(),
        }
    }
}

/// Fresh ICE-lite credentials.
pub fn ice_parameters() -> IceParameters {
    let mut rng = rand::thread_rng();
    let ufrag: [u8; 8] = rng.gen();
    let password: [u8; 16] = rng.gen();
    IceParameters {
        username_fragment: hex::encode(ufrag),
        password: hex::encode(password),
        ice_lite: true,
    }
}

/// Validate the client's DTLS parameters. The handshake only verifies
/// `sha-256` fingerprints, so one must be present.
pub fn validate_remote(params: &DtlsParameters) -> Result<(), String> {
    if params.fingerprints.is_empty() {
        return Err("no fingerprints".to_string());
    }
    if let Some(bad) = params.fingerprints.iter().find(|f| !f.is_well_formed()) {
        return Err(format!("malformed {} fingerprint", bad.algorithm));
    }
    if !params
        .fingerprints
        .iter()
        .any(|f| f.algorithm.eq_ignore_ascii_case("sha-256"))
    {
        return Err("no sha-256 fingerprint".to_string());
    }
    if params.role == DtlsRole::Server {
        return Err("client must not take the DTLS server role".to_string());
    }
    Ok(())
}

/// Validate the client's ICE credentials.
pub fn validate_remote_ice(params: &IceParameters) -> Result<(), String> {
    if params.username_fragment.len() < MIN_UFRAG_LEN {
        return Err(format!(
            "username fragment shorter than {MIN_UFRAG_LEN} characters"
        ));
    }
    if params.password.len() < MIN_PASSWORD_LEN {
        return Err(format!("password shorter than {MIN_PASSWORD_LEN} characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(algorithm: &str, len: usize) -> DtlsFingerprint {
        DtlsFingerprint {
            algorithm: algorithm.into(),
            value: vec!["ab"; len].join(":"),
        }
    }

    #[test]
    fn test_identity_fingerprint_is_well_formed() {
        let identity = DtlsIdentity::generate().unwrap();
        let fp = &identity.fingerprints()[0];
        assert_eq!(fp.algorithm, "sha-256");
        assert!(fp.is_well_formed());
        assert_ne!(
            DtlsIdentity::generate().unwrap().fingerprints()[0].value,
            fp.value
        );
    }

    #[test]
    fn test_ice_parameters_are_fresh() {
        let a = ice_parameters();
        let b = ice_parameters();
        assert_eq!(a.username_fragment.len(), 16);
        assert_eq!(a.password.len(), 32);
        assert!(a.ice_lite);
        assert_ne!(a.password, b.password);
        assert!(validate_remote_ice(&a).is_ok());
    }

    #[test]
    fn test_validate_remote() {
        assert!(validate_remote(&DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![],
        })
        .is_err());

        assert!(validate_remote(&DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![fingerprint("sha-256", 32)],
        })
        .is_ok());

        assert!(validate_remote(&DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".into(),
                value: "nope".into(),
            }],
        })
        .is_err());
    }

    #[test]
    fn test_validate_remote_needs_sha256_and_client_role() {
        let sha1_only = DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![fingerprint("sha-1", 20)],
        };
        assert_eq!(
            validate_remote(&sha1_only).unwrap_err(),
            "no sha-256 fingerprint"
        );

        let server_role = DtlsParameters {
            role: DtlsRole::Server,
            fingerprints: vec![fingerprint("sha-256", 32)],
        };
        assert!(validate_remote(&server_role).is_err());
    }

    #[test]
    fn test_validate_remote_ice_lengths() {
        let short = IceParameters {
            username_fragment: "ab".into(),
            password: "x".repeat(22),
            ice_lite: false,
        };
        assert!(validate_remote_ice(&short).is_err());

        let weak = IceParameters {
            username_fragment: "abcd".into(),
            password: "x".repeat(21),
            ice_lite: false,
        };
        assert!(validate_remote_ice(&weak).is_err());
    }
}
