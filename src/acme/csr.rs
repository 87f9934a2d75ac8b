//! Certificate key and signing request generation.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

/// A fresh certificate key and the CSR signed with it.
pub struct CertificateRequest {
    pub key_pem: String,
    pub csr_der: Vec<u8>,
}

impl std::fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("csr_len", &self.csr_der.len())
            .finish_non_exhaustive()
    }
}

/// CN is the first hostname; every hostname (the CN included) is a SAN.
pub fn generate(hostnames: &[String]) -> Result<CertificateRequest, rcgen::Error> {
    let key = KeyPair::generate()?;

    let mut params = CertificateParams::new(hostnames.to_vec())?;
    let mut name = DistinguishedName::new();
    if let Some(common_name) = hostnames.first() {
        name.push(DnType::CommonName, common_name.clone());
    }
    params.distinguished_name = name;

    let csr = params.serialize_request(&key)?;
    Ok(CertificateRequest {
        key_pem: key.serialize_pem(),
        csr_der: csr.der().as_ref().to_vec(),
    })
}
