//! Requests built by the hand-rolled DER encoder decode with a standard
//! PKCS#10 parser, for arbitrary printable ASCII identities.

use msi_identity::csr::{inspect, CsrBuilder, CsrEncoding};
use msi_identity::key::{KeyAlgorithm, KeyMaterial};
use proptest::prelude::*;
use std::sync::{Arc, OnceLock};

fn key(algorithm: KeyAlgorithm) -> Arc<KeyMaterial> {
    static RSA: OnceLock<Arc<KeyMaterial>> = OnceLock::new();
    static EC: OnceLock<Arc<KeyMaterial>> = OnceLock::new();

    let slot = match algorithm {
        KeyAlgorithm::Rsa => &RSA,
        KeyAlgorithm::EcdsaP256 => &EC,
    };
    slot.get_or_init(|| Arc::new(KeyMaterial::generate(algorithm).unwrap()))
        .clone()
}

fn identity() -> impl Strategy<Value = String> {
    // Up to 300 characters, so values cross the 127 byte short-form limit.
    "[ -~]{1,300}"
}

fn check(algorithm: KeyAlgorithm, client_id: &str, tenant_id: &str, cuid: &str) {
    let key = key(algorithm);
    let csr = CsrBuilder::new(CsrEncoding::Der)
        .build(client_id, tenant_id, cuid, &key)
        .unwrap();

    let summary = inspect(csr.der()).unwrap();
    assert_eq!(summary.common_name.as_deref(), Some(client_id));
    assert_eq!(summary.domain_component.as_deref(), Some(tenant_id));
    assert_eq!(summary.challenge_password.as_deref(), Some(cuid));
    assert_eq!(summary.public_key, key.public_key());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn ecdsa_requests_round_trip(
        client_id in identity(),
        tenant_id in identity(),
        cuid in identity(),
    ) {
        check(KeyAlgorithm::EcdsaP256, &client_id, &tenant_id, &cuid);
    }

    #[test]
    fn rsa_requests_round_trip(
        client_id in identity(),
        tenant_id in identity(),
        cuid in identity(),
    ) {
        check(KeyAlgorithm::Rsa, &client_id, &tenant_id, &cuid);
    }
}

#[test]
fn long_form_lengths_round_trip() {
    let long = "x".repeat(200);
    check(KeyAlgorithm::EcdsaP256, &long, &long, &long);
    check(KeyAlgorithm::Rsa, &long, &long, &long);
}

#[test]
fn native_and_der_agree_on_contents() {
    let key = key(KeyAlgorithm::EcdsaP256);
    let decode = |encoding| {
        let csr = CsrBuilder::new(encoding)
            .build("client-1", "tenant-1", r#"{"vmId":"vm-1"}"#, &key)
            .unwrap();
        inspect(csr.der()).unwrap()
    };

    assert_eq!(decode(CsrEncoding::Native), decode(CsrEncoding::Der));
}
