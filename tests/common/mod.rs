#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc::{self, Receiver};
use std::thread;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{NameType, SslAcceptor, SslMethod};
use openssl::x509::{X509Builder, X509NameBuilder, X509};

/// Fixed reference instant used as "now" by the extraction tests.
pub const NOW: i64 = 1_790_000_000;
pub const DAY: i64 = 86_400;

/// Self-signed certificate with the given subject entries (`("CN", "x")`).
pub fn make_cert(subject: &[(&str, &str)], not_after: i64) -> (X509, PKey<Private>) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    for (field, value) in subject {
        name.append_entry_by_text(field, value).unwrap();
    }
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(not_after - 365 * DAY).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(not_after).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    (builder.build(), key)
}

pub fn pem(cert: &X509) -> String {
    String::from_utf8(cert.to_pem().unwrap()).unwrap()
}

/// A one-shot TLS server on 127.0.0.1 presenting `leaf` followed by `extra`.
///
/// The receiver yields the SNI name the client sent, if any.
pub fn spawn_tls_server(
    leaf: X509,
    key: PKey<Private>,
    extra: Vec<X509>,
) -> (SocketAddr, Receiver<Option<String>>) {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
    acceptor.set_private_key(&key).unwrap();
    acceptor.set_certificate(&leaf).unwrap();
    for cert in extra {
        acceptor.add_extra_chain_cert(cert).unwrap();
    }
    let acceptor = acceptor.build();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        if let Ok(tls) = acceptor.accept(stream) {
            let sni = tls.ssl().servername(NameType::HOST_NAME).map(str::to_string);
            let _ = tx.send(sni);
        }
    });

    (address, rx)
}
