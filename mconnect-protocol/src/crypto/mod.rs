//! Cryptographic material for the TLS upgrade

mod certificate;

pub use certificate::DeviceCertificate;
