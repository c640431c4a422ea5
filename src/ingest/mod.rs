pub mod chunker;
pub mod encoding;
pub mod fingerprint;
pub mod normalizer;
pub mod worker;
