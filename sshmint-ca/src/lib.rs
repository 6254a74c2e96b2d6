//! Certificate-authority destination for sshmint.
//!
//! Posts the JSON signing request built at issuance time to the configured
//! endpoint and returns the OpenSSH certificate from the `{"certificate":
//! "..."}` response.  Verifying that the certificate matches the submitted
//! key, and writing it out, is left to the publisher.

pub mod client;
pub mod error;

pub use client::HttpAuthority;
pub use error::CaError;
