//! Route validation
//!
//! Validation stages wrap the rest of the plugin chain:
//!
//! ```text
//! [ ExtendedValidator ] -> [ EmbeddingValidator ] -> [ DeprecationValidation ]
//!     -> [ UpgradeValidation ] -> [ ... ]
//! ```
//!
//! The [`ExtendedValidator`] blocks routes that cannot be served and may be
//! disabled. The [`EmbeddingValidator`] always runs and blocks routes whose
//! values would corrupt the proxy configuration. The other stages only record
//! conditions on routes and always forward events.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cert;
mod deprecation;
mod embedding;
mod extended;
pub mod rules;
mod upgrade;

#[cfg(test)]
mod test_certs;

pub use self::{
    cert::{CertificateInfo, CertificateInspector, OpenSslInspector, SharedInspector, TlsError},
    deprecation::DeprecationValidation,
    embedding::EmbeddingValidator,
    extended::{ExtendedValidator, ExtendedValidatorMetrics, RouteRejected},
    rules::ValidationErrors,
    upgrade::{UpgradeMode, UpgradeValidation},
};
