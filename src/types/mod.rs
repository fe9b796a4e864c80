// ABOUTME: Validated domain types shared across modules.
// ABOUTME: Deployment identifiers, DNS labels and image references.

mod dns_label;
mod ident;
mod image_ref;

pub use dns_label::{DnsLabel, DnsLabelError};
pub use ident::{DeploymentIdent, DeploymentIdentError};
pub use image_ref::{ImageRef, ParseImageRefError};
