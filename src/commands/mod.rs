// ABOUTME: Command module aggregator for the offspot-demo CLI.
// ABOUTME: Re-exports lifecycle, refresh and status command handlers.

mod context;
mod lifecycle;
mod refresh;
mod status;

pub use context::Context;
pub use lifecycle::{deploy, prepare, toggle, undeploy};
pub use refresh::refresh;
pub use status::status;
