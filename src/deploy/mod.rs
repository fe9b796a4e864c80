// ABOUTME: Deployment lifecycle: deploy, undeploy, refresh and the rollback of failed deploys.
// ABOUTME: Exports the orchestrator, its error type and the host-wide lock.

mod error;
mod lock;
mod orchestrator;
mod refresh;
mod rollback;

pub use error::{DeployError, DeployErrorKind};
pub use lock::{DeployLock, LOCK_FILENAME, LockError, LockInfo};
pub use orchestrator::{DeployOptions, DeployOrchestrator};
pub use refresh::RefreshReport;
pub use rollback::{Compensation, RollbackPlan};
