//! The release tool: bump the version, collect notes, and rewrite the package
//! descriptor, version manifest, client version constant and worker
//! generation tag together.

pub mod draft;
pub mod plan;
pub mod rewrite;

pub use draft::{ReleaseDraft, collect_draft};
pub use plan::{AppliedRelease, FileChange, ReleasePlan, ReleaseTargets, plan_release};
