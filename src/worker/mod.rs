//! The background worker side: cache generations, request routing and the
//! multi-instance lifecycle host.

pub mod cache;
pub mod clients;
pub mod controller;
pub mod network;
pub mod registration;
pub mod request;
pub mod routing;
pub mod script;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheStorage, DiskCacheStorage, MemoryCacheStorage};
pub use clients::{ClientId, ClientTable};
pub use controller::{CacheController, FetchOutcome, GenerationTag, ResponseSource};
pub use network::{HttpNetwork, Network};
pub use registration::{Registration, RegistrationStatus, WorkerHandle, WorkerMessage};
pub use request::{Request, RequestMode, Response, ResponseKind};
pub use routing::{Route, Router};
pub use script::{HttpScriptSource, ScriptSource, WorkerScript};
pub use state::{LifecycleEvent, WorkerState};
