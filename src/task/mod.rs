// Task lifecycle: dispatch-time snapshots, worker processes and their outcome

pub mod dispatch;
pub mod snapshot;
pub mod worker;

pub use dispatch::{DispatchRequest, Dispatcher};
