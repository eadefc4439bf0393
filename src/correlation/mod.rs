//! Request/response correlation by PDU reference.

mod registry;
mod waiter;

pub use registry::{IndicationReceiver, PendingRegistry, ResponseReceiver};
pub use waiter::PendingRequest;
