pub mod call;
pub mod router;
pub mod traits;

pub use router::EventRouter;
pub use traits::RelayEventHandler;
