//! Request/vehicle matching strategies.

pub mod batch;
pub mod fifo;
pub mod strategy;
pub mod types;

pub use batch::BatchMatching;
pub use fifo::FifoMatching;
pub use strategy::{has_free_seat, passes_filter, MatchContext, MatchStrategy};
pub use types::{MatchProposal, OpenRequest, PickupEstimate, VehicleCandidate};
