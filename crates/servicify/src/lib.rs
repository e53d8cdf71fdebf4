//! Offer a local callable as a network service and keep a registry informed
//! of it until told to stop.

pub mod config;
pub mod endpoint;
pub mod load;
pub mod manager;
pub mod offering;
pub mod package;
pub mod peer;
pub mod port;
pub mod registry;
pub mod target;
pub mod transport;

pub use config::Config;
pub use manager::OfferingManager;
pub use manager::ServiceHandle;
pub use manager::State;
pub use offering::OfferSpec;
pub use offering::Offering;
pub use target::Completion;
pub use target::Export;
pub use target::Target;
pub use target::TargetKind;
