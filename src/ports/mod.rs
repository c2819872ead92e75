pub mod dialer;
pub mod policy;
pub mod tracking;

pub use dialer::{Dial, Dialer};
pub use policy::TunnelPolicy;
pub use tracking::TrackingPort;
