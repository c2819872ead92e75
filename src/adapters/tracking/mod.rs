mod tracker;

pub use tracker::TunnelTracker;
