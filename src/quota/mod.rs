mod tracker;

pub use tracker::QuotaTracker;
