mod dormancy;
mod stall_monitor;
mod upstream_poll;

pub use dormancy::DormancyManager;
pub use stall_monitor::StallMonitor;
pub use upstream_poll::UpstreamPoller;
