pub mod clock;
pub mod job;
pub mod metrics;
pub mod registry;
pub mod samples;
pub mod scheduler;
