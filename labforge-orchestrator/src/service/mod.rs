pub mod job;

pub use job::JobService;
