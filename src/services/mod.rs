pub mod jobs;
pub mod polling;
pub mod storage;
pub mod supervisor;
