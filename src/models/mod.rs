pub mod answer;
pub mod event;
pub mod job;
