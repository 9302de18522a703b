pub mod head_profiler;
pub mod prof;
