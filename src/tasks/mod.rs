pub mod rollout;
pub mod train;
